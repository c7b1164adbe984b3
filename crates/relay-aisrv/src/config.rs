//! Node configuration
//!
//! Loaded from an optional TOML file overlaid with `RELAY__*` environment variables,
//! e.g. `RELAY__CLUSTER__NODE_INDEX=2` or `RELAY__STORE__TABLE_COUNT=4`.

use std::path::Path;

use relay_cluster::{ClusterAddresses, ClusterShape};
use relay_common::{RelayError, Result};
use relay_store::{StoreClientConfig, StoreConfig, StoreServerConfig};
use serde::{Deserialize, Serialize};

use crate::game_server::GameServerConfig;
use crate::learner_proxy::ProxyConfig;
use crate::sample_server::SampleServerConfig;

/// What this process runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Experience store server
    #[default]
    Learner,
    /// Game server, sample server and learner proxies
    Aisrv,
}

/// Full configuration of a relay node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mode: NodeMode,
    pub log_level: Option<String>,
    pub cluster: ClusterShape,
    pub addresses: ClusterAddresses,
    pub store: StoreConfig,
    pub store_server: StoreServerConfig,
    pub store_client: StoreClientConfig,
    pub game_server: GameServerConfig,
    pub sample_server: SampleServerConfig,
    pub proxy: ProxyConfig,
    /// Learner proxies started by an aisrv node
    pub proxy_count: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: NodeMode::default(),
            log_level: None,
            cluster: ClusterShape::default(),
            addresses: ClusterAddresses::default(),
            store: StoreConfig::default(),
            store_server: StoreServerConfig::default(),
            store_client: StoreClientConfig::default(),
            game_server: GameServerConfig::default(),
            sample_server: SampleServerConfig::default(),
            proxy: ProxyConfig::default(),
            proxy_count: 1,
        }
    }
}

impl NodeConfig {
    /// Load from `path` (if given) and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: NodeConfig = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RelayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster.validate()?;
        self.addresses.validate(&self.cluster)?;
        self.sample_server.aggregator.validate()?;
        if self.mode == NodeMode::Aisrv && self.proxy_count == 0 {
            return Err(RelayError::Config("proxy_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}
