//! relay-node - runs either a learner's experience store or an aisrv tier

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use relay_aisrv::{GameServer, LearnerProxy, NodeConfig, NodeMode, SampleServer};
use relay_cluster::{assign, Topology};
use relay_common::telemetry::init_tracing;
use relay_common::VERSION;
use relay_store::{ExperienceStore, ExperienceWriter, ShardRouter, StoreClient, StoreClientConfig, StoreServer};
use relay_transport::proxy_queue;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(path.as_deref()).context("failed to load node configuration")?;
    init_tracing(config.log_level());

    let topology = assign(&config.cluster).context("invalid cluster shape")?;
    info!(
        version = VERSION,
        mode = ?config.mode,
        job_name = topology.job_name(),
        task_index = topology.task_index(),
        world_rank = topology.world_rank(),
        "Starting relay node"
    );

    if !config.addresses.learner_ips.is_empty() {
        let spec = config.addresses.cluster_spec(&topology)?;
        info!(cluster_spec = %spec.to_json()?, "Cluster spec");
    }

    match config.mode {
        NodeMode::Learner => run_learner(config, &topology).await,
        NodeMode::Aisrv => run_aisrv(config, &topology).await,
    }
}

async fn run_learner(config: NodeConfig, topology: &Topology) -> anyhow::Result<()> {
    let mut server_config = config.store_server.clone();
    if !config.addresses.learner_svr_ports.is_empty() {
        server_config.bind_addr = format!("0.0.0.0:{}", config.addresses.svr_port(topology)?);
    }

    let store = Arc::new(ExperienceStore::new(config.store.clone())?);
    let handle = StoreServer::new(store.clone(), server_config).start().await?;
    info!(addr = %handle.local_addr(), "Experience store ready");

    tokio::signal::ctrl_c().await?;
    info!(items = store.total_size(), inserts = store.insert_stats(), "Shutting down");
    handle.stop().await;
    Ok(())
}

async fn run_aisrv(config: NodeConfig, topology: &Topology) -> anyhow::Result<()> {
    let store_addr = if config.addresses.learner_ips.is_empty() {
        config.store_client.addr.clone()
    } else {
        config.addresses.learner_endpoint(topology)?
    };
    let router = Arc::new(ShardRouter::from_config(&config.store));

    let proxies: Vec<Arc<LearnerProxy>> = (0..config.proxy_count)
        .map(|id| {
            let writer: Arc<dyn ExperienceWriter> = Arc::new(StoreClient::new(StoreClientConfig {
                addr: store_addr.clone(),
                ..config.store_client.clone()
            }));
            Arc::new(LearnerProxy::spawn(id, config.proxy.clone(), writer, router.clone()))
        })
        .collect();
    info!(%store_addr, proxies = proxies.len(), "Learner proxies started");

    let (events, events_rx) = proxy_queue(config.sample_server.events.clone());
    let sample_server = SampleServer::new(config.sample_server.clone(), proxies.clone())?;
    let exit = Arc::new(AtomicBool::new(false));
    let sample_task = tokio::spawn(sample_server.run(events_rx, exit.clone()));

    let game_server = GameServer::new(config.game_server.clone(), events).start().await?;
    info!(addr = %game_server.local_addr(), "Aisrv ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    game_server.stop().await;
    exit.store(true, Ordering::Release);
    if let Err(e) = sample_task.await {
        warn!(error = %e, "Sample server task failed");
    }
    for proxy in &proxies {
        proxy.stop().await;
        info!(proxy = proxy.id(), stats = ?proxy.stats().snapshot(), "Learner proxy drained");
    }
    Ok(())
}
