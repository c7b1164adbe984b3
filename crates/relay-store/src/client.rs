//! Network client for the experience store
//!
//! Connects lazily on first use and drops the connection after any failed call, so the
//! next call reconnects.

use std::time::Duration;

use relay_common::{RelayError, StoreError, TrainingRecord};
use relay_transport::{Connection, ConnectionConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::protocol::{decode, encode, Codec, StoreRequest, StoreResponse};
use crate::table::{SampledItem, TableInfo};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreClientConfig {
    /// `host:port` of the store server
    pub addr: String,
    pub connection: ConnectionConfig,
    /// Compress requests
    pub codec: Codec,
    /// How long the server may hold a write on the rate limiter
    pub write_timeout_ms: Option<u64>,
}

impl Default for StoreClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9001".to_string(),
            connection: ConnectionConfig::default(),
            codec: Codec::Raw,
            write_timeout_ms: Some(10_000),
        }
    }
}

/// Experience store client
pub struct StoreClient {
    config: StoreClientConfig,
    conn: Mutex<Option<Connection>>,
}

fn connection_error(err: RelayError) -> StoreError {
    StoreError::Connection(err.to_string())
}

impl StoreClient {
    pub fn new(config: StoreClientConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn call(&self, request: StoreRequest) -> Result<StoreResponse, StoreError> {
        let payload = encode(&request, self.config.codec).map_err(connection_error)?;

        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let conn = Connection::connect(&self.config.addr, self.config.connection.clone())
                .await
                .map_err(connection_error)?;
            debug!(addr = %self.config.addr, "Connected to experience store");
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Connection("not connected".into()));
        };

        let result = async {
            conn.send(&payload).await?;
            match conn.recv().await? {
                Some(reply) => decode::<StoreResponse>(reply),
                None => Err(StoreError::Connection("store closed the connection".into()).into()),
            }
        }
        .await;

        match result {
            Ok(StoreResponse::Error { message }) => Err(StoreError::Remote(message)),
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(addr = %self.config.addr, error = %e, "Store call failed, dropping connection");
                *guard = None;
                Err(match e {
                    RelayError::Store(err) => err,
                    other => connection_error(other),
                })
            }
        }
    }

    fn unexpected(response: StoreResponse) -> StoreError {
        StoreError::Remote(format!("unexpected response {response:?}"))
    }

    /// Write records to `table`; returns the number written
    #[instrument(skip(self, records, priorities), fields(count = records.len()))]
    pub async fn write(
        &self,
        table: &str,
        records: Vec<TrainingRecord>,
        priorities: &[f64],
    ) -> Result<usize, StoreError> {
        let request = StoreRequest::Write {
            batch_id: Uuid::new_v4(),
            table: table.to_string(),
            records,
            priorities: priorities.to_vec(),
            timeout_ms: self.config.write_timeout_ms,
        };
        match self.call(request).await? {
            StoreResponse::Written { count, .. } => Ok(count),
            StoreResponse::PartiallyWritten {
                count, total, message, ..
            } => Err(StoreError::PartialWrite {
                table: table.to_string(),
                written: count,
                total,
                reason: message,
            }),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn sample(
        &self,
        table: &str,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>, StoreError> {
        let request = StoreRequest::Sample {
            table: table.to_string(),
            batch_size,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        };
        match self.call(request).await? {
            StoreResponse::Batch { items } => Ok(items),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Info for one table, or every table when `table` is `None`
    pub async fn server_info(&self, table: Option<&str>) -> Result<Vec<TableInfo>, StoreError> {
        let request = StoreRequest::ServerInfo {
            table: table.map(str::to_string),
        };
        match self.call(request).await? {
            StoreResponse::Info { tables } => Ok(tables),
            other => Err(Self::unexpected(other)),
        }
    }

    pub async fn reset(&self, table: &str) -> Result<(), StoreError> {
        let request = StoreRequest::Reset {
            table: table.to_string(),
        };
        match self.call(request).await? {
            StoreResponse::ResetDone => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }
}
