//! TCP front end of the experience store
//!
//! One task per client connection; each frame carries one [`StoreRequest`] and is
//! answered with exactly one [`StoreResponse`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_common::{Result, StoreError};
use relay_transport::{Connection, ConnectionConfig};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{decode, encode, Codec, StoreRequest, StoreResponse};
use crate::store::ExperienceStore;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreServerConfig {
    pub bind_addr: String,
    /// Idle clients are kept open, so the default socket timeout is disabled
    pub connection: ConnectionConfig,
    pub codec: Codec,
}

impl Default for StoreServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9001".to_string(),
            connection: ConnectionConfig {
                io_timeout_ms: 0,
                ..ConnectionConfig::default()
            },
            codec: Codec::Raw,
        }
    }
}

/// Experience store server
pub struct StoreServer {
    store: Arc<ExperienceStore>,
    config: StoreServerConfig,
}

/// Running server; dropping it does not stop the accept loop, call `stop`
pub struct StoreServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl StoreServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!(error = %e, "Store server task failed");
        }
    }
}

impl StoreServer {
    pub fn new(store: Arc<ExperienceStore>, config: StoreServerConfig) -> Self {
        Self { store, config }
    }

    /// Bind and start serving in the background
    pub async fn start(self) -> Result<StoreServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());

        info!(%local_addr, tables = ?self.store.table_names(), "Experience store server listening");

        let task = tokio::spawn(self.accept_loop(listener, shutdown.clone()));
        Ok(StoreServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Experience store server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Store client connected");
                        let store = self.store.clone();
                        let config = self.config.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(store, stream, config).await {
                                warn!(%peer, error = %e, "Store connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    store: Arc<ExperienceStore>,
    stream: TcpStream,
    config: StoreServerConfig,
) -> Result<()> {
    stream.set_nodelay(config.connection.nodelay)?;
    let mut conn = Connection::new(stream, config.connection);

    loop {
        let request: StoreRequest = match conn.recv().await? {
            Some(payload) => decode(payload)?,
            None => {
                debug!("Store client disconnected");
                return Ok(());
            }
        };
        let response = handle_request(&store, request).await;
        conn.send(&encode(&response, config.codec)?).await?;
    }
}

/// Execute one request against the store
pub async fn handle_request(store: &ExperienceStore, request: StoreRequest) -> StoreResponse {
    let kind = request.kind();
    let result: std::result::Result<StoreResponse, StoreError> = match request {
        StoreRequest::Write {
            batch_id,
            table,
            records,
            priorities,
            timeout_ms,
        } => match store
            .write(&table, records, &priorities, timeout_ms.map(Duration::from_millis))
            .await
        {
            Ok(count) => Ok(StoreResponse::Written { batch_id, count }),
            Err(StoreError::PartialWrite {
                written,
                total,
                reason,
                ..
            }) => Ok(StoreResponse::PartiallyWritten {
                batch_id,
                count: written,
                total,
                message: reason,
            }),
            Err(e) => Err(e),
        },
        StoreRequest::Sample {
            table,
            batch_size,
            timeout_ms,
        } => store
            .sample(&table, batch_size, timeout_ms.map(Duration::from_millis))
            .await
            .map(|items| StoreResponse::Batch { items }),
        StoreRequest::ServerInfo { table } => store
            .server_info(table.as_deref())
            .map(|tables| StoreResponse::Info { tables }),
        StoreRequest::Reset { table } => store.reset(&table).map(|_| StoreResponse::ResetDone),
    };

    result.unwrap_or_else(|e| {
        debug!(request = kind, error = %e, "Store request failed");
        StoreResponse::Error {
            message: e.to_string(),
        }
    })
}
