//! Game-client socket server
//!
//! Game clients send framed, bincode-encoded [`ClientMessage`]s. Each connection gets a
//! message buffer: the socket task hands every message to a helper task, which forwards
//! the events to the sample server and answers with a [`ServerReply`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_common::{ProtocolError, QueueError, RelayError, Result};
use relay_transport::{
    message_buffer, BufferWorker, Connection, ConnectionConfig, OverflowPolicy, QueueConfig, QueueSender,
};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::sample_server::SampleEvent;

/// One frame from a game client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub seq: u64,
    pub events: Vec<SampleEvent>,
}

/// Answer to a [`ClientMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReply {
    pub seq: u64,
    /// Events handed to the sample server
    pub accepted: usize,
}

/// Game server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameServerConfig {
    pub bind_addr: String,
    pub connection: ConnectionConfig,
    /// Request/response buffer between the socket and helper tasks
    pub buffer: QueueConfig,
    /// How long one client message may wait, across all its events, for room in the
    /// sample server queue. Must stay below the buffer's wait budget.
    pub event_timeout_ms: u64,
}

impl Default for GameServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            connection: ConnectionConfig {
                io_timeout_ms: 0,
                ..ConnectionConfig::default()
            },
            buffer: QueueConfig {
                capacity: 16,
                ..QueueConfig::default()
            },
            event_timeout_ms: 100,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::Decode(e.to_string()).into())
}

pub struct GameServer {
    config: GameServerConfig,
    events: QueueSender<SampleEvent>,
}

/// Running game server
pub struct GameServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl GameServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!(error = %e, "Game server task failed");
        }
    }
}

impl GameServer {
    pub fn new(config: GameServerConfig, events: QueueSender<SampleEvent>) -> Self {
        Self { config, events }
    }

    pub async fn start(self) -> Result<GameServerHandle> {
        let budget = self.config.buffer.wait_budget();
        if Duration::from_millis(self.config.event_timeout_ms) >= budget {
            return Err(RelayError::Config(format!(
                "event_timeout_ms {} must be below the buffer wait budget of {}ms",
                self.config.event_timeout_ms,
                budget.as_millis()
            )));
        }
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        info!(%local_addr, "Game server listening");

        let task = tokio::spawn(self.accept_loop(listener, shutdown.clone()));
        Ok(GameServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Game server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Game client connected");
                        let config = self.config.clone();
                        let events = self.events.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, config, events).await {
                                warn!(%peer, error = %e, "Game client session ended with error");
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

async fn serve_client(stream: TcpStream, config: GameServerConfig, events: QueueSender<SampleEvent>) -> Result<()> {
    stream.set_nodelay(config.connection.nodelay)?;
    let mut conn = Connection::new(stream, config.connection.clone());
    let (mut client, worker) = message_buffer::<ClientMessage, ServerReply>(config.buffer.clone());
    let timeout = Duration::from_millis(config.event_timeout_ms);
    let helper = tokio::spawn(forward_events(worker, events, timeout));

    let result: Result<()> = async {
        loop {
            let message: ClientMessage = match conn.recv().await? {
                Some(payload) => decode(payload)?,
                None => {
                    debug!("Game client closed the connection");
                    return Ok(());
                }
            };
            let reply = client.exchange(message).await?;
            conn.send(&bincode::serialize(&reply)?).await?;
        }
    }
    .await;

    client.stop();
    if let Err(e) = helper.await {
        error!(error = %e, "Game client helper task failed");
    }
    result
}

/// Helper side of a connection: push events to the sample server, then reply.
///
/// All events of one message share a single `timeout`; once it is spent the rest are
/// only queued if there is room right away.
async fn forward_events(
    mut worker: BufferWorker<ClientMessage, ServerReply>,
    events: QueueSender<SampleEvent>,
    timeout: Duration,
) {
    loop {
        let message = match worker.next_request().await {
            Ok(message) => message,
            Err(QueueError::Empty { .. }) => continue,
            Err(_) => break,
        };

        let deadline = Instant::now() + timeout;
        let mut accepted = 0;
        for event in message.events {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let policy = if remaining.is_zero() {
                OverflowPolicy::DropOnFull
            } else {
                OverflowPolicy::BlockWithTimeout(remaining)
            };
            match events.put(event, policy).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!(seq = message.seq, error = %e, "Sample event dropped"),
            }
        }
        let reply = ServerReply {
            seq: message.seq,
            accepted,
        };
        if worker.reply(reply).await.is_err() {
            break;
        }
    }
}

/// Minimal game-client side of the protocol
pub struct GameClient {
    conn: Connection,
    next_seq: u64,
}

impl GameClient {
    pub async fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        Ok(Self {
            conn: Connection::connect(addr, config).await?,
            next_seq: 0,
        })
    }

    /// Send events and wait for the server's reply
    pub async fn send(&mut self, events: Vec<SampleEvent>) -> Result<ServerReply> {
        let message = ClientMessage {
            seq: self.next_seq,
            events,
        };
        self.next_seq += 1;
        self.conn.send(&bincode::serialize(&message)?).await?;
        match self.conn.recv().await? {
            Some(payload) => decode(payload),
            None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "game server closed the connection").into()),
        }
    }
}
