//! Framed connection
//!
//! Frame layout: `magic (u32 BE) | length (u32 BE) | payload`.
//! A bad magic or length is never resynchronized; the caller must drop the connection.

use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use relay_common::{
    ProtocolError, RelayError, Result, TransportError, FRAME_HEADER_LEN, MAGIC_NUM, MAX_MSG_SIZE,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Partial reads/writes allowed per payload before giving up
    pub retry_times: usize,
    /// Largest accepted payload, capped at `u32::MAX` by the frame header
    pub max_msg_size: usize,
    /// Per socket operation timeout, 0 disables it
    pub io_timeout_ms: u64,
    /// SO_SNDBUF / SO_RCVBUF applied by `connect`
    pub sock_buff_size: u32,
    /// Initial size of the reusable receive buffer
    pub initial_buffer: usize,
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_times: 10_000,
            max_msg_size: MAX_MSG_SIZE,
            io_timeout_ms: 30_000,
            sock_buff_size: 4 * 1024 * 1024,
            initial_buffer: 64 * 1024,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    /// Payload limit actually enforced: the configured size, capped by the u32 length field
    pub fn max_payload(&self) -> usize {
        self.max_msg_size.min(u32::MAX as usize)
    }
}

async fn with_timeout<T, F>(timeout_ms: u64, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    if timeout_ms == 0 {
        return Ok(fut.await?);
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(TransportError::Timeout(timeout_ms).into()),
    }
}

/// Framed message connection over an async byte stream
pub struct Connection<S = TcpStream> {
    stream: S,
    config: ConnectionConfig,
    send_buf: BytesMut,
    recv_buf: Vec<u8>,
}

impl Connection<TcpStream> {
    /// Dial `addr`, applying socket buffer sizes and `TCP_NODELAY`
    pub async fn connect(addr: &str, config: ConnectionConfig) -> Result<Self> {
        let target = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address resolved for {addr}"),
            ))
        })?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(config.sock_buff_size)?;
        socket.set_recv_buffer_size(config.sock_buff_size)?;

        let stream = with_timeout(config.io_timeout_ms, socket.connect(target)).await?;
        stream.set_nodelay(config.nodelay)?;
        debug!(%addr, "Connected");
        Ok(Self::new(stream, config))
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: ConnectionConfig) -> Self {
        let recv_buf = vec![0; config.initial_buffer];
        Self {
            stream,
            config,
            send_buf: BytesMut::with_capacity(FRAME_HEADER_LEN),
            recv_buf,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send one frame.
    ///
    /// Header and payload go out in a single buffer; partial writes are retried up to
    /// `retry_times` times.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = payload.len();
        let max = self.config.max_payload();
        let wire_len = match u32::try_from(len) {
            Ok(n) if len != 0 && len <= max => n,
            _ => return Err(ProtocolError::InvalidLength { len, max }.into()),
        };

        let Self {
            stream,
            config,
            send_buf,
            ..
        } = self;

        send_buf.clear();
        send_buf.reserve(FRAME_HEADER_LEN + len);
        send_buf.put_u32(MAGIC_NUM);
        send_buf.put_u32(wire_len);
        send_buf.extend_from_slice(payload);

        let total = send_buf.len();
        let mut sent = 0;
        let mut retries = 0;
        while retries < config.retry_times && sent < total {
            sent += with_timeout(config.io_timeout_ms, stream.write(&send_buf[sent..])).await?;
            retries += 1;
        }
        if sent < total {
            return Err(TransportError::SendIncomplete {
                total,
                transferred: sent,
                retries,
            }
            .into());
        }

        with_timeout(config.io_timeout_ms, stream.flush()).await?;
        trace!(len, "Frame sent");
        Ok(())
    }

    /// Receive one frame.
    ///
    /// Returns `Ok(None)` when the peer closed before sending any header byte. The slice
    /// borrows the reusable receive buffer and is valid until the next call.
    pub async fn recv(&mut self) -> Result<Option<&[u8]>> {
        let Self {
            stream,
            config,
            recv_buf,
            ..
        } = self;

        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut got = 0;
        while got < FRAME_HEADER_LEN {
            let n = with_timeout(config.io_timeout_ms, stream.read(&mut header[got..])).await?;
            if n == 0 {
                if got == 0 {
                    return Ok(None);
                }
                return Err(TransportError::TruncatedHeader {
                    received: got,
                    expected: FRAME_HEADER_LEN,
                }
                .into());
            }
            got += n;
        }

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != MAGIC_NUM {
            return Err(ProtocolError::BadMagic {
                found: magic,
                expected: MAGIC_NUM,
            }
            .into());
        }

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let max = config.max_payload();
        if len == 0 || len > max {
            return Err(ProtocolError::InvalidLength { len, max }.into());
        }

        if recv_buf.len() < len {
            recv_buf.resize(len, 0);
        }

        let mut pos = 0;
        let mut retries = 0;
        while retries < config.retry_times && pos < len {
            let n = with_timeout(config.io_timeout_ms, stream.read(&mut recv_buf[pos..len])).await?;
            retries += 1;
            if n == 0 {
                break;
            }
            pos += n;
        }
        if pos != len {
            return Err(RelayError::Transport(TransportError::RecvIncomplete {
                total: len,
                transferred: pos,
                retries,
            }));
        }

        trace!(len, "Frame received");
        Ok(Some(&recv_buf[..len]))
    }
}
