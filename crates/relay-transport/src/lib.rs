//! # Relay Transport
//!
//! Point-to-point messaging primitives:
//!
//! - [`Connection`]: length-prefixed frames over any async byte stream
//! - [`proxy_queue`]: bounded in-process channel with explicit overflow policy
//! - [`message_buffer`]: request/response queue pair between a socket handler and a worker

pub mod connection;
pub mod msg_buff;
pub mod queue;

pub use connection::{Connection, ConnectionConfig};
pub use msg_buff::{message_buffer, BufferClient, BufferWorker};
pub use queue::{proxy_queue, OverflowPolicy, QueueConfig, QueueReceiver, QueueSender};
