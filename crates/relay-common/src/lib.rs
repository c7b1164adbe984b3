//! # Relay Common
//!
//! Shared types, errors, and telemetry bootstrap for the Relay experience pipeline.
//!
//! ## Core Types
//!
//! - [`TrainingRecord`]: fixed-shape named tensor block written to the experience store
//! - [`Tensor`]: a flat `f32` buffer with an explicit shape
//!
//! ## Errors
//!
//! - [`RelayError`]: unified error with one variant per failure domain
//! - [`TransportError`], [`ProtocolError`]: fatal to a connection
//! - [`QueueError`], [`StoreError`]: recoverable at the proxy boundary
//! - [`TopologyError`]: fatal at process start

pub mod error;
pub mod telemetry;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{
    AggregatorError, ProtocolError, QueueError, RelayError, Result, StoreError, TopologyError,
    TransportError,
};
pub use types::record::{Tensor, TrainingRecord};

/// Relay version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Frame magic number, written big-endian at the start of every frame
pub const MAGIC_NUM: u32 = 0x1234_5678;

/// Largest payload a single frame may carry (128 MiB)
pub const MAX_MSG_SIZE: usize = 128 * 1024 * 1024;

/// Size of the fixed frame header: magic + payload length
pub const FRAME_HEADER_LEN: usize = 8;

/// Default name prefix for experience-store tables
pub const DEFAULT_TABLE_PREFIX: &str = "reverb_table";
