//! Error types for the Relay pipeline
//!
//! Provides a unified error type and domain-specific error variants.
//! A graceful peer disconnect is not an error: `Connection::recv` reports it as `Ok(None)`.

use thiserror::Error;

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type for Relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    // Connection-level I/O failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // Malformed frames
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Local queue backpressure
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    // Experience store failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Invalid cluster shape
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    // Trajectory processing failures
    #[error("Aggregator error: {0}")]
    Aggregator(#[from] AggregatorError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Socket-level failures; the connection must be dropped afterwards
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to send message: msg len {total} sent {transferred} after {retries} attempts")]
    SendIncomplete {
        total: usize,
        transferred: usize,
        retries: usize,
    },

    #[error("failed to recv message: msg len {total} received {transferred} after {retries} attempts")]
    RecvIncomplete {
        total: usize,
        transferred: usize,
        retries: usize,
    },

    #[error("peer closed connection mid-header after {received} of {expected} bytes")]
    TruncatedHeader { received: usize, expected: usize },

    #[error("socket operation timed out after {0}ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed frame; never resynchronized, the connection must be closed
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("magic number {found:#010x} is invalid, expected {expected:#010x}")]
    BadMagic { found: u32, expected: u32 },

    #[error("invalid msg len {len} (max {max})")]
    InvalidLength { len: usize, max: usize },

    #[error("unknown codec tag {0}")]
    UnknownCodec(u8),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Local bounded-queue conditions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue stayed empty for {retries} attempts")]
    Empty { retries: usize },

    #[error("queue is closed")]
    Closed,

    #[error("timed out after {0}ms waiting for queue capacity")]
    Timeout(u64),

    #[error("exit requested")]
    Exiting,
}

/// Experience store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table not found: {0}")]
    UnknownTable(String),

    #[error("rate limiter blocked {op} on table {table}")]
    RateLimited { table: String, op: &'static str },

    #[error("timed out after {elapsed_ms}ms waiting to {op} on table {table}")]
    Timeout {
        table: String,
        op: &'static str,
        elapsed_ms: u64,
    },

    #[error("wrote {written} of {total} records to table {table}: {reason}")]
    PartialWrite {
        table: String,
        written: usize,
        total: usize,
        reason: String,
    },

    #[error("priority count {priorities} does not match record count {records}")]
    PriorityMismatch { records: usize, priorities: usize },

    #[error("invalid table configuration: {0}")]
    InvalidConfig(String),

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("store connection failed: {0}")]
    Connection(String),
}

/// Invalid cluster-shape parameters; fatal at start-up
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("{role} node index {index} out of range (node count {count})")]
    NodeIndexOutOfRange {
        role: String,
        index: usize,
        count: usize,
    },

    #[error("{role} local task index {index} out of range (tasks per node {count})")]
    TaskIndexOutOfRange {
        role: String,
        index: usize,
        count: usize,
    },

    #[error("{0} must be greater than zero")]
    ZeroCount(&'static str),

    #[error("{field} has {actual} entries, expected {expected}")]
    AddressMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Trajectory aggregation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregatorError {
    #[error("step {got} arrived after step {last}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("field {field} has length {actual}, expected {expected}")]
    ShapeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid aggregator configuration: {0}")]
    InvalidConfig(String),
}

// Implement From for common external error types
impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(TransportError::Io(err))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl StoreError {
    /// Records that reached the table before the call failed
    pub fn written(&self) -> usize {
        match self {
            StoreError::PartialWrite { written, .. } => *written,
            _ => 0,
        }
    }
}

impl RelayError {
    /// Whether the error requires the owning connection to be closed
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, RelayError::Transport(_) | RelayError::Protocol(_))
    }
}
