//! Experience store wire protocol
//!
//! Each frame payload is one codec tag byte followed by a bincode body, optionally
//! zstd-compressed:
//!
//! ```text
//! | tag (0 raw, 1 zstd) | body ... |
//! ```

use relay_common::{ProtocolError, RelayError, TrainingRecord, MAX_MSG_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::table::{SampledItem, TableInfo};

const ZSTD_LEVEL: i32 = 3;

/// Payload codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Raw,
    Zstd,
}

impl Codec {
    pub fn tag(self) -> u8 {
        match self {
            Codec::Raw => 0,
            Codec::Zstd => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(Codec::Raw),
            1 => Ok(Codec::Zstd),
            other => Err(ProtocolError::UnknownCodec(other)),
        }
    }
}

/// Client → server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreRequest {
    Write {
        batch_id: Uuid,
        table: String,
        records: Vec<TrainingRecord>,
        priorities: Vec<f64>,
        timeout_ms: Option<u64>,
    },
    Sample {
        table: String,
        batch_size: usize,
        timeout_ms: Option<u64>,
    },
    ServerInfo {
        table: Option<String>,
    },
    Reset {
        table: String,
    },
}

impl StoreRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreRequest::Write { .. } => "write",
            StoreRequest::Sample { .. } => "sample",
            StoreRequest::ServerInfo { .. } => "server_info",
            StoreRequest::Reset { .. } => "reset",
        }
    }
}

/// Server → client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreResponse {
    Written { batch_id: Uuid, count: usize },
    /// The first `count` of `total` records went in before `message` stopped the write
    PartiallyWritten {
        batch_id: Uuid,
        count: usize,
        total: usize,
        message: String,
    },
    Batch { items: Vec<SampledItem> },
    Info { tables: Vec<TableInfo> },
    ResetDone,
    Error { message: String },
}

/// Serialize `msg` into a tagged frame payload
pub fn encode<T: Serialize>(msg: &T, codec: Codec) -> Result<Vec<u8>, RelayError> {
    let body = bincode::serialize(msg)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(codec.tag());
    match codec {
        Codec::Raw => out.extend_from_slice(&body),
        Codec::Zstd => out.extend_from_slice(&zstd::stream::encode_all(body.as_slice(), ZSTD_LEVEL)?),
    }
    Ok(out)
}

/// Parse a tagged frame payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, RelayError> {
    let (&tag, body) = payload
        .split_first()
        .ok_or_else(|| ProtocolError::Decode("empty payload".into()))?;

    let msg = match Codec::from_tag(tag)? {
        Codec::Raw => bincode::deserialize(body),
        Codec::Zstd => {
            let raw = zstd::bulk::decompress(body, MAX_MSG_SIZE)
                .map_err(|e| ProtocolError::Decode(format!("zstd: {e}")))?;
            bincode::deserialize(&raw)
        }
    };
    msg.map_err(|e| ProtocolError::Decode(e.to_string()).into())
}
