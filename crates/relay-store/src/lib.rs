//! # Relay Store
//!
//! Experience store with admission control.
//!
//! ## Components
//!
//! - [`Table`]: capacity-bounded items governed by a sampler, a remover and a rate limiter
//! - [`ExperienceStore`]: `table_count` shards sharing the configured capacity
//! - [`StoreServer`] / [`StoreClient`]: framed TCP access by table name
//! - [`ExperienceWriter`]: what the proxies write through, local or remote
//!
//! ## Admission control
//!
//! ```text
//! insert ──► rate limiter ──► remover (if full) ──► table
//! sample ◄── rate limiter ◄── sampler ◄──────────── table
//! ```

pub mod client;
pub mod protocol;
pub mod rate_limiter;
pub mod selector;
pub mod server;
pub mod store;
pub mod table;
pub mod writer;

pub use client::{StoreClient, StoreClientConfig};
pub use protocol::{Codec, StoreRequest, StoreResponse};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use selector::Selector;
pub use server::{StoreServer, StoreServerConfig, StoreServerHandle};
pub use store::{ExperienceStore, LimiterKind, RouterKind, ShardRouter, StoreConfig};
pub use table::{Item, SampledItem, Table, TableConfig, TableInfo, TableStats};
pub use writer::{ExperienceWriter, LocalWriter};
