//! # Relay aisrv
//!
//! The tier between game clients and the learners' experience stores.
//!
//! ```text
//! game client ──frames──► GameServer ──events──► SampleServer ──batches──► LearnerProxy ──► store
//!                                                (SampleAggregator per agent)
//! ```
//!
//! Every hop is a bounded queue: producers drop or time out instead of stalling the game
//! loop, and the proxies absorb store failures into counters.

pub mod aggregator;
pub mod config;
pub mod game_server;
pub mod learner_proxy;
pub mod sample_server;

pub use aggregator::{AdvantageProjection, AggregatorConfig, SampleAggregator, TrajectoryStep};
pub use config::{NodeConfig, NodeMode};
pub use game_server::{ClientMessage, GameClient, GameServer, GameServerConfig, GameServerHandle, ServerReply};
pub use learner_proxy::{
    ExperienceBatch, LearnerProxy, ProxyConfig, ProxyStats, ProxyStatsSnapshot, ProxyWorker,
};
pub use sample_server::{SampleEvent, SampleServer, SampleServerConfig, SampleServerStats};
