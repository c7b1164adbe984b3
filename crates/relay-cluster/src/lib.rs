//! # Relay Cluster
//!
//! Coordination-free sharding of actor tasks over learner tasks.
//!
//! Every process derives the same [`Topology`] from the same [`ClusterShape`], so no
//! runtime negotiation is needed:
//!
//! ```text
//! actor world rank r
//!   └─ learner node   = r mod learner_node_count
//!       └─ position p in that node's actor list
//!           ├─ learner task = p mod tasks_per_learner_node
//!           └─ actor rank   = p div tasks_per_learner_node
//! ```

pub mod addresses;
pub mod shape;
pub mod topology;

pub use addresses::{ClusterAddresses, ClusterSpec};
pub use shape::{ClusterShape, Role};
pub use topology::{assign, LearnerAssignment, TaskRef, Topology};
