//! Cluster coordination.
//!
//! Worker processes share counters held by a single coordinator. Each worker
//! announces its limiter options once per key prefix, then forwards every
//! verb as a call tagged with a correlation id and waits for the matching
//! reply. Packets travel over a [`Link`], either in-process or as
//! newline-delimited JSON over TCP, and carry a channel tag so unrelated
//! traffic on the same link is ignored.

mod coordinator;
mod link;
mod message;
mod worker;

pub use coordinator::Coordinator;
pub use link::{ClusterError, Link};
pub use message::{CallData, ClusterMessage, Func, InitOptions, Packet, Reply, ReplyData, ReplyKind, DEFAULT_CHANNEL};
pub use worker::{ClusterClient, ClusterWorker, DEFAULT_TIMEOUT};
