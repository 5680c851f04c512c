//! Failure detection: per-peer health, fault records, heartbeats.

pub(crate) mod heartbeat;
mod monitor;
mod record;

pub use monitor::FaultMonitor;
pub use record::{FaultReason, FaultRecord, RankHealth};
