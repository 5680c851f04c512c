use crate::types::Rank;
use std::fmt;
use tokio::time::Instant;

/// Why a rank was reported as faulty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultReason {
    /// Expected traffic did not arrive before its deadline.
    Timeout,
    /// Sending to the rank failed.
    Transport(String),
    /// The rank announced it is leaving.
    ExplicitLeave,
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::Timeout => f.write_str("timeout"),
            FaultReason::Transport(msg) => write!(f, "transport: {msg}"),
            FaultReason::ExplicitLeave => f.write_str("explicit leave"),
        }
    }
}

/// A rank judged faulty, handed to the topology manager for exclusion.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub rank: Rank,
    pub detected_at: Instant,
    pub reason: FaultReason,
}

impl FaultRecord {
    pub fn new(rank: Rank, reason: FaultReason) -> Self {
        Self {
            rank,
            detected_at: Instant::now(),
            reason,
        }
    }
}

/// Health of a peer as seen by the local fault monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankHealth {
    Healthy,
    /// At least one recent failure, below the quarantine threshold.
    Suspect { failures: u32 },
    /// Excluded from consensus until it makes contact again.
    Quarantined,
}

impl RankHealth {
    pub fn is_quarantined(&self) -> bool {
        matches!(self, RankHealth::Quarantined)
    }
}
