//! Decentralized averaging rounds over named buffers.
//!
//! A [`ConsensusEngine`] runs rounds of one [`MergeStrategy`]: it sends the
//! local share to out-neighbors, collects in-neighbor shares until all have
//! arrived or the round deadline fires, and merges what arrived into the
//! buffer. Missing contributions are reported to the fault monitor.

mod engine;
pub(crate) mod round;
mod strategy;

pub use engine::{ConsensusEngine, GatherReport};
pub use strategy::{
    DiffusionState, ExactDiffusion, MergeInput, MergeStrategy, NeighborAverage, Prepared, PushSum,
    PushSumWeight, Received,
};

use crate::error::DiffuseError;
use crate::types::Rank;
use std::fmt;
use std::str::FromStr;

/// Consensus variant selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsensusAlgorithm {
    #[default]
    NeighborAverage,
    PushSum,
    ExactDiffusion,
}

impl ConsensusAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConsensusAlgorithm::NeighborAverage => "neighbor-average",
            ConsensusAlgorithm::PushSum => "push-sum",
            ConsensusAlgorithm::ExactDiffusion => "exact-diffusion",
        }
    }
}

impl fmt::Display for ConsensusAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusAlgorithm {
    type Err = DiffuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "neighbor-average" | "neighbor_average" | "dsgd" => Ok(Self::NeighborAverage),
            "push-sum" | "push_sum" => Ok(Self::PushSum),
            "exact-diffusion" | "exact_diffusion" => Ok(Self::ExactDiffusion),
            other => Err(DiffuseError::config(format!(
                "unknown consensus algorithm '{other}' (expected neighbor-average, push-sum or exact-diffusion)"
            ))),
        }
    }
}

/// Outcome of one consensus round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub buffer: String,
    pub round: u64,
    /// Topology generation the round's weights came from.
    pub generation: u64,
    /// In-neighbors whose contribution was merged, sorted.
    pub received: Vec<Rank>,
    /// In-neighbors that missed the deadline, sorted.
    pub missing: Vec<Rank>,
    pub timed_out: bool,
    /// The rank had no neighbors; the buffer was left unchanged.
    pub isolated: bool,
}

impl RoundReport {
    /// Every expected contribution arrived.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}
