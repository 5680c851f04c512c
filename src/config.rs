//! Runtime configuration for the consensus engine.
//!
//! All values have documented defaults. Override via environment variables
//! (prefixed `DIFFUSE_`) or by constructing a custom `DiffuseConfig`.

use crate::consensus::ConsensusAlgorithm;
use crate::error::{DiffuseError, Result};
use crate::topology::TopologySpec;
use std::str::FromStr;
use std::time::Duration;

/// Tuning parameters for consensus rounds, synchronization and fault handling.
#[derive(Debug, Clone)]
pub struct DiffuseConfig {
    /// Deadline for one consensus round. Contributions that have not arrived
    /// by then are left out of the merge.
    pub round_timeout: Duration,

    /// Timeout for each phase of an exact state broadcast.
    pub sync_timeout: Duration,

    /// Timeout for barrier operations.
    pub barrier_timeout: Duration,

    /// Topology family used at startup.
    pub topology: TopologySpec,

    /// Consensus variant run by `consensus_step`.
    pub algorithm: ConsensusAlgorithm,

    /// Reject topologies that are not strongly connected.
    pub require_connected: bool,

    /// Consecutive failures after which a peer is quarantined.
    pub quarantine_threshold: u32,

    /// Minimum spacing between two topology reconfigurations.
    pub reconfigure_interval: Duration,

    /// Number of fault records retained in the history log.
    pub fault_history: usize,

    /// Heartbeat period. `Duration::ZERO` disables heartbeats.
    pub heartbeat_interval: Duration,

    /// Silence after which a peer is charged with a heartbeat timeout.
    pub heartbeat_timeout: Duration,

    /// Ranks per physical node.
    pub local_size: u32,
}

impl Default for DiffuseConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(30),
            barrier_timeout: Duration::from_secs(30),
            topology: TopologySpec::Ring,
            algorithm: ConsensusAlgorithm::NeighborAverage,
            require_connected: true,
            quarantine_threshold: 3,
            reconfigure_interval: Duration::from_secs(1),
            fault_history: 64,
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::from_secs(5),
            local_size: 1,
        }
    }
}

impl DiffuseConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `DIFFUSE_ROUND_TIMEOUT_MS`
    /// - `DIFFUSE_SYNC_TIMEOUT_MS`
    /// - `DIFFUSE_BARRIER_TIMEOUT_MS`
    /// - `DIFFUSE_TOPOLOGY` (`ring`, `star[:c]`, `full`, `exponential-2`, `custom:...`)
    /// - `DIFFUSE_ALGORITHM` (`neighbor-average`, `push-sum`, `exact-diffusion`)
    /// - `DIFFUSE_REQUIRE_CONNECTED`
    /// - `DIFFUSE_QUARANTINE_THRESHOLD`
    /// - `DIFFUSE_RECONFIGURE_INTERVAL_MS`
    /// - `DIFFUSE_FAULT_HISTORY`
    /// - `DIFFUSE_HEARTBEAT_INTERVAL_MS`
    /// - `DIFFUSE_HEARTBEAT_TIMEOUT_MS`
    /// - `DIFFUSE_LOCAL_SIZE`
    ///
    /// A variable that is set but cannot be parsed is a configuration error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("DIFFUSE_ROUND_TIMEOUT_MS") {
            cfg.round_timeout = Duration::from_millis(parse_var("DIFFUSE_ROUND_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_SYNC_TIMEOUT_MS") {
            cfg.sync_timeout = Duration::from_millis(parse_var("DIFFUSE_SYNC_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_BARRIER_TIMEOUT_MS") {
            cfg.barrier_timeout =
                Duration::from_millis(parse_var("DIFFUSE_BARRIER_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_TOPOLOGY") {
            cfg.topology = parse_var("DIFFUSE_TOPOLOGY", &v)?;
        }
        if let Some(v) = lookup("DIFFUSE_ALGORITHM") {
            cfg.algorithm = parse_var("DIFFUSE_ALGORITHM", &v)?;
        }
        if let Some(v) = lookup("DIFFUSE_REQUIRE_CONNECTED") {
            cfg.require_connected = parse_var("DIFFUSE_REQUIRE_CONNECTED", &v)?;
        }
        if let Some(v) = lookup("DIFFUSE_QUARANTINE_THRESHOLD") {
            cfg.quarantine_threshold = parse_var("DIFFUSE_QUARANTINE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("DIFFUSE_RECONFIGURE_INTERVAL_MS") {
            cfg.reconfigure_interval =
                Duration::from_millis(parse_var("DIFFUSE_RECONFIGURE_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_FAULT_HISTORY") {
            cfg.fault_history = parse_var("DIFFUSE_FAULT_HISTORY", &v)?;
        }
        if let Some(v) = lookup("DIFFUSE_HEARTBEAT_INTERVAL_MS") {
            cfg.heartbeat_interval =
                Duration::from_millis(parse_var("DIFFUSE_HEARTBEAT_INTERVAL_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_HEARTBEAT_TIMEOUT_MS") {
            cfg.heartbeat_timeout =
                Duration::from_millis(parse_var("DIFFUSE_HEARTBEAT_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("DIFFUSE_LOCAL_SIZE") {
            cfg.local_size = parse_var("DIFFUSE_LOCAL_SIZE", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.round_timeout.is_zero() {
            return Err(DiffuseError::config("round_timeout must be non-zero"));
        }
        if self.sync_timeout.is_zero() || self.barrier_timeout.is_zero() {
            return Err(DiffuseError::config(
                "sync_timeout and barrier_timeout must be non-zero",
            ));
        }
        if self.quarantine_threshold == 0 {
            return Err(DiffuseError::config("quarantine_threshold must be >= 1"));
        }
        if self.fault_history == 0 {
            return Err(DiffuseError::config("fault_history must be >= 1"));
        }
        if !self.heartbeat_interval.is_zero() && self.heartbeat_timeout <= self.heartbeat_interval
        {
            return Err(DiffuseError::config(
                "heartbeat_timeout must exceed heartbeat_interval",
            ));
        }
        if self.local_size == 0 {
            return Err(DiffuseError::config("local_size must be >= 1"));
        }
        Ok(())
    }

    /// Whether the heartbeat task should run.
    pub fn heartbeats_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| DiffuseError::config(format!("{key}={value:?}: {e}")))
}
