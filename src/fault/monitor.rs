use super::record::{FaultReason, FaultRecord, RankHealth};
use crate::config::DiffuseConfig;
use crate::error::{DiffuseError, Result};
use crate::topology::TopologyManager;
use crate::types::Rank;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct PeerState {
    health: RankHealth,
    last_contact: Instant,
    last_charge: Option<Instant>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            health: RankHealth::Healthy,
            last_contact: Instant::now(),
            last_charge: None,
        }
    }
}

struct MonitorState {
    peers: HashMap<Rank, PeerState>,
    pending: Vec<FaultRecord>,
    pending_readmit: BTreeSet<Rank>,
    last_reconfigure: Option<Instant>,
    history: VecDeque<FaultRecord>,
    /// Latched `TopologyDisconnected`: `(generation, ranks)`.
    fatal: Option<(u64, Vec<Rank>)>,
}

/// Tracks peer health and drives topology reconfiguration.
///
/// Every exchange outcome is reported here. A peer moves `Healthy -> Suspect`
/// on its first failure and `Suspect -> Quarantined` once failures reach the
/// threshold (immediately on an explicit leave). Any successful contact
/// returns it to `Healthy`; a quarantined peer is then readmitted.
///
/// Quarantines and readmissions are batched: the topology is reconfigured at
/// most once per `reconfigure_interval`, and a background ticker flushes
/// batches that were deferred.
pub struct FaultMonitor {
    rank: Rank,
    world_size: u32,
    threshold: u32,
    reconfigure_interval: Duration,
    history_limit: usize,
    topology: Arc<TopologyManager>,
    state: Mutex<MonitorState>,
}

impl FaultMonitor {
    pub fn new(rank: Rank, config: &DiffuseConfig, topology: Arc<TopologyManager>) -> Self {
        let world_size = topology.world_size();
        Self {
            rank,
            world_size,
            threshold: config.quarantine_threshold.max(1),
            reconfigure_interval: config.reconfigure_interval,
            history_limit: config.fault_history.max(1),
            topology,
            state: Mutex::new(MonitorState {
                peers: (0..world_size)
                    .filter(|&p| p != rank)
                    .map(|p| (p, PeerState::new()))
                    .collect(),
                pending: Vec::new(),
                pending_readmit: BTreeSet::new(),
                last_reconfigure: None,
                history: VecDeque::new(),
                fatal: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tracked(&self, peer: Rank) -> bool {
        peer != self.rank && peer < self.world_size
    }

    /// Current health of `peer`.
    pub fn health(&self, peer: Rank) -> RankHealth {
        self.lock()
            .peers
            .get(&peer)
            .map(|p| p.health)
            .unwrap_or(RankHealth::Healthy)
    }

    /// Peers currently quarantined by this monitor, sorted.
    pub fn quarantined(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = self
            .lock()
            .peers
            .iter()
            .filter(|(_, p)| p.health.is_quarantined())
            .map(|(&r, _)| r)
            .collect();
        ranks.sort_unstable();
        ranks
    }

    /// Retained fault records, oldest first.
    pub fn history(&self) -> Vec<FaultRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// A successful exchange with `peer`.
    pub fn report_success(&self, peer: Rank) {
        if !self.tracked(peer) {
            return;
        }
        let mut st = self.lock();
        let state = st.peers.entry(peer).or_insert_with(PeerState::new);
        state.last_contact = Instant::now();
        state.last_charge = None;
        match state.health {
            RankHealth::Healthy => return,
            RankHealth::Suspect { .. } => {
                state.health = RankHealth::Healthy;
                tracing::debug!(rank = self.rank, peer_rank = peer, "peer recovered");
                return;
            }
            RankHealth::Quarantined => {
                state.health = RankHealth::Healthy;
            }
        }
        let before = st.pending.len();
        st.pending.retain(|f| f.rank != peer);
        if st.pending.len() == before {
            st.pending_readmit.insert(peer);
        }
        tracing::info!(rank = self.rank, peer_rank = peer, "quarantined peer made contact");
        drop(st);
        self.try_flush();
    }

    /// A failed exchange with `peer`.
    pub fn report_failure(&self, peer: Rank, reason: FaultReason) {
        if !self.tracked(peer) {
            return;
        }
        let mut st = self.lock();
        let state = st.peers.entry(peer).or_insert_with(PeerState::new);
        let failures = match state.health {
            RankHealth::Quarantined => return,
            RankHealth::Healthy => 1,
            RankHealth::Suspect { failures } => failures + 1,
        };
        if failures < self.threshold {
            state.health = RankHealth::Suspect { failures };
            tracing::debug!(
                rank = self.rank,
                peer_rank = peer,
                failures,
                %reason,
                "peer suspect"
            );
            return;
        }
        state.health = RankHealth::Quarantined;
        tracing::warn!(
            rank = self.rank,
            peer_rank = peer,
            failures,
            %reason,
            "peer quarantined"
        );
        self.record(&mut st, FaultRecord::new(peer, reason));
        drop(st);
        self.try_flush();
    }

    /// `peer` announced that it is leaving.
    pub fn report_leave(&self, peer: Rank) {
        if !self.tracked(peer) {
            return;
        }
        let mut st = self.lock();
        let state = st.peers.entry(peer).or_insert_with(PeerState::new);
        if state.health.is_quarantined() {
            return;
        }
        state.health = RankHealth::Quarantined;
        tracing::info!(rank = self.rank, peer_rank = peer, "peer left");
        self.record(&mut st, FaultRecord::new(peer, FaultReason::ExplicitLeave));
        drop(st);
        self.try_flush();
    }

    fn record(&self, st: &mut MonitorState, record: FaultRecord) {
        st.pending_readmit.remove(&record.rank);
        st.history.push_back(record.clone());
        while st.history.len() > self.history_limit {
            st.history.pop_front();
        }
        st.pending.push(record);
    }

    /// Charge a timeout to every non-quarantined peer silent for longer than
    /// `timeout`. A silent peer is charged at most once per `timeout`.
    pub fn charge_silent(&self, timeout: Duration) -> Vec<Rank> {
        let now = Instant::now();
        let mut charged = Vec::new();
        {
            let mut st = self.lock();
            for peer in (0..self.world_size).filter(|&p| self.tracked(p)) {
                let state = st.peers.entry(peer).or_insert_with(PeerState::new);
                if state.health.is_quarantined() {
                    continue;
                }
                let since = state.last_charge.unwrap_or(state.last_contact);
                if now.duration_since(since) > timeout {
                    state.last_charge = Some(now);
                    charged.push(peer);
                }
            }
        }
        for &peer in &charged {
            self.report_failure(peer, FaultReason::Timeout);
        }
        charged
    }

    /// The latched fatal error, if the topology became disconnected.
    pub fn check(&self) -> Result<()> {
        match &self.lock().fatal {
            Some((generation, quarantined)) => Err(DiffuseError::TopologyDisconnected {
                generation: *generation,
                quarantined: quarantined.clone(),
            }),
            None => Ok(()),
        }
    }

    fn try_flush(&self) {
        if let Err(e) = self.flush() {
            tracing::debug!(rank = self.rank, error = %e, "fault flush failed");
        }
    }

    /// Hand pending quarantines and readmissions to the topology manager.
    ///
    /// Does nothing if the previous reconfiguration is more recent than
    /// `reconfigure_interval`; the batch stays pending.
    pub fn flush(&self) -> Result<()> {
        let (faults, readmit) = {
            let mut st = self.lock();
            if let Some((generation, quarantined)) = &st.fatal {
                return Err(DiffuseError::TopologyDisconnected {
                    generation: *generation,
                    quarantined: quarantined.clone(),
                });
            }
            if st.pending.is_empty() && st.pending_readmit.is_empty() {
                return Ok(());
            }
            if let Some(last) = st.last_reconfigure
                && last.elapsed() < self.reconfigure_interval
            {
                return Ok(());
            }
            st.last_reconfigure = Some(Instant::now());
            (
                std::mem::take(&mut st.pending),
                std::mem::take(&mut st.pending_readmit),
            )
        };

        if !faults.is_empty() {
            match self.topology.reconfigure(&faults) {
                Ok(t) => tracing::info!(
                    rank = self.rank,
                    generation = t.generation(),
                    excluded = faults.len(),
                    "topology reconfigured"
                ),
                Err(DiffuseError::TopologyDisconnected {
                    generation,
                    quarantined,
                }) => {
                    tracing::error!(
                        rank = self.rank,
                        generation,
                        "topology disconnected; consensus cannot continue"
                    );
                    self.lock().fatal = Some((generation, quarantined.clone()));
                    return Err(DiffuseError::TopologyDisconnected {
                        generation,
                        quarantined,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if !readmit.is_empty() {
            let ranks: Vec<Rank> = readmit.into_iter().collect();
            if let Some(t) = self.topology.readmit(&ranks)? {
                tracing::info!(
                    rank = self.rank,
                    generation = t.generation(),
                    readmitted = ?ranks,
                    "ranks readmitted"
                );
            }
        }
        Ok(())
    }

    /// Whether quarantines or readmissions are waiting for the next flush.
    pub fn has_pending(&self) -> bool {
        let st = self.lock();
        !st.pending.is_empty() || !st.pending_readmit.is_empty()
    }

    /// Periodically flush deferred batches until `shutdown` turns true or the
    /// topology becomes disconnected.
    pub fn spawn_ticker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let period = self.reconfigure_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|s| *s) => return,
                    _ = tokio::time::sleep(period) => {}
                }
                if let Err(e) = monitor.flush()
                    && matches!(e, DiffuseError::TopologyDisconnected { .. })
                {
                    return;
                }
            }
        })
    }
}
