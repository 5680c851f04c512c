use super::build::build_topology;
use super::graph::Topology;
use super::spec::TopologySpec;
use crate::error::{DiffuseError, Result};
use crate::fault::FaultRecord;
use crate::types::Rank;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Notification emitted every time the active topology is replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEvent {
    /// Generation of the new snapshot.
    pub generation: u64,
    /// Ranks quarantined by this swap.
    pub quarantined: Vec<Rank>,
    /// Ranks restored by this swap.
    pub readmitted: Vec<Rank>,
}

struct ManagerState {
    spec: TopologySpec,
    /// Topology as built from `spec`, before any exclusion.
    base: Topology,
    /// Ranks removed because of faults.
    excluded: BTreeSet<Rank>,
    /// One-sided windows bound to the active neighbor sets.
    open_windows: usize,
}

/// Owns the active topology and replaces it wholesale.
///
/// Readers take cheap `Arc` snapshots; writers serialize on an internal lock,
/// derive a new snapshot and publish it through a `watch` channel. A failed
/// derivation leaves the previous snapshot active.
pub struct TopologyManager {
    world_size: u32,
    require_connected: bool,
    state: Mutex<ManagerState>,
    snapshot_tx: watch::Sender<Arc<Topology>>,
    event_tx: broadcast::Sender<TopologyEvent>,
}

impl TopologyManager {
    pub fn new(spec: TopologySpec, world_size: u32, require_connected: bool) -> Result<Self> {
        let base = build_topology(&spec, world_size, require_connected)?;
        let (snapshot_tx, _) = watch::channel(Arc::new(base.clone()));
        let (event_tx, _) = broadcast::channel(64);
        tracing::debug!(
            topology = %spec,
            world_size,
            edges = base.edge_count(),
            "topology built"
        );
        Ok(Self {
            world_size,
            require_connected,
            state: Mutex::new(ManagerState {
                spec,
                base,
                excluded: BTreeSet::new(),
                open_windows: 0,
            }),
            snapshot_tx,
            event_tx,
        })
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Current topology snapshot.
    pub fn snapshot(&self) -> Arc<Topology> {
        Arc::clone(&self.snapshot_tx.borrow())
    }

    /// Receiver that observes every snapshot swap.
    pub fn watch(&self) -> watch::Receiver<Arc<Topology>> {
        self.snapshot_tx.subscribe()
    }

    /// Subscribe to topology change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_tx.subscribe()
    }

    /// The `TopologySpec` the active topology was built from.
    pub fn spec(&self) -> TopologySpec {
        self.lock_state().spec.clone()
    }

    /// Ranks currently excluded because of faults.
    pub fn excluded(&self) -> BTreeSet<Rank> {
        self.lock_state().excluded.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exclude the faulted ranks and publish the next generation.
    ///
    /// Faults naming ranks that are already excluded are ignored; if nothing
    /// changes the current snapshot is returned as is.
    pub fn reconfigure(&self, faults: &[FaultRecord]) -> Result<Arc<Topology>> {
        let mut state = self.lock_state();
        let mut excluded = state.excluded.clone();
        let before = excluded.len();
        excluded.extend(
            faults
                .iter()
                .map(|f| f.rank)
                .filter(|&r| r < self.world_size),
        );
        if excluded.len() == before {
            return Ok(self.snapshot());
        }

        let current = self.snapshot();
        let next = state
            .base
            .excluding(&excluded, current.generation() + 1)?;
        state.excluded = excluded;
        Ok(self.publish(&current, next, Vec::new()))
    }

    /// Restore previously excluded ranks and publish the next generation.
    ///
    /// Returns `None` when none of `ranks` was excluded.
    pub fn readmit(&self, ranks: &[Rank]) -> Result<Option<Arc<Topology>>> {
        let mut state = self.lock_state();
        let mut excluded = state.excluded.clone();
        let readmitted: Vec<Rank> = ranks
            .iter()
            .copied()
            .filter(|r| excluded.remove(r))
            .collect();
        if readmitted.is_empty() {
            return Ok(None);
        }

        let current = self.snapshot();
        let next = state
            .base
            .excluding(&excluded, current.generation() + 1)?;
        state.excluded = excluded;
        Ok(Some(self.publish(&current, next, readmitted)))
    }

    /// Replace the active topology with one built from `spec`.
    ///
    /// Clears the fault exclusions. Refused while one-sided windows are
    /// open, because their slots are bound to the current neighbor sets.
    pub fn set_topology(&self, spec: TopologySpec) -> Result<Arc<Topology>> {
        let mut state = self.lock_state();
        if state.open_windows > 0 {
            return Err(DiffuseError::config(format!(
                "cannot change topology while {} window(s) are open",
                state.open_windows
            )));
        }
        let current = self.snapshot();
        let base = build_topology(&spec, self.world_size, self.require_connected)?;
        let next = base.clone().with_generation(current.generation() + 1);
        let readmitted: Vec<Rank> = current.quarantined().iter().copied().collect();
        state.spec = spec;
        state.base = base;
        state.excluded.clear();
        tracing::info!(topology = %state.spec, generation = next.generation(), "topology replaced");
        Ok(self.publish(&current, next, readmitted))
    }

    fn publish(&self, old: &Topology, next: Topology, readmitted: Vec<Rank>) -> Arc<Topology> {
        let quarantined: Vec<Rank> = next
            .quarantined()
            .difference(old.quarantined())
            .copied()
            .collect();
        let mut readmitted = readmitted;
        let restored: Vec<Rank> = old
            .quarantined()
            .difference(next.quarantined())
            .copied()
            .filter(|r| !readmitted.contains(r))
            .collect();
        readmitted.extend(restored);
        readmitted.retain(|r| !next.is_quarantined(*r));
        readmitted.sort_unstable();

        let event = TopologyEvent {
            generation: next.generation(),
            quarantined,
            readmitted,
        };
        if !event.quarantined.is_empty() {
            tracing::warn!(
                generation = event.generation,
                quarantined = ?event.quarantined,
                "ranks quarantined"
            );
        }
        if !next.is_strongly_connected() && next.active_ranks().count() > 1 {
            tracing::warn!(
                generation = event.generation,
                components = next.components().len(),
                "active topology is no longer strongly connected"
            );
        }

        let next = Arc::new(next);
        self.snapshot_tx.send_replace(Arc::clone(&next));
        let _ = self.event_tx.send(event);
        next
    }

    /// Register a window and return the snapshot its slots bind to.
    ///
    /// Counting and reading the snapshot happen under the state lock, so a
    /// concurrent `set_topology` either lands first or is refused.
    pub(crate) fn window_opened(&self) -> Arc<Topology> {
        let mut state = self.lock_state();
        state.open_windows += 1;
        self.snapshot()
    }

    pub(crate) fn window_closed(&self) {
        let mut state = self.lock_state();
        state.open_windows = state.open_windows.saturating_sub(1);
    }
}
