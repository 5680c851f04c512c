use crate::types::Rank;
use std::collections::BTreeMap;

/// Where an arriving message belongs relative to the round in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Current,
    Stashed,
    Stale,
}

/// Round bookkeeping for one buffer name on one lane.
///
/// Round ids are assigned at round start and never reused. Messages for later
/// rounds are stashed keyed by `(round, sender)` until that round begins;
/// messages for finished rounds are dropped.
#[derive(Debug)]
pub(crate) struct RoundLane<T> {
    next_round: u64,
    stash: BTreeMap<(u64, Rank), T>,
}

impl<T> Default for RoundLane<T> {
    fn default() -> Self {
        Self {
            next_round: 0,
            stash: BTreeMap::new(),
        }
    }
}

impl<T> RoundLane<T> {
    /// Assign the id of a new round and drop stash entries older than it.
    pub(crate) fn begin(&mut self) -> u64 {
        let round = self.next_round;
        self.next_round += 1;
        self.stash = self.stash.split_off(&(round, 0));
        round
    }

    /// The id the next `begin` will hand out.
    pub(crate) fn next_round(&self) -> u64 {
        self.next_round
    }

    /// Take what was stashed for `round`.
    pub(crate) fn take(&mut self, round: u64) -> Vec<(Rank, T)> {
        let later = self.stash.split_off(&(round + 1, 0));
        let current = std::mem::replace(&mut self.stash, later);
        current
            .into_iter()
            .filter(|((r, _), _)| *r == round)
            .map(|((_, src), v)| (src, v))
            .collect()
    }

    /// Classify a message for `msg_round` while `current` is in flight,
    /// stashing it if it belongs to a later round. A second message from the
    /// same sender for the same future round replaces the first.
    pub(crate) fn place(&mut self, current: u64, msg_round: u64, src: Rank, value: T) -> (Placement, Option<T>) {
        if msg_round < current {
            (Placement::Stale, None)
        } else if msg_round == current {
            (Placement::Current, Some(value))
        } else {
            self.stash.insert((msg_round, src), value);
            (Placement::Stashed, None)
        }
    }

    pub(crate) fn stashed(&self) -> usize {
        self.stash.len()
    }
}
