use crate::error::{DiffuseError, Result};
use crate::fault::FaultRecord;
use crate::types::Rank;
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Tolerance used when checking that mixing-weight rows sum to one.
pub const STOCHASTIC_TOLERANCE: f64 = 1e-9;

/// In- and out-neighbors of one rank, borrowed from a topology snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbors<'a> {
    /// Ranks whose contributions this rank merges.
    pub ins: &'a [Rank],
    /// Ranks this rank sends its value to.
    pub outs: &'a [Rank],
}

impl Neighbors<'_> {
    /// True when the rank neither sends nor receives.
    pub fn is_empty(&self) -> bool {
        self.ins.is_empty() && self.outs.is_empty()
    }
}

/// An immutable snapshot of the communication graph.
///
/// Mixing weights are stored on the receiving side: row `r` holds the
/// coefficient `r` applies to itself and to each in-neighbor. Every row of an
/// active rank sums to one. A snapshot is never mutated after construction;
/// reconfiguration produces a new instance with a higher generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    generation: u64,
    world_size: u32,
    in_neighbors: Vec<Vec<Rank>>,
    in_weights: Vec<Vec<f64>>,
    out_neighbors: Vec<Vec<Rank>>,
    self_weights: Vec<f64>,
    quarantined: BTreeSet<Rank>,
}

impl Topology {
    /// Assemble a snapshot from weighted edges `(src, dst, weight)`.
    ///
    /// Callers guarantee ranks are in range and edges are unique.
    pub(crate) fn from_parts(
        world_size: u32,
        generation: u64,
        self_weights: Vec<f64>,
        edges: &[(Rank, Rank, f64)],
        quarantined: BTreeSet<Rank>,
    ) -> Self {
        let n = world_size as usize;
        let mut ins: Vec<Vec<(Rank, f64)>> = vec![Vec::new(); n];
        let mut out_neighbors: Vec<Vec<Rank>> = vec![Vec::new(); n];
        for &(src, dst, w) in edges {
            ins[dst as usize].push((src, w));
            out_neighbors[src as usize].push(dst);
        }
        let mut in_neighbors = Vec::with_capacity(n);
        let mut in_weights = Vec::with_capacity(n);
        for mut row in ins {
            row.sort_by_key(|&(r, _)| r);
            in_neighbors.push(row.iter().map(|&(r, _)| r).collect());
            in_weights.push(row.iter().map(|&(_, w)| w).collect());
        }
        for outs in &mut out_neighbors {
            outs.sort_unstable();
        }

        Self {
            generation,
            world_size,
            in_neighbors,
            in_weights,
            out_neighbors,
            self_weights,
            quarantined,
        }
    }

    /// Monotonic counter, incremented by every reconfiguration.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Ranks currently excluded from consensus.
    pub fn quarantined(&self) -> &BTreeSet<Rank> {
        &self.quarantined
    }

    pub fn is_quarantined(&self, rank: Rank) -> bool {
        self.quarantined.contains(&rank)
    }

    /// Ranks that take part in consensus rounds.
    pub fn active_ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        (0..self.world_size).filter(|r| !self.quarantined.contains(r))
    }

    fn check_rank(&self, rank: Rank) -> Result<usize> {
        if rank >= self.world_size {
            return Err(DiffuseError::UnknownRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(rank as usize)
    }

    /// In- and out-neighbors of `rank`. Quarantined ranks never appear.
    pub fn neighbors_of(&self, rank: Rank) -> Result<Neighbors<'_>> {
        let idx = self.check_rank(rank)?;
        Ok(Neighbors {
            ins: &self.in_neighbors[idx],
            outs: &self.out_neighbors[idx],
        })
    }

    /// Ranks whose values `rank` merges. Empty for an unknown rank.
    pub fn in_neighbors(&self, rank: Rank) -> &[Rank] {
        self.in_neighbors
            .get(rank as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ranks that receive `rank`'s value. Empty for an unknown rank.
    pub fn out_neighbors(&self, rank: Rank) -> &[Rank] {
        self.out_neighbors
            .get(rank as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Coefficient `rank` applies to `neighbor`'s contribution.
    ///
    /// `neighbor == rank` yields the self weight; anything that is not an
    /// in-neighbor yields `0.0`.
    pub fn mixing_weight(&self, rank: Rank, neighbor: Rank) -> f64 {
        let Some(ins) = self.in_neighbors.get(rank as usize) else {
            return 0.0;
        };
        if neighbor == rank {
            return self.self_weights[rank as usize];
        }
        match ins.binary_search(&neighbor) {
            Ok(pos) => self.in_weights[rank as usize][pos],
            Err(_) => 0.0,
        }
    }

    /// `(in-neighbor, weight)` pairs of `rank`, sorted by rank.
    pub fn in_weights(&self, rank: Rank) -> impl Iterator<Item = (Rank, f64)> + '_ {
        let idx = rank as usize;
        self.in_neighbors
            .get(idx)
            .into_iter()
            .flat_map(move |ins| ins.iter().copied().zip(self.in_weights[idx].iter().copied()))
    }

    /// Sum of the mixing-weight row of `rank`.
    pub fn row_sum(&self, rank: Rank) -> f64 {
        self.mixing_weight(rank, rank) + self.in_weights(rank).map(|(_, w)| w).sum::<f64>()
    }

    /// Whether every rank's row sums to one within `tolerance`.
    pub fn is_row_stochastic(&self, tolerance: f64) -> bool {
        (0..self.world_size).all(|r| (self.row_sum(r) - 1.0).abs() <= tolerance)
    }

    /// A rank is isolated when it neither sends nor receives.
    pub fn is_isolated(&self, rank: Rank) -> bool {
        self.in_neighbors(rank).is_empty() && self.out_neighbors(rank).is_empty()
    }

    /// Number of directed edges.
    pub fn edge_count(&self) -> usize {
        self.in_neighbors.iter().map(Vec::len).sum()
    }

    /// All edges as `(src, dst, weight)`.
    pub fn edges(&self) -> Vec<(Rank, Rank, f64)> {
        let mut edges = Vec::with_capacity(self.edge_count());
        for dst in 0..self.world_size {
            for (src, w) in self.in_weights(dst) {
                edges.push((src, dst, w));
            }
        }
        edges
    }

    /// Whether the active ranks form one strongly connected component.
    pub fn is_strongly_connected(&self) -> bool {
        let active: Vec<Rank> = self.active_ranks().collect();
        let Some(&start) = active.first() else {
            return false;
        };
        let forward = self.reach(start, |r| self.out_neighbors(r));
        let backward = self.reach(start, |r| self.in_neighbors(r));
        active
            .iter()
            .all(|r| forward.contains(r) && backward.contains(r))
    }

    fn reach<'a>(&'a self, start: Rank, next: impl Fn(Rank) -> &'a [Rank]) -> HashSet<Rank> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &n in next(node) {
                if seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        seen
    }

    /// Weakly connected components of the active ranks, each sorted.
    pub fn components(&self) -> Vec<Vec<Rank>> {
        let mut seen: HashSet<Rank> = HashSet::new();
        let mut components = Vec::new();
        for start in self.active_ranks() {
            if seen.contains(&start) {
                continue;
            }
            let mut comp = Vec::new();
            let mut queue = VecDeque::from([start]);
            seen.insert(start);
            while let Some(node) = queue.pop_front() {
                comp.push(node);
                for &n in self.in_neighbors(node).iter().chain(self.out_neighbors(node)) {
                    if seen.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
            comp.sort_unstable();
            components.push(comp);
        }
        components
    }

    /// Remove the faulted ranks and return the next generation.
    pub fn reconfigure(&self, faults: &[FaultRecord]) -> Result<Topology> {
        let mut removed = self.quarantined.clone();
        removed.extend(faults.iter().map(|f| f.rank).filter(|&r| r < self.world_size));
        self.excluding(&removed, self.generation + 1)
    }

    /// Derive a topology without the `removed` ranks.
    ///
    /// Every surviving row is rescaled by its remaining mass so it sums to one
    /// again. Survivors left without any edge are quarantined as well, unless
    /// they are the only survivor. If at least two ranks survive and all of
    /// them would be isolated, the group cannot make progress and
    /// `TopologyDisconnected` is returned.
    ///
    /// When the removal breaks a strongly connected graph apart, its strongly
    /// connected pieces are chained back together with bidirectional bridge
    /// edges between their lowest ranks. Every rank derives the same bridges
    /// from the same fault set.
    pub fn excluding(&self, removed: &BTreeSet<Rank>, generation: u64) -> Result<Topology> {
        let n = self.world_size as usize;
        let mut self_weights = vec![1.0; n];
        let mut edges = Vec::new();

        for dst in 0..self.world_size {
            if removed.contains(&dst) {
                continue;
            }
            let kept: Vec<(Rank, f64)> = self
                .in_weights(dst)
                .filter(|(src, _)| !removed.contains(src))
                .collect();
            let own = self.self_weights[dst as usize];
            let mass = own + kept.iter().map(|&(_, w)| w).sum::<f64>();
            if mass <= f64::EPSILON {
                // Nothing left to mix with; the rank keeps its own value.
                continue;
            }
            self_weights[dst as usize] = own / mass;
            edges.extend(kept.into_iter().map(|(src, w)| (src, dst, w / mass)));
        }

        let mut quarantined = removed.clone();
        let draft = Topology::from_parts(
            self.world_size,
            generation,
            self_weights.clone(),
            &edges,
            quarantined.clone(),
        );

        let survivors: Vec<Rank> = (0..self.world_size)
            .filter(|r| !removed.contains(r))
            .collect();
        let isolated: Vec<Rank> = survivors
            .iter()
            .copied()
            .filter(|&r| draft.is_isolated(r))
            .collect();

        if survivors.len() >= 2 && isolated.len() == survivors.len() {
            return Err(DiffuseError::TopologyDisconnected {
                generation,
                quarantined: (0..self.world_size).collect(),
            });
        }
        if survivors.len() < 2 {
            return Ok(draft);
        }

        quarantined.extend(isolated);
        let reduced = Topology::from_parts(
            self.world_size,
            generation,
            self_weights.clone(),
            &edges,
            quarantined.clone(),
        );
        let islands = reduced.strong_components();
        if islands.len() < 2 || !self.is_strongly_connected() {
            return Ok(reduced);
        }

        for pair in islands.windows(2) {
            let (a, b) = (pair[0][0], pair[1][0]);
            add_bridge(&mut self_weights, &mut edges, a, b);
            add_bridge(&mut self_weights, &mut edges, b, a);
        }
        Ok(Topology::from_parts(
            self.world_size,
            generation,
            self_weights,
            &edges,
            quarantined,
        ))
    }

    /// Strongly connected components of the active ranks, each sorted and
    /// ordered by their lowest rank.
    pub fn strong_components(&self) -> Vec<Vec<Rank>> {
        let mut assigned: HashSet<Rank> = HashSet::new();
        let mut components = Vec::new();
        for start in self.active_ranks() {
            if assigned.contains(&start) {
                continue;
            }
            let forward = self.reach(start, |r| self.out_neighbors(r));
            let backward = self.reach(start, |r| self.in_neighbors(r));
            let mut comp: Vec<Rank> = forward.intersection(&backward).copied().collect();
            comp.sort_unstable();
            assigned.extend(comp.iter().copied());
            components.push(comp);
        }
        components
    }

    /// Whether both snapshots describe the same weighted graph over the same
    /// active ranks, regardless of generation.
    pub fn is_equivalent(&self, other: &Topology, tolerance: f64) -> bool {
        if self.world_size != other.world_size
            || self.quarantined != other.quarantined
            || self.in_neighbors != other.in_neighbors
        {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance;
        self.self_weights
            .iter()
            .zip(&other.self_weights)
            .all(|(&a, &b)| close(a, b))
            && self
                .in_weights
                .iter()
                .zip(&other.in_weights)
                .all(|(a, b)| a.iter().zip(b).all(|(&x, &y)| close(x, y)))
    }

    /// Same graph with a different generation counter.
    pub(crate) fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

/// Add the in-edge `src -> dst` and shrink the rest of row `dst` so the
/// new edge gets an equal share.
fn add_bridge(self_weights: &mut [f64], edges: &mut Vec<(Rank, Rank, f64)>, src: Rank, dst: Rank) {
    if edges.iter().any(|e| e.0 == src && e.1 == dst) {
        return;
    }
    let entries = 1 + edges.iter().filter(|e| e.1 == dst).count();
    let keep = entries as f64 / (entries + 1) as f64;
    self_weights[dst as usize] *= keep;
    for e in edges.iter_mut().filter(|e| e.1 == dst) {
        e.2 *= keep;
    }
    edges.push((src, dst, 1.0 / (entries + 1) as f64));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultReason, FaultRecord};
    use crate::topology::{TopologySpec, build_topology};

    fn ring(n: u32) -> Topology {
        build_topology(&TopologySpec::Ring, n, true).unwrap()
    }

    fn fault(rank: Rank) -> FaultRecord {
        FaultRecord::new(rank, FaultReason::Timeout)
    }

    #[test]
    fn test_neighbors_and_weights() {
        let t = ring(5);
        let nb = t.neighbors_of(0).unwrap();
        assert_eq!(nb.ins, &[1, 4]);
        assert_eq!(nb.outs, &[1, 4]);
        assert!((t.mixing_weight(0, 0) - 1.0 / 3.0).abs() < 1e-12);
        assert!((t.mixing_weight(0, 4) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(t.mixing_weight(0, 2), 0.0);
        assert_eq!(t.mixing_weight(9, 0), 0.0);
        assert!(t.neighbors_of(5).is_err());
    }

    #[test]
    fn test_reconfigure_renormalizes_rows() {
        let t = ring(5);
        let next = t.reconfigure(&[fault(2)]).unwrap();
        assert_eq!(next.generation(), t.generation() + 1);
        assert!(next.is_quarantined(2));
        assert!(next.is_row_stochastic(STOCHASTIC_TOLERANCE));

        // Rank 1 lost neighbor 2: self and rank 0 split the row evenly.
        assert_eq!(next.in_neighbors(1), &[0]);
        assert!((next.mixing_weight(1, 1) - 0.5).abs() < 1e-12);
        assert!((next.mixing_weight(1, 0) - 0.5).abs() < 1e-12);

        for r in next.active_ranks() {
            assert!(!next.in_neighbors(r).contains(&2));
            assert!(!next.out_neighbors(r).contains(&2));
        }
        assert!(next.neighbors_of(2).unwrap().is_empty());
    }

    #[test]
    fn test_reconfigure_quarantines_isolated_rank() {
        // 0 <-> 1 <-> 2 as a path: removing 1 isolates both ends.
        let spec: TopologySpec = "custom:0->1,1->0,1->2,2->1,2->3,3->2".parse().unwrap();
        let t = build_topology(&spec, 4, true).unwrap();
        let next = t.reconfigure(&[fault(2)]).unwrap();
        assert!(next.is_quarantined(2));
        assert!(next.is_quarantined(3), "rank 3 lost its only neighbor");
        assert!(!next.is_quarantined(0));
        assert!((next.row_sum(3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reconfigure_whole_group_isolated_fails() {
        let spec: TopologySpec = "custom:0->1,1->0,1->2,2->1".parse().unwrap();
        let t = build_topology(&spec, 3, true).unwrap();
        let err = t.reconfigure(&[fault(1)]).unwrap_err();
        assert!(matches!(err, DiffuseError::TopologyDisconnected { .. }));
    }

    #[test]
    fn test_lone_survivor_stays_active() {
        let t = ring(2);
        let next = t.reconfigure(&[fault(1)]).unwrap();
        assert!(!next.is_quarantined(0));
        assert!((next.mixing_weight(0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reconfigure_is_cumulative() {
        let t = ring(6);
        let a = t.reconfigure(&[fault(1)]).unwrap();
        let b = a.reconfigure(&[fault(4)]).unwrap();
        assert!(b.is_quarantined(1) && b.is_quarantined(4));
        assert_eq!(b.generation(), 2);
        assert!(b.is_row_stochastic(STOCHASTIC_TOLERANCE));
        assert!(b.is_strongly_connected());
    }

    #[test]
    fn test_split_ring_is_bridged() {
        // Losing 1 and 4 cuts a 6-ring into {0, 5} and {2, 3}.
        let next = ring(6).reconfigure(&[fault(1), fault(4)]).unwrap();
        assert_eq!(next.components(), vec![vec![0, 2, 3, 5]]);
        assert!(next.is_strongly_connected());
        assert!(next.is_row_stochastic(STOCHASTIC_TOLERANCE));

        assert_eq!(next.in_neighbors(0), &[2, 5]);
        assert_eq!(next.in_neighbors(2), &[0, 3]);
        for r in [0, 2] {
            for (_, w) in next.in_weights(r) {
                assert!((w - 1.0 / 3.0).abs() < 1e-12);
            }
            assert!((next.mixing_weight(r, r) - 1.0 / 3.0).abs() < 1e-12);
        }
        // Rows away from the cut are untouched.
        assert_eq!(next.in_neighbors(3), &[2]);
        assert!((next.mixing_weight(3, 3) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_bridges_chain_every_island() {
        // A 9-ring minus 0, 3 and 6 leaves three pairs.
        let next = ring(9)
            .reconfigure(&[fault(0), fault(3), fault(6)])
            .unwrap();
        assert!(next.is_strongly_connected());
        assert!(next.is_row_stochastic(STOCHASTIC_TOLERANCE));
        // Islands {1,2}, {4,5}, {7,8} are chained 1 <-> 4 <-> 7.
        assert_eq!(next.in_neighbors(4), &[1, 5, 7]);
        assert!((next.mixing_weight(4, 4) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_broken_one_way_ring_is_bridged() {
        let spec = TopologySpec::OneWayRing { left: false };
        let t = build_topology(&spec, 4, true).unwrap();
        let next = t.reconfigure(&[fault(2)]).unwrap();
        assert!(next.is_strongly_connected());
        assert!(next.is_row_stochastic(STOCHASTIC_TOLERANCE));
        // 0 -> 1 survives; only the missing directions are added.
        assert_eq!(next.out_neighbors(0), &[1]);
        assert_eq!(next.in_neighbors(1), &[0, 3]);
        assert_eq!(next.in_neighbors(3), &[1]);
    }

    #[test]
    fn test_disconnected_input_is_not_bridged() {
        let spec: TopologySpec = "custom:0->1,1->0,2->3,3->2".parse().unwrap();
        let t = build_topology(&spec, 5, false).unwrap();
        let next = t.reconfigure(&[fault(4)]).unwrap();
        assert_eq!(next.components().len(), 2);
    }

    #[test]
    fn test_equivalence_ignores_generation() {
        let t = ring(5);
        let again = t.reconfigure(&[fault(2)]).unwrap();
        let direct = t.excluding(&BTreeSet::from([2]), 7).unwrap();
        assert!(again.is_equivalent(&direct, 1e-12));
        assert!(!again.is_equivalent(&t, 1e-12));
        let full = build_topology(&TopologySpec::Full, 5, true).unwrap();
        assert!(!t.is_equivalent(&full, 1e-12));
    }

    #[test]
    fn test_strong_connectivity() {
        let directed: TopologySpec = "custom:0->1,1->2,2->0".parse().unwrap();
        assert!(build_topology(&directed, 3, true).unwrap().is_strongly_connected());

        let chain: TopologySpec = "custom:0->1,1->2".parse().unwrap();
        let t = build_topology(&chain, 3, false).unwrap();
        assert!(!t.is_strongly_connected());
        assert_eq!(t.components().len(), 1);
    }

    #[test]
    fn test_edges_listing() {
        let t = ring(3);
        assert_eq!(t.edge_count(), 6);
        let edges = t.edges();
        assert!(edges.iter().all(|&(_, _, w)| (w - 1.0 / 3.0).abs() < 1e-12));
    }
}
