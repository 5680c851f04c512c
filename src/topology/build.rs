use super::graph::{STOCHASTIC_TOLERANCE, Topology};
use super::spec::{Edge, TopologySpec};
use crate::error::{DiffuseError, Result};
use crate::types::Rank;
use std::collections::{BTreeSet, HashSet};

/// Build the generation-0 topology for `world_size` ranks.
///
/// Fails with a configuration error if `spec` references ranks outside the
/// group, has malformed weights, or (when `require_connected` is set and the
/// group has more than one rank) is not strongly connected.
pub fn build_topology(
    spec: &TopologySpec,
    world_size: u32,
    require_connected: bool,
) -> Result<Topology> {
    if world_size == 0 {
        return Err(DiffuseError::config("world_size must be >= 1"));
    }

    let topology = match spec {
        TopologySpec::Ring => ring(world_size),
        TopologySpec::OneWayRing { left } => one_way_ring(world_size, *left),
        TopologySpec::Star { center } => star(*center, world_size)?,
        TopologySpec::Full => full(world_size),
        TopologySpec::ExponentialTwo => exponential_two(world_size),
        TopologySpec::Custom { edges } => custom(edges, world_size)?,
    };

    if require_connected && world_size > 1 && !topology.is_strongly_connected() {
        return Err(DiffuseError::config(format!(
            "topology '{spec}' is not strongly connected over {world_size} ranks"
        )));
    }
    debug_assert!(topology.is_row_stochastic(STOCHASTIC_TOLERANCE));
    Ok(topology)
}

/// Uniform weights `1/(indeg+1)` over the in-neighbors implied by `outs`.
fn uniform(world_size: u32, outs: impl Fn(Rank) -> Vec<Rank>) -> Topology {
    let n = world_size as usize;
    let mut pairs = Vec::new();
    let mut indeg = vec![0usize; n];
    for src in 0..world_size {
        let mut targets = outs(src);
        targets.sort_unstable();
        targets.dedup();
        for dst in targets.into_iter().filter(|&d| d != src) {
            indeg[dst as usize] += 1;
            pairs.push((src, dst));
        }
    }
    let self_weights: Vec<f64> = indeg.iter().map(|&d| 1.0 / (d + 1) as f64).collect();
    let edges: Vec<(Rank, Rank, f64)> = pairs
        .into_iter()
        .map(|(s, d)| (s, d, self_weights[d as usize]))
        .collect();
    Topology::from_parts(world_size, 0, self_weights, &edges, BTreeSet::new())
}

fn ring(world_size: u32) -> Topology {
    uniform(world_size, |r| {
        if world_size == 1 {
            return Vec::new();
        }
        vec![(r + 1) % world_size, (r + world_size - 1) % world_size]
    })
}

fn one_way_ring(world_size: u32, left: bool) -> Topology {
    uniform(world_size, |r| {
        if world_size == 1 {
            return Vec::new();
        }
        let next = if left {
            (r + world_size - 1) % world_size
        } else {
            (r + 1) % world_size
        };
        vec![next]
    })
}

fn full(world_size: u32) -> Topology {
    uniform(world_size, |r| (0..world_size).filter(|&d| d != r).collect())
}

fn exponential_two(world_size: u32) -> Topology {
    uniform(world_size, |r| {
        let mut outs = Vec::new();
        let mut hop: u64 = 1;
        while hop < world_size as u64 {
            outs.push(((r as u64 + hop) % world_size as u64) as Rank);
            hop <<= 1;
        }
        outs
    })
}

/// Star weights: leaves keep `1 - 1/n` and give `1/n` to the center; the
/// center gives `1/n` to itself and to every leaf.
fn star(center: Rank, world_size: u32) -> Result<Topology> {
    if center >= world_size {
        return Err(DiffuseError::config(format!(
            "star center {center} outside group of {world_size}"
        )));
    }
    let share = 1.0 / world_size as f64;
    let mut self_weights = vec![1.0 - share; world_size as usize];
    self_weights[center as usize] = share;
    if world_size == 1 {
        self_weights[0] = 1.0;
    }
    let mut edges = Vec::new();
    for leaf in (0..world_size).filter(|&r| r != center) {
        edges.push((center, leaf, share));
        edges.push((leaf, center, share));
    }
    Ok(Topology::from_parts(
        world_size,
        0,
        self_weights,
        &edges,
        BTreeSet::new(),
    ))
}

fn custom(edges: &[Edge], world_size: u32) -> Result<Topology> {
    let mut seen = HashSet::new();
    for e in edges {
        for rank in [e.src, e.dst] {
            if rank >= world_size {
                return Err(DiffuseError::config(format!(
                    "edge {}->{} references unknown rank {rank} (world_size {world_size})",
                    e.src, e.dst
                )));
            }
        }
        if e.src == e.dst {
            return Err(DiffuseError::config(format!(
                "self-loop {}->{} is not allowed; self weights are implicit",
                e.src, e.dst
            )));
        }
        if !seen.insert((e.src, e.dst)) {
            return Err(DiffuseError::config(format!(
                "duplicate edge {}->{}",
                e.src, e.dst
            )));
        }
    }

    let weighted = edges.iter().filter(|e| e.weight.is_some()).count();
    if weighted == 0 {
        let pairs: Vec<(Rank, Rank)> = edges.iter().map(|e| (e.src, e.dst)).collect();
        return Ok(uniform(world_size, |r| {
            pairs
                .iter()
                .filter(|&&(s, _)| s == r)
                .map(|&(_, d)| d)
                .collect()
        }));
    }
    if weighted != edges.len() {
        return Err(DiffuseError::config(
            "either every custom edge carries a weight or none does",
        ));
    }

    let mut incoming = vec![0.0f64; world_size as usize];
    let mut weighted_edges = Vec::with_capacity(edges.len());
    for e in edges {
        let w = e.weight.unwrap_or_default();
        if !w.is_finite() || w < 0.0 {
            return Err(DiffuseError::config(format!(
                "edge {}->{} has invalid weight {w}",
                e.src, e.dst
            )));
        }
        incoming[e.dst as usize] += w;
        weighted_edges.push((e.src, e.dst, w));
    }

    let mut self_weights = Vec::with_capacity(world_size as usize);
    for (rank, &sum) in incoming.iter().enumerate() {
        if sum > 1.0 + STOCHASTIC_TOLERANCE {
            return Err(DiffuseError::config(format!(
                "incoming weights of rank {rank} sum to {sum} (> 1)"
            )));
        }
        self_weights.push((1.0 - sum).max(0.0));
    }

    Ok(Topology::from_parts(
        world_size,
        0,
        self_weights,
        &weighted_edges,
        BTreeSet::new(),
    ))
}
