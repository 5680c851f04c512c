//! Merge rules of the consensus variants.
//!
//! A round has a fixed shape: `prepare` decides what to keep and what to
//! send, the engine exchanges shares with neighbors, `merge` combines what
//! arrived. Strategies differ only in those two steps and in the auxiliary
//! state they carry from round to round.

/// What `prepare` produced for one round.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    /// Values sent to every out-neighbor.
    pub share: Vec<f64>,
    /// Scalar sent alongside `share`.
    pub share_weight: f64,
    /// The local term of the merge.
    pub own: Vec<f64>,
    /// Scalar kept alongside `own`.
    pub own_weight: f64,
}

/// A contribution that arrived from an in-neighbor.
#[derive(Debug, Clone, Copy)]
pub struct Received<'a> {
    pub src: u32,
    /// Mixing weight the local rank applies to `src`.
    pub weight: f64,
    pub values: &'a [f64],
    /// The sender's scalar (push-sum weight).
    pub scalar: f64,
}

/// Everything `merge` needs.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    pub prepared: &'a Prepared,
    /// Mixing weight the local rank applies to itself.
    pub self_weight: f64,
    pub received: &'a [Received<'a>],
    /// Whether every expected in-neighbor contributed.
    pub complete: bool,
}

/// A consensus variant.
pub trait MergeStrategy: Send + Sync + 'static {
    /// State carried between rounds of one buffer.
    type Aux: Clone + Default + Send + Sync + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Split the local value into the kept part and the part sent to each of
    /// `out_degree` out-neighbors.
    fn prepare(&self, value: &[f64], aux: &mut Self::Aux, out_degree: usize) -> Prepared;

    /// Combine the kept part with the received contributions.
    fn merge(&self, input: MergeInput<'_>, aux: &mut Self::Aux) -> Vec<f64>;
}

/// Weighted sum `self_w * own + Σ w_j x_j`, rescaled by the weight mass that
/// actually arrived when a contribution is missing.
fn weighted_average(
    own: &[f64],
    self_weight: f64,
    received: &[Received<'_>],
    complete: bool,
    scale: impl Fn(f64) -> f64,
) -> Vec<f64> {
    let self_w = scale(self_weight);
    let mut out: Vec<f64> = own.iter().map(|&x| self_w * x).collect();
    let mut mass = self_w;
    for r in received {
        let w = scale(r.weight);
        mass += w;
        for (o, &x) in out.iter_mut().zip(r.values) {
            *o += w * x;
        }
    }
    if !complete && mass > 0.0 {
        for o in &mut out {
            *o /= mass;
        }
    }
    out
}

/// Decentralized averaging (neighbor allreduce): `x ← Σ_j W_ij x_j`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeighborAverage;

impl MergeStrategy for NeighborAverage {
    type Aux = ();

    fn name(&self) -> &'static str {
        "neighbor-average"
    }

    fn prepare(&self, value: &[f64], _aux: &mut (), _out_degree: usize) -> Prepared {
        Prepared {
            share: value.to_vec(),
            share_weight: 0.0,
            own: value.to_vec(),
            own_weight: 1.0,
        }
    }

    fn merge(&self, input: MergeInput<'_>, _aux: &mut ()) -> Vec<f64> {
        weighted_average(
            &input.prepared.own,
            input.self_weight,
            input.received,
            input.complete,
            |w| w,
        )
    }
}

/// Push-sum weight carried between rounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushSumWeight(pub f64);

impl Default for PushSumWeight {
    fn default() -> Self {
        Self(1.0)
    }
}

/// Push-sum gossip over directed graphs.
///
/// Each rank holds mass `(x·w, w)`, keeps `1/(outdeg+1)` of it and pushes the
/// same share to every out-neighbor. The estimate is `Σ(x·w) / Σw`. Lost
/// shares are not renormalized; the ratio stays unbiased.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushSum;

impl MergeStrategy for PushSum {
    type Aux = PushSumWeight;

    fn name(&self) -> &'static str {
        "push-sum"
    }

    fn prepare(&self, value: &[f64], aux: &mut PushSumWeight, out_degree: usize) -> Prepared {
        let fraction = 1.0 / (out_degree + 1) as f64;
        let w = aux.0 * fraction;
        let share: Vec<f64> = value.iter().map(|&x| x * w).collect();
        Prepared {
            own: share.clone(),
            share,
            share_weight: w,
            own_weight: w,
        }
    }

    fn merge(&self, input: MergeInput<'_>, aux: &mut PushSumWeight) -> Vec<f64> {
        let mut mass = input.prepared.own.clone();
        let mut weight = input.prepared.own_weight;
        for r in input.received {
            weight += r.scalar;
            for (m, &x) in mass.iter_mut().zip(r.values) {
                *m += x;
            }
        }
        aux.0 = weight;
        if weight <= 0.0 {
            return mass;
        }
        mass.into_iter().map(|m| m / weight).collect()
    }
}

/// Previous combined and adapted values of an exact-diffusion buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffusionState {
    /// `(x_prev, ψ_prev)`; `None` before the first round.
    pub previous: Option<(Vec<f64>, Vec<f64>)>,
    /// `ψ` of the round in flight.
    pending_psi: Vec<f64>,
}

/// Exact diffusion: removes the steady-state bias of plain diffusion.
///
/// The buffer value at round start is the adapted value `ψ` (after the local
/// optimizer step). The rank sends the corrected `φ = ψ + x_prev − ψ_prev` and
/// combines with `Ā = (I + W) / 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactDiffusion;

impl MergeStrategy for ExactDiffusion {
    type Aux = DiffusionState;

    fn name(&self) -> &'static str {
        "exact-diffusion"
    }

    fn prepare(&self, value: &[f64], aux: &mut DiffusionState, _out_degree: usize) -> Prepared {
        let phi: Vec<f64> = match &aux.previous {
            Some((x_prev, psi_prev)) if x_prev.len() == value.len() => value
                .iter()
                .zip(x_prev)
                .zip(psi_prev)
                .map(|((&psi, &x), &p)| psi + x - p)
                .collect(),
            _ => value.to_vec(),
        };
        aux.pending_psi = value.to_vec();
        Prepared {
            share: phi.clone(),
            share_weight: 0.0,
            own: phi,
            own_weight: 1.0,
        }
    }

    fn merge(&self, input: MergeInput<'_>, aux: &mut DiffusionState) -> Vec<f64> {
        // Ā = (I + W) / 2: self weight (1 + w_ii) / 2, neighbor weight w_ij / 2.
        let self_weight = (1.0 + input.self_weight) / 2.0;
        let mut out: Vec<f64> = input.prepared.own.iter().map(|&x| self_weight * x).collect();
        let mut mass = self_weight;
        for r in input.received {
            let w = r.weight / 2.0;
            mass += w;
            for (o, &x) in out.iter_mut().zip(r.values) {
                *o += w * x;
            }
        }
        if !input.complete && mass > 0.0 {
            for o in &mut out {
                *o /= mass;
            }
        }
        let psi = std::mem::take(&mut aux.pending_psi);
        aux.previous = Some((out.clone(), psi));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received<'a>(src: u32, weight: f64, values: &'a [f64], scalar: f64) -> Received<'a> {
        Received {
            src,
            weight,
            values,
            scalar,
        }
    }

    #[test]
    fn test_neighbor_average_full_round() {
        let s = NeighborAverage;
        let prepared = s.prepare(&[1.0], &mut (), 2);
        let a = [2.0];
        let b = [5.0];
        let rec = [received(1, 1.0 / 3.0, &a, 0.0), received(4, 1.0 / 3.0, &b, 0.0)];
        let out = s.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: 1.0 / 3.0,
                received: &rec,
                complete: true,
            },
            &mut (),
        );
        assert!((out[0] - 8.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_neighbor_average_partial_renormalizes() {
        let s = NeighborAverage;
        let prepared = s.prepare(&[1.0, 10.0], &mut (), 2);
        let a = [3.0, 20.0];
        let rec = [received(1, 1.0 / 3.0, &a, 0.0)];
        let out = s.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: 1.0 / 3.0,
                received: &rec,
                complete: false,
            },
            &mut (),
        );
        assert!((out[0] - 2.0).abs() < 1e-12);
        assert!((out[1] - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_push_sum_mass_conservation() {
        let s = PushSum;
        let mut aux = PushSumWeight::default();
        let prepared = s.prepare(&[4.0], &mut aux, 1);
        assert_eq!(prepared.share, vec![2.0]);
        assert_eq!(prepared.share_weight, 0.5);

        // The neighbor held x = 8 with w = 1 and also pushed half.
        let incoming = [4.0];
        let rec = [received(1, 0.5, &incoming, 0.5)];
        let out = s.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: 0.5,
                received: &rec,
                complete: true,
            },
            &mut aux,
        );
        assert_eq!(out, vec![6.0]);
        assert_eq!(aux.0, 1.0);
    }

    #[test]
    fn test_push_sum_missing_share_keeps_ratio() {
        let s = PushSum;
        let mut aux = PushSumWeight::default();
        let prepared = s.prepare(&[3.0], &mut aux, 2);
        let out = s.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: 1.0 / 3.0,
                received: &[],
                complete: false,
            },
            &mut aux,
        );
        assert!((out[0] - 3.0).abs() < 1e-12);
        assert!((aux.0 - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_exact_diffusion_correction() {
        let s = ExactDiffusion;
        let mut aux = DiffusionState::default();
        let first = s.prepare(&[2.0], &mut aux, 1);
        assert_eq!(first.share, vec![2.0]);
        let x = s.merge(
            MergeInput {
                prepared: &first,
                self_weight: 1.0,
                received: &[],
                complete: true,
            },
            &mut aux,
        );
        assert_eq!(x, vec![2.0]);

        // ψ = 3, x_prev = 2, ψ_prev = 2 → φ = 3.
        let second = s.prepare(&[3.0], &mut aux, 1);
        assert_eq!(second.share, vec![3.0]);
        assert_eq!(aux.previous, Some((vec![2.0], vec![2.0])));
    }

    #[test]
    fn test_exact_diffusion_half_step_weights() {
        let s = ExactDiffusion;
        let mut aux = DiffusionState::default();
        let prepared = s.prepare(&[0.0], &mut aux, 1);
        let other = [4.0];
        let rec = [received(1, 0.5, &other, 0.0)];
        let out = s.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: 0.5,
                received: &rec,
                complete: true,
            },
            &mut aux,
        );
        // Ā row: self 0.75, neighbor 0.25.
        assert!((out[0] - 1.0).abs() < 1e-12);
    }
}
