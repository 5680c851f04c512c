use super::RoundReport;
use super::round::{Placement, RoundLane};
use super::strategy::{MergeInput, MergeStrategy, Received};
use crate::buffer::{TensorBuffer, decode_f64, encode_f64};
use crate::context::Context;
use crate::error::{DiffuseError, Result};
use crate::fault::FaultReason;
use crate::protocol::{Lane, WireMessage, decode_message, encode_message};
use crate::topology::Topology;
use crate::transport::tag_for;
use crate::types::{Rank, Tag};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

struct Contribution {
    values: Vec<f64>,
    scalar: f64,
    generation: u64,
}

struct ConsensusLane<A> {
    rounds: RoundLane<Contribution>,
    aux: A,
}

impl<A: Default> Default for ConsensusLane<A> {
    fn default() -> Self {
        Self {
            rounds: RoundLane::default(),
            aux: A::default(),
        }
    }
}

type Lanes<T> = Mutex<HashMap<String, Arc<tokio::sync::Mutex<T>>>>;

fn lane_for<T: Default>(lanes: &Lanes<T>, name: &str) -> Arc<tokio::sync::Mutex<T>> {
    let mut lanes = lanes.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(lanes.entry(name.to_string()).or_default())
}

/// Values gathered from in-neighbors by [`ConsensusEngine::neighbor_allgather`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatherReport {
    pub buffer: String,
    pub round: u64,
    pub generation: u64,
    /// In-neighbor values that arrived before the deadline, by rank.
    pub values: Vec<(Rank, TensorBuffer)>,
    pub missing: Vec<Rank>,
    pub timed_out: bool,
    pub isolated: bool,
}

/// Runs consensus rounds of strategy `S` over the buffers of one rank.
///
/// Rounds on one buffer are strictly sequential: the buffer lock is held from
/// the first send until the merge is written. Rounds on different buffers run
/// concurrently. The buffer is written only after the merge, so a round that
/// is cancelled or dropped leaves it untouched.
pub struct ConsensusEngine<S: MergeStrategy> {
    ctx: Context,
    strategy: S,
    round_timeout: Duration,
    lanes: Lanes<ConsensusLane<S::Aux>>,
    gather_lanes: Lanes<RoundLane<TensorBuffer>>,
}

impl<S: MergeStrategy> ConsensusEngine<S> {
    pub fn new(ctx: Context, strategy: S) -> Self {
        let round_timeout = ctx.config.round_timeout;
        Self {
            ctx,
            strategy,
            round_timeout,
            lanes: Mutex::new(HashMap::new()),
            gather_lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Override the per-round deadline.
    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    /// Id the next round on `name` will get.
    pub async fn next_round(&self, name: &str) -> u64 {
        lane_for(&self.lanes, name).lock().await.rounds.next_round()
    }

    /// Forget the strategy state carried for `name` (after a checkpoint
    /// restore). Round ids keep counting.
    pub async fn reset_state(&self, name: &str) {
        lane_for(&self.lanes, name).lock().await.aux = S::Aux::default();
    }

    fn neighbors(&self, topo: &Topology) -> Result<(Vec<Rank>, Vec<Rank>)> {
        let rank = self.ctx.rank();
        if topo.is_quarantined(rank) {
            return Ok((Vec::new(), Vec::new()));
        }
        let n = topo.neighbors_of(rank)?;
        Ok((n.ins.to_vec(), n.outs.to_vec()))
    }

    /// Run one round on `name` and merge the result into the buffer.
    ///
    /// A round that hits its deadline merges the contributions that did
    /// arrive; that is reported through `RoundReport::timed_out`, not as an
    /// error. Fails with `TopologyDisconnected` once the fault monitor has
    /// latched it, and with `Cancelled` on shutdown.
    pub async fn run_round(&self, name: &str) -> Result<RoundReport> {
        self.ctx.monitor.check()?;
        let rank = self.ctx.rank();
        let mut buffer = self.ctx.buffers.lock(name).await?;
        let slot = lane_for(&self.lanes, name);
        let mut lane = slot.lock().await;
        let round = lane.rounds.begin();

        let topo = self.ctx.topology.snapshot();
        let generation = topo.generation();
        let (ins, outs) = self.neighbors(&topo)?;
        let mut report = RoundReport {
            buffer: name.to_string(),
            round,
            generation,
            received: Vec::new(),
            missing: Vec::new(),
            timed_out: false,
            isolated: false,
        };
        if ins.is_empty() && outs.is_empty() {
            tracing::debug!(rank, buffer = name, round, generation, "isolated rank; buffer unchanged");
            report.isolated = true;
            return Ok(report);
        }

        let value = buffer.to_f64();
        let mut aux = lane.aux.clone();
        let prepared = self.strategy.prepare(&value, &mut aux, outs.len());

        let tag = tag_for(Lane::Consensus, name);
        let frame = encode_message(
            &WireMessage::Contribution {
                buffer: name.to_string(),
                round,
                generation,
                payload: encode_f64(&prepared.share),
                weight: prepared.share_weight,
            },
            Lane::Consensus,
        )?;
        let unreachable = self.send_to(&outs, tag, &frame).await;

        let deadline = Instant::now() + self.round_timeout;
        let len = value.len();
        let (arrived, timed_out) = self
            .collect(&mut lane.rounds, name, tag, round, &ins, deadline, |msg| match msg {
                WireMessage::Contribution {
                    buffer,
                    round,
                    generation,
                    payload,
                    weight,
                } if buffer == name => {
                    let values = decode_f64(&payload).ok()?;
                    (values.len() == len).then_some((
                        round,
                        Contribution {
                            values,
                            scalar: weight,
                            generation,
                        },
                    ))
                }
                _ => None,
            })
            .await?;

        let missing: Vec<Rank> = ins
            .iter()
            .copied()
            .filter(|r| !arrived.contains_key(r))
            .collect();
        self.report_missing(&missing, &unreachable);

        let received: Vec<Received<'_>> = arrived
            .iter()
            .map(|(&src, c)| {
                if c.generation != generation {
                    tracing::trace!(rank, peer_rank = src, buffer = name, theirs = c.generation, generation, "generation skew");
                }
                Received {
                    src,
                    weight: topo.mixing_weight(rank, src),
                    values: &c.values,
                    scalar: c.scalar,
                }
            })
            .collect();
        let merged = self.strategy.merge(
            MergeInput {
                prepared: &prepared,
                self_weight: topo.mixing_weight(rank, rank),
                received: &received,
                complete: missing.is_empty(),
            },
            &mut aux,
        );
        buffer.assign_f64(&merged)?;
        lane.aux = aux;

        if timed_out {
            tracing::debug!(
                rank,
                buffer = name,
                round,
                generation,
                missing = ?missing,
                strategy = self.strategy.name(),
                "round deadline expired; merged partial contributions"
            );
        }
        report.received = arrived.keys().copied().collect();
        report.missing = missing;
        report.timed_out = timed_out;
        Ok(report)
    }

    /// Exchange the value of `name` with neighbors without merging.
    ///
    /// Returns the in-neighbor values that arrived before the deadline. The
    /// local buffer is not modified.
    pub async fn neighbor_allgather(&self, name: &str) -> Result<GatherReport> {
        self.ctx.monitor.check()?;
        let rank = self.ctx.rank();
        let buffer = self.ctx.buffers.lock(name).await?;
        let slot = lane_for(&self.gather_lanes, name);
        let mut rounds = slot.lock().await;
        let round = rounds.begin();

        let topo = self.ctx.topology.snapshot();
        let generation = topo.generation();
        let (ins, outs) = self.neighbors(&topo)?;
        let mut report = GatherReport {
            buffer: name.to_string(),
            round,
            generation,
            values: Vec::new(),
            missing: Vec::new(),
            timed_out: false,
            isolated: false,
        };
        if ins.is_empty() && outs.is_empty() {
            tracing::debug!(rank, buffer = name, round, generation, "isolated rank; nothing to gather");
            report.isolated = true;
            return Ok(report);
        }

        let tag = tag_for(Lane::Gather, name);
        let frame = encode_message(
            &WireMessage::Gather {
                buffer: name.to_string(),
                round,
                dtype: buffer.dtype() as u8,
                shape: buffer.wire_shape(),
                payload: buffer.data.to_le_bytes(),
            },
            Lane::Gather,
        )?;
        let unreachable = self.send_to(&outs, tag, &frame).await;

        let deadline = Instant::now() + self.round_timeout;
        let (arrived, timed_out) = self
            .collect(&mut rounds, name, tag, round, &ins, deadline, |msg| match msg {
                WireMessage::Gather {
                    buffer,
                    round,
                    dtype,
                    shape,
                    payload,
                } if buffer == name => TensorBuffer::from_wire(name, dtype, &shape, 0, &payload)
                    .ok()
                    .map(|t| (round, t)),
                _ => None,
            })
            .await?;

        report.missing = ins
            .iter()
            .copied()
            .filter(|r| !arrived.contains_key(r))
            .collect();
        self.report_missing(&report.missing, &unreachable);
        report.values = arrived.into_iter().collect();
        report.timed_out = timed_out;
        Ok(report)
    }

    /// Send `frame` to every rank in `dests` concurrently. Failures go to the
    /// fault monitor; the failed ranks are returned.
    async fn send_to(&self, dests: &[Rank], tag: Tag, frame: &[u8]) -> Vec<Rank> {
        let transport = &self.ctx.transport;
        let sends = dests.iter().map(|&d| transport.send(d, tag, frame));
        let mut failed = Vec::new();
        for (&dest, res) in dests.iter().zip(join_all(sends).await) {
            if let Err(e) = res {
                tracing::warn!(rank = self.ctx.rank(), peer_rank = dest, error = %e, "send failed");
                self.ctx
                    .monitor
                    .report_failure(dest, FaultReason::Transport(e.to_string()));
                failed.push(dest);
            }
        }
        failed
    }

    /// Charge a timeout to each missing in-neighbor, skipping ranks already
    /// charged this round for a failed send.
    fn report_missing(&self, missing: &[Rank], charged: &[Rank]) {
        for &peer in missing.iter().filter(|r| !charged.contains(r)) {
            self.ctx.monitor.report_failure(peer, FaultReason::Timeout);
        }
    }

    /// Receive on `tag` until every rank in `expected` has contributed to
    /// `round` or `deadline` passes. Returns the contributions and whether
    /// the deadline fired.
    #[allow(clippy::too_many_arguments)]
    async fn collect<T>(
        &self,
        rounds: &mut RoundLane<T>,
        name: &str,
        tag: Tag,
        round: u64,
        expected: &[Rank],
        deadline: Instant,
        accept: impl Fn(WireMessage) -> Option<(u64, T)>,
    ) -> Result<(BTreeMap<Rank, T>, bool)> {
        let rank = self.ctx.rank();
        let mut arrived: BTreeMap<Rank, T> = rounds
            .take(round)
            .into_iter()
            .filter(|(src, _)| expected.contains(src))
            .collect();

        while arrived.len() < expected.len() {
            let env = tokio::select! {
                _ = self.ctx.cancelled() => return Err(DiffuseError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok((arrived, true)),
                res = self.ctx.transport.recv(tag) => res?,
            };
            let msg = match decode_message(&env.payload) {
                Ok((_, msg)) => msg,
                Err(e) => {
                    tracing::warn!(rank, peer_rank = env.src, buffer = name, error = %e, "undecodable message");
                    continue;
                }
            };
            let kind = msg.kind();
            let Some((msg_round, value)) = accept(msg) else {
                tracing::warn!(rank, peer_rank = env.src, buffer = name, kind, "unexpected message");
                continue;
            };
            self.ctx.monitor.report_success(env.src);

            match rounds.place(round, msg_round, env.src, value) {
                (Placement::Current, Some(value)) if expected.contains(&env.src) => {
                    arrived.insert(env.src, value);
                }
                (Placement::Current, _) => {
                    tracing::trace!(rank, peer_rank = env.src, buffer = name, round, "contribution from non-neighbor dropped");
                }
                (Placement::Stashed, _) => {
                    tracing::trace!(rank, peer_rank = env.src, buffer = name, round, msg_round, "early contribution stashed");
                }
                (Placement::Stale, _) => {
                    tracing::trace!(rank, peer_rank = env.src, buffer = name, round, msg_round, "stale contribution dropped");
                }
            }
        }
        Ok((arrived, false))
    }
}
