//! Exact synchronization points: two-phase broadcast, global allreduce and
//! allgather, barrier.
//!
//! Unlike consensus rounds these need every rank of the group. Quarantine is
//! ignored, and a rank that does not take part makes the operation fail on
//! every reachable rank instead of degrading it.

use crate::buffer::{BufferGuard, TensorBuffer};
use crate::consensus::round::{Placement, RoundLane};
use crate::context::Context;
use crate::error::{DiffuseError, Result};
use crate::protocol::{Lane, WireMessage, decode_message, encode_message};
use crate::transport::{Envelope, tag_for};
use crate::types::{Rank, Tag};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A staged broadcast payload, validated but not yet installed.
struct Staged {
    buffer: Option<TensorBuffer>,
    reason: Option<String>,
}

/// Group-wide exact operations on the buffers of one rank.
pub struct StateSync {
    ctx: Context,
    timeout: Duration,
    broadcast_epochs: Mutex<HashMap<String, u64>>,
    collective_lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<RoundLane<TensorBuffer>>>>>,
    barrier_epoch: AtomicU64,
}

impl StateSync {
    pub fn new(ctx: Context) -> Self {
        let timeout = ctx.config.sync_timeout;
        Self {
            ctx,
            timeout,
            broadcast_epochs: Mutex::new(HashMap::new()),
            collective_lanes: Mutex::new(HashMap::new()),
            barrier_epoch: AtomicU64::new(0),
        }
    }

    fn next_broadcast_epoch(&self, name: &str) -> u64 {
        let mut epochs = self.broadcast_epochs.lock().unwrap_or_else(|e| e.into_inner());
        let slot = epochs.entry(name.to_string()).or_insert(0);
        let epoch = *slot;
        *slot += 1;
        epoch
    }

    fn collective_lane(&self, name: &str) -> Arc<tokio::sync::Mutex<RoundLane<TensorBuffer>>> {
        let mut lanes = self.collective_lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(name.to_string()).or_default())
    }

    /// Receive the next message on `tag`, giving up at `deadline`.
    async fn recv_until(&self, tag: Tag, deadline: Instant) -> Result<Option<(Envelope, WireMessage)>> {
        loop {
            let env = tokio::select! {
                _ = self.ctx.cancelled() => return Err(DiffuseError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                res = self.ctx.transport.recv(tag) => res?,
            };
            match decode_message(&env.payload) {
                Ok((_, msg)) => return Ok(Some((env, msg))),
                Err(e) => {
                    tracing::warn!(rank = self.ctx.rank(), peer_rank = env.src, error = %e, "undecodable sync message");
                }
            }
        }
    }

    /// Replicate `root`'s value of `name` to every rank, bit for bit.
    ///
    /// Two phases: the root ships its state and collects acknowledgements,
    /// then tells everybody to install (all acknowledged) or discard. Returns
    /// the installed value. Fails with `IncompleteBroadcast` on every
    /// reachable rank when any rank did not acknowledge. A rank without the
    /// buffer registered creates it from the root's state.
    pub async fn broadcast(&self, name: &str, root: Rank) -> Result<TensorBuffer> {
        let world = self.ctx.world_size();
        if root >= world {
            return Err(DiffuseError::UnknownRank {
                rank: root,
                world_size: world,
            });
        }
        let epoch = self.next_broadcast_epoch(name);
        if self.ctx.rank() == root {
            self.broadcast_root(name, epoch).await
        } else {
            self.broadcast_receive(name, root, epoch).await
        }
    }

    async fn broadcast_root(&self, name: &str, epoch: u64) -> Result<TensorBuffer> {
        let rank = self.ctx.rank();
        let world = self.ctx.world_size();
        let guard = self.ctx.buffers.lock(name).await?;
        let tag = tag_for(Lane::Sync, name);
        let data = encode_message(
            &WireMessage::BroadcastData {
                buffer: name.to_string(),
                epoch,
                dtype: guard.dtype() as u8,
                shape: guard.wire_shape(),
                version: guard.version,
                payload: guard.data.to_le_bytes(),
            },
            Lane::Sync,
        )?;
        let peers: Vec<Rank> = (0..world).filter(|&r| r != rank).collect();
        let deadline = Instant::now() + self.timeout;
        let unreached = match self.ctx.transport.broadcast(tag, rank, data, deadline).await? {
            Some(delivery) => delivery.unreached,
            None => peers.clone(),
        };
        let mut rejected: BTreeSet<Rank> = unreached.into_iter().collect();
        let mut pending: BTreeSet<Rank> = peers
            .iter()
            .copied()
            .filter(|p| !rejected.contains(p))
            .collect();

        while !pending.is_empty() {
            let Some((env, msg)) = self.recv_until(tag, deadline).await? else {
                break;
            };
            match msg {
                WireMessage::BroadcastAck {
                    buffer,
                    epoch: e,
                    accepted,
                } if buffer == name && e == epoch => {
                    if pending.remove(&env.src) && !accepted {
                        tracing::warn!(rank, peer_rank = env.src, buffer = name, "broadcast rejected");
                        rejected.insert(env.src);
                    }
                }
                other => {
                    tracing::debug!(rank, peer_rank = env.src, buffer = name, kind = other.kind(), "broadcast: ignoring message");
                }
            }
        }

        let missing: Vec<Rank> = pending.union(&rejected).copied().collect();
        let commit = missing.is_empty();
        let decision = encode_message(
            &WireMessage::BroadcastCommit {
                buffer: name.to_string(),
                epoch,
                commit,
                missing: missing.clone(),
            },
            Lane::Sync,
        )?;
        let sends = peers.iter().map(|&p| self.ctx.transport.send(p, tag, &decision));
        for res in join_all(sends).await {
            if let Err(e) = res {
                tracing::debug!(rank, buffer = name, error = %e, "broadcast decision not delivered");
            }
        }

        if !commit {
            return Err(DiffuseError::IncompleteBroadcast {
                name: name.to_string(),
                root: rank,
                missing,
            });
        }
        tracing::debug!(rank, buffer = name, epoch, "broadcast committed");
        Ok(guard.clone())
    }

    async fn broadcast_receive(&self, name: &str, root: Rank, epoch: u64) -> Result<TensorBuffer> {
        let rank = self.ctx.rank();
        let (mut guard, created) = self.ctx.buffers.lock_or_placeholder(name).await;
        let tag = tag_for(Lane::Sync, name);
        let deadline = Instant::now() + self.timeout;
        let fail = |missing: Vec<Rank>| DiffuseError::IncompleteBroadcast {
            name: name.to_string(),
            root,
            missing,
        };
        let discard = |created: bool| {
            if created {
                self.ctx.buffers.discard_placeholder(name);
            }
        };

        // Phase one: the root's state.
        let staged = loop {
            let delivery = tokio::select! {
                _ = self.ctx.cancelled() => Err(DiffuseError::Cancelled),
                res = self.ctx.transport.broadcast(tag, root, Vec::new(), deadline) => res,
            };
            let bytes = match delivery {
                Ok(Some(delivery)) => delivery.payload,
                Ok(None) => {
                    drop(guard);
                    discard(created);
                    return Err(fail(vec![root]));
                }
                Err(e) => {
                    drop(guard);
                    discard(created);
                    return Err(e);
                }
            };
            let msg = match decode_message(&bytes) {
                Ok((_, msg)) => msg,
                Err(e) => {
                    tracing::warn!(rank, peer_rank = root, error = %e, "undecodable broadcast message");
                    continue;
                }
            };
            match msg {
                WireMessage::BroadcastData {
                    buffer,
                    epoch: e,
                    dtype,
                    shape,
                    version,
                    payload,
                } if buffer == name && e == epoch => {
                    break match TensorBuffer::from_wire(name, dtype, &shape, version, &payload) {
                        Ok(buf) if created => Staged {
                            buffer: Some(buf),
                            reason: None,
                        },
                        Ok(buf) => match guard.check_compatible(buf.dtype(), &buf.shape) {
                            Ok(()) => Staged {
                                buffer: Some(buf),
                                reason: None,
                            },
                            Err(err) => Staged {
                                buffer: None,
                                reason: Some(err.to_string()),
                            },
                        },
                        Err(err) => Staged {
                            buffer: None,
                            reason: Some(err.to_string()),
                        },
                    };
                }
                other => {
                    tracing::debug!(rank, peer_rank = root, buffer = name, kind = other.kind(), "broadcast: ignoring message");
                }
            }
        };

        if let Some(reason) = &staged.reason {
            tracing::warn!(rank, buffer = name, %reason, "rejecting broadcast");
        }
        let ack = encode_message(
            &WireMessage::BroadcastAck {
                buffer: name.to_string(),
                epoch,
                accepted: staged.buffer.is_some(),
            },
            Lane::Sync,
        )?;
        if let Err(e) = self.ctx.transport.send(root, tag, &ack).await {
            tracing::warn!(rank, peer_rank = root, buffer = name, error = %e, "broadcast ack not delivered");
        }

        // Phase two: the root's decision.
        loop {
            let Some((env, msg)) = self.recv_until(tag, deadline).await? else {
                drop(guard);
                discard(created);
                return Err(fail(vec![root]));
            };
            match msg {
                WireMessage::BroadcastCommit {
                    buffer,
                    epoch: e,
                    commit,
                    missing,
                } if buffer == name && e == epoch && env.src == root => {
                    match (commit, staged.buffer) {
                        (true, Some(buf)) => {
                            let version = buf.version.max(guard.version + 1);
                            *guard = TensorBuffer { version, ..buf };
                            tracing::debug!(rank, buffer = name, epoch, "broadcast installed");
                            return Ok(guard.clone());
                        }
                        (_, _) => {
                            drop(guard);
                            discard(created);
                            return Err(fail(if missing.is_empty() { vec![rank] } else { missing }));
                        }
                    }
                }
                other => {
                    tracing::debug!(rank, peer_rank = env.src, buffer = name, kind = other.kind(), "broadcast: ignoring message");
                }
            }
        }
    }

    /// Exchange `name` with every rank. Returns all values keyed by rank,
    /// including the local one.
    async fn exchange(&self, name: &str, operation: &'static str) -> Result<(BufferGuard, BTreeMap<Rank, TensorBuffer>)> {
        let rank = self.ctx.rank();
        let world = self.ctx.world_size();
        let guard = self.ctx.buffers.lock(name).await?;
        let slot = self.collective_lane(name);
        let mut lane = slot.lock().await;
        let epoch = lane.begin();

        let tag = tag_for(Lane::Collective, name);
        let frame = encode_message(
            &WireMessage::Collective {
                buffer: name.to_string(),
                epoch,
                dtype: guard.dtype() as u8,
                shape: guard.wire_shape(),
                payload: guard.data.to_le_bytes(),
            },
            Lane::Collective,
        )?;
        let peers: Vec<Rank> = (0..world).filter(|&r| r != rank).collect();
        let sends = peers.iter().map(|&p| self.ctx.transport.send(p, tag, &frame));
        for (&peer, res) in peers.iter().zip(join_all(sends).await) {
            if let Err(e) = res {
                return Err(DiffuseError::CollectiveFailed {
                    operation,
                    rank: peer,
                    reason: e.to_string(),
                });
            }
        }

        let mut values: BTreeMap<Rank, TensorBuffer> = lane.take(epoch).into_iter().collect();
        let deadline = Instant::now() + self.timeout;
        while values.len() < peers.len() {
            let Some((env, msg)) = self.recv_until(tag, deadline).await? else {
                let missing: Vec<Rank> = peers
                    .iter()
                    .copied()
                    .filter(|p| !values.contains_key(p))
                    .collect();
                return Err(DiffuseError::CollectiveFailed {
                    operation,
                    rank: missing[0],
                    reason: format!(
                        "no contribution from ranks {missing:?} within {}ms",
                        self.timeout.as_millis()
                    ),
                });
            };
            let kind = msg.kind();
            let WireMessage::Collective {
                buffer,
                epoch: e,
                dtype,
                shape,
                payload,
            } = msg
            else {
                tracing::debug!(rank, peer_rank = env.src, buffer = name, kind, "{operation}: ignoring message");
                continue;
            };
            if buffer != name {
                continue;
            }
            let value = TensorBuffer::from_wire(name, dtype, &shape, 0, &payload).map_err(|err| {
                DiffuseError::CollectiveFailed {
                    operation,
                    rank: env.src,
                    reason: err.to_string(),
                }
            })?;
            if let (Placement::Current, Some(value)) = lane.place(epoch, e, env.src, value) {
                values.insert(env.src, value);
            }
        }
        values.insert(rank, guard.clone());
        Ok((guard, values))
    }

    /// Sum (or average) `name` over every rank, in place.
    ///
    /// Contributions are reduced in rank order in `f64`, so every rank ends
    /// with the same bits.
    pub async fn allreduce(&self, name: &str, average: bool) -> Result<TensorBuffer> {
        let (mut guard, values) = self.exchange(name, "allreduce").await?;
        let mut sum = vec![0.0f64; guard.len()];
        for (&src, value) in &values {
            if value.dtype() != guard.dtype() || value.len() != guard.len() {
                return Err(DiffuseError::CollectiveFailed {
                    operation: "allreduce",
                    rank: src,
                    reason: format!(
                        "expected {} x {}, got {} x {}",
                        guard.len(),
                        guard.dtype().name(),
                        value.len(),
                        value.dtype().name()
                    ),
                });
            }
            for (s, x) in sum.iter_mut().zip(value.to_f64()) {
                *s += x;
            }
        }
        if average {
            let n = values.len() as f64;
            for s in &mut sum {
                *s /= n;
            }
        }
        guard.assign_f64(&sum)?;
        Ok(guard.clone())
    }

    /// Every rank's value of `name`, in rank order. The local buffer is not
    /// modified.
    pub async fn allgather(&self, name: &str) -> Result<Vec<TensorBuffer>> {
        let (_guard, values) = self.exchange(name, "allgather").await?;
        Ok(values.into_values().collect())
    }

    /// Block until every rank reaches the barrier.
    pub async fn barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::Relaxed);
        let tag = tag_for(Lane::Barrier, "");
        let timeout = self.ctx.config.barrier_timeout;
        tokio::select! {
            _ = self.ctx.cancelled() => Err(DiffuseError::Cancelled),
            res = self.ctx.transport.barrier(tag, epoch, timeout) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiffuseConfig;
    use crate::transport::{LocalFabric, LocalTransport, Transport};
    use tokio::sync::watch;

    fn group(world: u32, timeout: Duration) -> (Arc<LocalFabric>, watch::Sender<bool>, Vec<Arc<StateSync>>) {
        let (fabric, transports) = LocalTransport::mesh(world);
        let (tx, rx) = watch::channel(false);
        let config = DiffuseConfig {
            sync_timeout: timeout,
            barrier_timeout: timeout,
            ..DiffuseConfig::default()
        };
        let syncs = transports
            .into_iter()
            .map(|t| {
                let t: Arc<dyn Transport> = Arc::new(t);
                Arc::new(StateSync::new(Context::new(t, config.clone(), rx.clone()).unwrap()))
            })
            .collect();
        (fabric, tx, syncs)
    }

    #[tokio::test]
    async fn test_broadcast_creates_missing_buffer() {
        let (_f, _tx, syncs) = group(3, Duration::from_secs(5));
        let root_value = TensorBuffer::from_f32("w", vec![0.1, 0.2, 0.3]);
        syncs[1].ctx.buffers.register(root_value.clone()).await;
        syncs[2]
            .ctx
            .buffers
            .register(TensorBuffer::from_f32("w", vec![9.0, 9.0, 9.0]))
            .await;

        let tasks: Vec<_> = syncs
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                tokio::spawn(async move { s.broadcast("w", 1).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        for s in &syncs {
            let got = s.ctx.buffers.get("w").await.unwrap();
            assert_eq!(got.data, root_value.data);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_dead_rank_fails_everywhere() {
        let (fabric, _tx, syncs) = group(3, Duration::from_millis(300));
        for (i, s) in syncs.iter().enumerate() {
            s.ctx
                .buffers
                .register(TensorBuffer::from_f64("w", vec![i as f64]))
                .await;
        }
        fabric.kill(2);
        let tasks: Vec<_> = syncs[..2]
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                tokio::spawn(async move { s.broadcast("w", 0).await })
            })
            .collect();
        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap());
        }
        match &results[0] {
            Err(DiffuseError::IncompleteBroadcast { root, missing, .. }) => {
                assert_eq!(*root, 0);
                assert_eq!(missing, &vec![2]);
            }
            other => panic!("expected IncompleteBroadcast, got {other:?}"),
        }
        assert!(matches!(results[1], Err(DiffuseError::IncompleteBroadcast { .. })));
        // Rank 1 kept its old value.
        assert_eq!(syncs[1].ctx.buffers.get("w").await.unwrap().to_f64(), vec![1.0]);
    }

    #[tokio::test]
    async fn test_allreduce_is_identical_on_every_rank() {
        let (_f, _tx, syncs) = group(4, Duration::from_secs(5));
        for (i, s) in syncs.iter().enumerate() {
            s.ctx
                .buffers
                .register(TensorBuffer::from_f32("g", vec![0.1 * (i + 1) as f32, 1.0]))
                .await;
        }
        let tasks: Vec<_> = syncs
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                tokio::spawn(async move { s.allreduce("g", true).await })
            })
            .collect();
        let mut results = Vec::new();
        for t in tasks {
            results.push(t.await.unwrap().unwrap());
        }
        for r in &results[1..] {
            assert_eq!(r.data, results[0].data);
        }
        assert_eq!(results[0].as_f32().unwrap()[1], 1.0);
    }

    #[tokio::test]
    async fn test_allgather_in_rank_order() {
        let (_f, _tx, syncs) = group(3, Duration::from_secs(5));
        for (i, s) in syncs.iter().enumerate() {
            s.ctx
                .buffers
                .register(TensorBuffer::from_f64("x", vec![i as f64 * 10.0]))
                .await;
        }
        let tasks: Vec<_> = syncs
            .iter()
            .map(|s| {
                let s = Arc::clone(s);
                tokio::spawn(async move { s.allgather("x").await })
            })
            .collect();
        for t in tasks {
            let all = t.await.unwrap().unwrap();
            let flat: Vec<f64> = all.iter().map(|b| b.to_f64()[0]).collect();
            assert_eq!(flat, vec![0.0, 10.0, 20.0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_allreduce_reports_missing_rank() {
        let (fabric, _tx, syncs) = group(3, Duration::from_millis(200));
        for s in &syncs {
            s.ctx.buffers.register(TensorBuffer::from_f64("g", vec![1.0])).await;
        }
        fabric.mute(2);
        let err = syncs[0].allreduce("g", false).await.unwrap_err();
        assert!(matches!(
            err,
            DiffuseError::CollectiveFailed {
                operation: "allreduce",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_barrier_epochs() {
        let (_f, _tx, syncs) = group(3, Duration::from_secs(5));
        for _ in 0..3 {
            let tasks: Vec<_> = syncs
                .iter()
                .map(|s| {
                    let s = Arc::clone(s);
                    tokio::spawn(async move { s.barrier().await })
                })
                .collect();
            for t in tasks {
                t.await.unwrap().unwrap();
            }
        }
    }
}
