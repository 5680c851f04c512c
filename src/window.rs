//! One-sided windows over named buffers.
//!
//! A window gives every rank one slot per in-neighbor. Neighbors write into
//! their slot at this rank (`win_put`, `win_accumulate`) or this rank pulls
//! their current value (`win_get`) without the owner taking part: a background
//! listener applies incoming writes and answers reads. `win_sync` folds the
//! slots into the local buffer.
//!
//! `win_fence` waits until every in-neighbor's writes issued before its own
//! fence have landed. `win_lock` holds incoming writes back until the lock is
//! released, so the owner can read and fold its slots without interleaving.

use crate::buffer::{TensorBuffer, decode_f64, encode_f64};
use crate::context::Context;
use crate::error::{DiffuseError, Result};
use crate::fault::FaultReason;
use crate::protocol::{Lane, WireMessage, decode_message, encode_message};
use crate::transport::tag_for;
use crate::types::{Rank, Tag};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedMutexGuard, oneshot};
use tokio::task::JoinHandle;

/// Per-rank weights keyed by rank.
pub type Weights = BTreeMap<Rank, f64>;

fn window_tag() -> Tag {
    tag_for(Lane::Window, "")
}

fn window_barrier_tag() -> Tag {
    tag_for(Lane::Barrier, "window")
}

#[derive(Default)]
struct WindowState {
    slots: BTreeMap<Rank, Vec<f64>>,
    locked: bool,
    /// Writes that arrived while the window was locked, in arrival order.
    deferred: Vec<(Rank, bool, Vec<f64>)>,
    /// Writes issued to each out-neighbor.
    sent: HashMap<Rank, u64>,
    /// Writes received from each in-neighbor, applied or deferred.
    received: HashMap<Rank, u64>,
    /// Latest fence marker per in-neighbor: `(epoch, writes issued before it)`.
    marks: HashMap<Rank, (u64, u64)>,
}

impl WindowState {
    fn write_slot(&mut self, src: Rank, accumulate: bool, values: Vec<f64>) -> bool {
        let Some(slot) = self.slots.get_mut(&src) else {
            return false;
        };
        if accumulate {
            for (s, x) in slot.iter_mut().zip(values) {
                *s += x;
            }
        } else {
            *slot = values;
        }
        true
    }
}

struct Window {
    len: usize,
    ins: Vec<Rank>,
    outs: Vec<Rank>,
    self_weight: f64,
    in_weights: Weights,
    state: Mutex<WindowState>,
    access: Arc<tokio::sync::Mutex<()>>,
    fence_epoch: AtomicU64,
    progress: Notify,
}

impl Window {
    fn state(&self) -> std::sync::MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fence_reached(&self, epoch: u64) -> bool {
        let st = self.state();
        self.ins.iter().all(|src| match st.marks.get(src) {
            Some(&(marked, writes)) => {
                marked >= epoch && st.received.get(src).copied().unwrap_or(0) >= writes
            }
            None => false,
        })
    }

    /// Unlock and apply the writes held back meanwhile.
    fn release(&self) -> usize {
        let mut st = self.state();
        st.locked = false;
        let deferred = std::mem::take(&mut st.deferred);
        let count = deferred.len();
        for (src, accumulate, values) in deferred {
            st.write_slot(src, accumulate, values);
        }
        count
    }
}

/// Exclusive access to one window.
///
/// While held, writes from neighbors are queued instead of applied. Dropping
/// the lock applies them in arrival order.
pub struct WindowLock {
    name: String,
    window: Arc<Window>,
    _access: OwnedMutexGuard<()>,
}

impl WindowLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot contents as of the moment the lock was taken.
    pub fn slots(&self) -> BTreeMap<Rank, Vec<f64>> {
        self.window.state().slots.clone()
    }

    /// Number of writes waiting for the unlock.
    pub fn pending_writes(&self) -> usize {
        self.window.state().deferred.len()
    }

    pub fn unlock(self) {}
}

impl Drop for WindowLock {
    fn drop(&mut self) {
        let applied = self.window.release();
        tracing::trace!(window = %self.name, applied, "window unlocked");
    }
}

/// The one-sided windows of one rank.
pub struct WindowRegistry {
    ctx: Context,
    windows: Mutex<HashMap<String, Arc<Window>>>,
    pending_gets: Mutex<HashMap<u64, oneshot::Sender<Option<Vec<f64>>>>>,
    next_request: AtomicU64,
    barrier_epoch: AtomicU64,
}

fn check_keys(name: &str, what: &str, weights: &Weights, allowed: impl Fn(Rank) -> bool) -> Result<()> {
    for (&rank, &w) in weights {
        if !allowed(rank) {
            return Err(DiffuseError::InvalidArgument(format!(
                "window '{name}': rank {rank} is not a valid {what} key"
            )));
        }
        if !w.is_finite() {
            return Err(DiffuseError::InvalidArgument(format!(
                "window '{name}': weight {w} for rank {rank} is not finite"
            )));
        }
    }
    Ok(())
}

impl WindowRegistry {
    pub fn new(ctx: Context) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            windows: Mutex::new(HashMap::new()),
            pending_gets: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            barrier_epoch: AtomicU64::new(0),
        })
    }

    fn window(&self, name: &str) -> Result<Arc<Window>> {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| DiffuseError::InvalidArgument(format!("no window named '{name}'")))
    }

    /// Names of the open windows, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    async fn barrier(&self) -> Result<()> {
        let epoch = self.barrier_epoch.fetch_add(1, Ordering::Relaxed);
        self.ctx
            .transport
            .barrier(window_barrier_tag(), epoch, self.ctx.config.barrier_timeout)
            .await
    }

    /// Open a window on buffer `name`. Collective: returns once every rank
    /// has opened it.
    ///
    /// Slots are bound to the in-neighbors of the current topology and start
    /// out holding the local value.
    pub async fn win_create(&self, name: &str) -> Result<()> {
        let rank = self.ctx.rank();
        let value = self.ctx.buffers.get(name).await?.to_f64();
        let topo = self.ctx.topology.window_opened();
        let n = match topo.neighbors_of(rank) {
            Ok(n) => n,
            Err(e) => {
                self.ctx.topology.window_closed();
                return Err(e);
            }
        };
        let window = Window {
            len: value.len(),
            ins: n.ins.to_vec(),
            outs: n.outs.to_vec(),
            self_weight: topo.mixing_weight(rank, rank),
            in_weights: topo.in_weights(rank).collect(),
            state: Mutex::new(WindowState {
                slots: n.ins.iter().map(|&r| (r, value.clone())).collect(),
                ..WindowState::default()
            }),
            access: Arc::new(tokio::sync::Mutex::new(())),
            fence_epoch: AtomicU64::new(0),
            progress: Notify::new(),
        };
        {
            let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            if windows.contains_key(name) {
                self.ctx.topology.window_closed();
                return Err(DiffuseError::InvalidArgument(format!(
                    "window '{name}' already exists"
                )));
            }
            windows.insert(name.to_string(), Arc::new(window));
        }
        tracing::debug!(rank, window = name, generation = topo.generation(), "window created");
        self.barrier().await
    }

    /// Close window `name`. Collective.
    pub async fn win_free(&self, name: &str) -> Result<()> {
        self.barrier().await?;
        let removed = self
            .windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed.is_none() {
            return Err(DiffuseError::InvalidArgument(format!("no window named '{name}'")));
        }
        self.ctx.topology.window_closed();
        Ok(())
    }

    async fn write(&self, name: &str, dst_weights: Option<&Weights>, accumulate: bool) -> Result<()> {
        let window = self.window(name)?;
        let weights: Weights = match dst_weights {
            Some(w) => {
                check_keys(name, "destination", w, |r| window.outs.contains(&r))?;
                w.clone()
            }
            None => window.outs.iter().map(|&r| (r, 1.0)).collect(),
        };
        let value = self.ctx.buffers.get(name).await?.to_f64();
        let frames = weights
            .iter()
            .map(|(&dst, &w)| {
                let scaled: Vec<f64> = value.iter().map(|&x| w * x).collect();
                encode_message(
                    &WireMessage::WinPut {
                        name: name.to_string(),
                        accumulate,
                        payload: encode_f64(&scaled),
                    },
                    Lane::Window,
                )
                .map(|frame| (dst, frame))
            })
            .collect::<Result<Vec<_>>>()?;
        let tag = window_tag();
        let sends = frames
            .iter()
            .map(|(dst, frame)| self.ctx.transport.send(*dst, tag, frame));
        for ((dst, _), res) in frames.iter().zip(join_all(sends).await) {
            match res {
                Ok(()) => *window.state().sent.entry(*dst).or_default() += 1,
                Err(e) => {
                    tracing::warn!(rank = self.ctx.rank(), peer_rank = *dst, window = name, error = %e, "window write failed");
                    self.ctx
                        .monitor
                        .report_failure(*dst, FaultReason::Transport(e.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Wait until the writes every in-neighbor issued before its matching
    /// fence have arrived here. Every rank with an open window takes part.
    ///
    /// Fails with `BarrierTimeout` when an in-neighbor does not fence within
    /// the barrier timeout.
    pub async fn win_fence(&self, name: &str) -> Result<()> {
        let window = self.window(name)?;
        let epoch = window.fence_epoch.fetch_add(1, Ordering::Relaxed);
        let markers: Vec<(Rank, u64)> = {
            let st = window.state();
            window
                .outs
                .iter()
                .map(|&dst| (dst, st.sent.get(&dst).copied().unwrap_or(0)))
                .collect()
        };
        let tag = window_tag();
        for (dst, writes) in markers {
            let frame = encode_message(
                &WireMessage::WinFence {
                    name: name.to_string(),
                    epoch,
                    writes,
                },
                Lane::Window,
            )?;
            if let Err(e) = self.ctx.transport.send(dst, tag, &frame).await {
                self.ctx
                    .monitor
                    .report_failure(dst, FaultReason::Transport(e.to_string()));
            }
        }

        let timeout = self.ctx.config.barrier_timeout;
        let reached = async {
            loop {
                let progress = window.progress.notified();
                if window.fence_reached(epoch) {
                    return;
                }
                progress.await;
            }
        };
        tokio::time::timeout(timeout, reached)
            .await
            .map_err(|_| DiffuseError::BarrierTimeout {
                epoch,
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Take exclusive access to window `name`, waiting for any other holder.
    pub async fn win_lock(&self, name: &str) -> Result<WindowLock> {
        let window = self.window(name)?;
        let access = Arc::clone(&window.access).lock_owned().await;
        window.state().locked = true;
        Ok(WindowLock {
            name: name.to_string(),
            window,
            _access: access,
        })
    }

    /// Overwrite this rank's slot at each destination with `weight * value`.
    /// `None` writes to every out-neighbor with weight 1.
    pub async fn win_put(&self, name: &str, dst_weights: Option<&Weights>) -> Result<()> {
        self.write(name, dst_weights, false).await
    }

    /// Add `weight * value` to this rank's slot at each destination.
    pub async fn win_accumulate(&self, name: &str, dst_weights: Option<&Weights>) -> Result<()> {
        self.write(name, dst_weights, true).await
    }

    /// Fetch the current value of each source into its local slot, scaled by
    /// its weight. `None` fetches every in-neighbor with weight 1.
    ///
    /// Returns the sources that answered before the round deadline; the slots
    /// of the others are left unchanged.
    pub async fn win_get(&self, name: &str, src_weights: Option<&Weights>) -> Result<Vec<Rank>> {
        let window = self.window(name)?;
        let weights: Weights = match src_weights {
            Some(w) => {
                check_keys(name, "source", w, |r| window.ins.contains(&r))?;
                w.clone()
            }
            None => window.ins.iter().map(|&r| (r, 1.0)).collect(),
        };
        let tag = window_tag();
        let deadline = tokio::time::Instant::now() + self.ctx.config.round_timeout;

        let requests = weights.iter().map(|(&src, &w)| {
            let (tx, rx) = oneshot::channel();
            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            self.pending_gets
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(request_id, tx);
            async move {
                let frame = encode_message(
                    &WireMessage::WinGetRequest {
                        name: name.to_string(),
                        request_id,
                    },
                    Lane::Window,
                )?;
                let outcome = match self.ctx.transport.send(src, tag, &frame).await {
                    Ok(()) => tokio::time::timeout_at(deadline, rx).await.ok().and_then(|r| r.ok()),
                    Err(e) => {
                        self.ctx
                            .monitor
                            .report_failure(src, FaultReason::Transport(e.to_string()));
                        None
                    }
                };
                self.pending_gets
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                Ok::<_, DiffuseError>((src, w, outcome))
            }
        });

        let mut fetched = Vec::new();
        for res in join_all(requests).await {
            let (src, w, outcome) = res?;
            match outcome {
                Some(Some(values)) if values.len() == window.len => {
                    window
                        .state()
                        .slots
                        .insert(src, values.into_iter().map(|x| w * x).collect());
                    fetched.push(src);
                }
                Some(_) => {
                    tracing::warn!(rank = self.ctx.rank(), peer_rank = src, window = name, "window get answered without a usable value");
                }
                None => {
                    tracing::debug!(rank = self.ctx.rank(), peer_rank = src, window = name, "window get timed out");
                    self.ctx.monitor.report_failure(src, FaultReason::Timeout);
                }
            }
        }
        Ok(fetched)
    }

    /// Combine the local value and the slots into the local buffer.
    ///
    /// `weights` may name in-neighbors and this rank; `None` uses the
    /// topology's mixing weights. Afterwards each slot named in
    /// `update_weights` is scaled by its weight.
    pub async fn win_sync(
        &self,
        name: &str,
        weights: Option<&Weights>,
        update_weights: Option<&Weights>,
    ) -> Result<TensorBuffer> {
        let rank = self.ctx.rank();
        let window = self.window(name)?;
        let (self_weight, neighbor_weights) = match weights {
            Some(w) => {
                check_keys(name, "sync", w, |r| r == rank || window.ins.contains(&r))?;
                let self_weight = w.get(&rank).copied().unwrap_or(0.0);
                let neighbors: Weights = w
                    .iter()
                    .filter(|(r, _)| **r != rank)
                    .map(|(&r, &x)| (r, x))
                    .collect();
                (self_weight, neighbors)
            }
            None => (window.self_weight, window.in_weights.clone()),
        };
        if let Some(u) = update_weights {
            check_keys(name, "update", u, |r| window.ins.contains(&r))?;
        }

        let mut buffer = self.ctx.buffers.lock(name).await?;
        buffer.check_len(window.len)?;
        let mut combined: Vec<f64> = buffer.to_f64().into_iter().map(|x| self_weight * x).collect();
        {
            let mut st = window.state();
            let slots = &mut st.slots;
            for (src, w) in &neighbor_weights {
                if let Some(slot) = slots.get(src) {
                    for (c, &x) in combined.iter_mut().zip(slot) {
                        *c += w * x;
                    }
                }
            }
            if let Some(u) = update_weights {
                for (src, factor) in u {
                    if let Some(slot) = slots.get_mut(src) {
                        for x in slot.iter_mut() {
                            *x *= factor;
                        }
                    }
                }
            }
        }
        buffer.assign_f64(&combined)?;
        Ok(buffer.clone())
    }

    /// Add every slot into the local buffer and zero the slots.
    pub async fn win_sync_then_collect(&self, name: &str) -> Result<TensorBuffer> {
        let window = self.window(name)?;
        let mut buffer = self.ctx.buffers.lock(name).await?;
        buffer.check_len(window.len)?;
        let mut combined = buffer.to_f64();
        for slot in window.state().slots.values_mut() {
            for (c, x) in combined.iter_mut().zip(slot.iter_mut()) {
                *c += *x;
                *x = 0.0;
            }
        }
        buffer.assign_f64(&combined)?;
        Ok(buffer.clone())
    }

    /// Current slot contents of window `name`, by in-neighbor.
    pub fn slots(&self, name: &str) -> Result<BTreeMap<Rank, Vec<f64>>> {
        Ok(self.window(name)?.state().slots.clone())
    }

    fn apply_put(&self, src: Rank, name: &str, accumulate: bool, payload: &[u8]) {
        let rank = self.ctx.rank();
        let Ok(window) = self.window(name) else {
            tracing::warn!(rank, peer_rank = src, window = name, "write to unknown window");
            return;
        };
        {
            let mut st = window.state();
            *st.received.entry(src).or_default() += 1;
            match decode_f64(payload) {
                Ok(values) if values.len() == window.len => {
                    if st.locked {
                        st.deferred.push((src, accumulate, values));
                    } else if !st.write_slot(src, accumulate, values) {
                        tracing::warn!(rank, peer_rank = src, window = name, "window write from a rank without a slot");
                    }
                }
                _ => tracing::warn!(rank, peer_rank = src, window = name, "malformed window write"),
            }
        }
        window.progress.notify_waiters();
    }

    fn apply_fence(&self, src: Rank, name: &str, epoch: u64, writes: u64) {
        let Ok(window) = self.window(name) else {
            tracing::warn!(rank = self.ctx.rank(), peer_rank = src, window = name, "fence on unknown window");
            return;
        };
        {
            let mut st = window.state();
            let mark = st.marks.entry(src).or_insert((epoch, writes));
            if epoch >= mark.0 {
                *mark = (epoch, writes);
            }
        }
        window.progress.notify_waiters();
    }

    async fn answer_get(&self, src: Rank, name: String, request_id: u64) {
        let value = if self.window(&name).is_ok() {
            self.ctx.buffers.get(&name).await.ok().map(|b| encode_f64(&b.to_f64()))
        } else {
            None
        };
        let frame = match encode_message(
            &WireMessage::WinGetResponse {
                name,
                request_id,
                payload: value,
            },
            Lane::Window,
        ) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(rank = self.ctx.rank(), error = %e, "window response encode failed");
                return;
            }
        };
        if let Err(e) = self.ctx.transport.send(src, window_tag(), &frame).await {
            tracing::debug!(rank = self.ctx.rank(), peer_rank = src, error = %e, "window response not delivered");
        }
    }

    fn resolve(&self, request_id: u64, payload: Option<Vec<u8>>) {
        let waiter = self
            .pending_gets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request_id);
        if let Some(tx) = waiter {
            let _ = tx.send(payload.and_then(|p| decode_f64(&p).ok()));
        }
    }

    /// Apply incoming window traffic until shutdown.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tag = window_tag();
            loop {
                let env = tokio::select! {
                    _ = this.ctx.cancelled() => return,
                    res = this.ctx.transport.recv(tag) => match res {
                        Ok(env) => env,
                        Err(e) => {
                            tracing::debug!(rank = this.ctx.rank(), error = %e, "window listener stopped");
                            return;
                        }
                    },
                };
                let msg = match decode_message(&env.payload) {
                    Ok((_, msg)) => msg,
                    Err(e) => {
                        tracing::warn!(rank = this.ctx.rank(), peer_rank = env.src, error = %e, "undecodable window message");
                        continue;
                    }
                };
                this.ctx.monitor.report_success(env.src);
                match msg {
                    WireMessage::WinPut {
                        name,
                        accumulate,
                        payload,
                    } => this.apply_put(env.src, &name, accumulate, &payload),
                    WireMessage::WinGetRequest { name, request_id } => {
                        let responder = Arc::clone(&this);
                        tokio::spawn(async move {
                            responder.answer_get(env.src, name, request_id).await
                        });
                    }
                    WireMessage::WinGetResponse {
                        request_id, payload, ..
                    } => this.resolve(request_id, payload),
                    WireMessage::WinFence {
                        name,
                        epoch,
                        writes,
                    } => this.apply_fence(env.src, &name, epoch, writes),
                    other => {
                        tracing::warn!(rank = this.ctx.rank(), peer_rank = env.src, kind = other.kind(), "unexpected message on window lane")
                    }
                }
            }
        })
    }
}
