use super::handle::{RoundHandle, WindowHandle};
use crate::buffer::TensorBuffer;
use crate::config::DiffuseConfig;
use crate::consensus::{
    ConsensusAlgorithm, ConsensusEngine, ExactDiffusion, GatherReport, NeighborAverage, PushSum,
    RoundReport,
};
use crate::context::Context;
use crate::error::Result;
use crate::fault::{FaultRecord, RankHealth, heartbeat};
use crate::sync::StateSync;
use crate::topology::{Topology, TopologyEvent, TopologySpec};
use crate::transport::Transport;
use crate::types::{Rank, RankInfo};
use crate::window::{Weights, WindowLock, WindowRegistry};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// The consensus engine selected by configuration.
enum Engine {
    NeighborAverage(ConsensusEngine<NeighborAverage>),
    PushSum(ConsensusEngine<PushSum>),
    ExactDiffusion(ConsensusEngine<ExactDiffusion>),
}

impl Engine {
    fn new(ctx: Context, algorithm: ConsensusAlgorithm) -> Self {
        match algorithm {
            ConsensusAlgorithm::NeighborAverage => {
                Engine::NeighborAverage(ConsensusEngine::new(ctx, NeighborAverage))
            }
            ConsensusAlgorithm::PushSum => Engine::PushSum(ConsensusEngine::new(ctx, PushSum)),
            ConsensusAlgorithm::ExactDiffusion => {
                Engine::ExactDiffusion(ConsensusEngine::new(ctx, ExactDiffusion))
            }
        }
    }

    async fn run_round(&self, name: &str) -> Result<RoundReport> {
        match self {
            Engine::NeighborAverage(e) => e.run_round(name).await,
            Engine::PushSum(e) => e.run_round(name).await,
            Engine::ExactDiffusion(e) => e.run_round(name).await,
        }
    }

    async fn neighbor_allgather(&self, name: &str) -> Result<GatherReport> {
        match self {
            Engine::NeighborAverage(e) => e.neighbor_allgather(name).await,
            Engine::PushSum(e) => e.neighbor_allgather(name).await,
            Engine::ExactDiffusion(e) => e.neighbor_allgather(name).await,
        }
    }

    async fn reset_state(&self, name: &str) {
        match self {
            Engine::NeighborAverage(e) => e.reset_state(name).await,
            Engine::PushSum(e) => e.reset_state(name).await,
            Engine::ExactDiffusion(e) => e.reset_state(name).await,
        }
    }
}

/// The async API of one rank.
///
/// Owns the consensus engine, the exact synchronization service, the
/// one-sided windows and the background tasks that keep fault detection
/// running (reconfiguration ticker, health listener, heartbeats, window
/// listener). Background tasks stop on [`shutdown`](Self::shutdown) or drop.
///
/// # Example
///
/// ```no_run
/// use diffuse::client::DiffuseClient;
/// use diffuse::{DiffuseConfig, TensorBuffer};
///
/// # async fn example() -> diffuse::Result<()> {
/// let clients = DiffuseClient::bootstrap_local(4, DiffuseConfig::default()).await?;
/// for (i, c) in clients.iter().enumerate() {
///     c.register(TensorBuffer::from_f32("fc.weight", vec![i as f32; 16])).await;
/// }
/// // Every rank then calls `neighbor_allreduce("fc.weight")` once per step.
/// # Ok(())
/// # }
/// ```
pub struct DiffuseClient {
    ctx: Context,
    engine: Arc<Engine>,
    sync: StateSync,
    windows: Arc<WindowRegistry>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiffuseClient {
    /// Create a client on an established transport.
    ///
    /// Must be called within a tokio runtime: spawns the background tasks.
    pub fn new(transport: Arc<dyn Transport>, config: DiffuseConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = Context::new(transport, config, shutdown_rx.clone())?;
        let engine = Arc::new(Engine::new(ctx.clone(), ctx.config.algorithm));
        let sync = StateSync::new(ctx.clone());
        let windows = WindowRegistry::new(ctx.clone());

        let mut tasks = vec![
            ctx.monitor.spawn_ticker(shutdown_rx.clone()),
            heartbeat::spawn_health_listener(
                Arc::clone(&ctx.transport),
                Arc::clone(&ctx.monitor),
                shutdown_rx.clone(),
            ),
            windows.spawn_listener(),
        ];
        if ctx.config.heartbeats_enabled() {
            tasks.push(heartbeat::spawn_heartbeat(
                Arc::clone(&ctx.transport),
                Arc::clone(&ctx.monitor),
                ctx.config.heartbeat_interval,
                ctx.config.heartbeat_timeout,
                shutdown_rx,
            ));
        }
        tracing::debug!(
            rank = ctx.rank(),
            world_size = ctx.world_size(),
            topology = %ctx.config.topology,
            algorithm = %ctx.config.algorithm,
            "client started"
        );

        Ok(Self {
            ctx,
            engine,
            sync,
            windows,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// This client's rank (0-indexed).
    pub fn rank(&self) -> Rank {
        self.ctx.rank()
    }

    /// Number of ranks in the group.
    pub fn world_size(&self) -> u32 {
        self.ctx.world_size()
    }

    pub fn rank_info(&self) -> RankInfo {
        self.ctx.info()
    }

    pub fn config(&self) -> &DiffuseConfig {
        self.ctx.config()
    }

    pub fn algorithm(&self) -> ConsensusAlgorithm {
        self.ctx.config.algorithm
    }

    /// Shared handles, for driving lower-level components directly.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    // Buffers.

    /// Register `buffer`, or overwrite the current value under its name.
    pub async fn register(&self, buffer: TensorBuffer) {
        self.ctx.buffers.register(buffer).await
    }

    /// Current value of buffer `name`.
    pub async fn buffer(&self, name: &str) -> Result<TensorBuffer> {
        self.ctx.buffers.get(name).await
    }

    pub async fn remove_buffer(&self, name: &str) -> Result<TensorBuffer> {
        self.ctx.buffers.remove(name).await
    }

    pub fn buffer_names(&self) -> Vec<String> {
        self.ctx.buffers.names()
    }

    // Topology and health.

    /// The active topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.ctx.topology.snapshot()
    }

    /// Notifications of topology swaps.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.ctx.topology.subscribe()
    }

    /// Replace the topology by hand. Refused while windows are open.
    pub fn set_topology(&self, spec: TopologySpec) -> Result<Arc<Topology>> {
        self.ctx.topology.set_topology(spec)
    }

    pub fn health(&self, peer: Rank) -> RankHealth {
        self.ctx.monitor.health(peer)
    }

    pub fn quarantined(&self) -> Vec<Rank> {
        self.ctx.monitor.quarantined()
    }

    pub fn fault_history(&self) -> Vec<FaultRecord> {
        self.ctx.monitor.history()
    }

    // Consensus.

    /// Run one consensus round on `name` with the configured algorithm.
    pub async fn neighbor_allreduce(&self, name: &str) -> Result<RoundReport> {
        self.engine.run_round(name).await
    }

    /// Start a consensus round in the background.
    pub fn neighbor_allreduce_async(&self, name: &str) -> RoundHandle {
        let engine = Arc::clone(&self.engine);
        let name = name.to_string();
        RoundHandle::spawn(async move { engine.run_round(&name).await })
    }

    /// Exchange `name` with neighbors without merging.
    pub async fn neighbor_allgather(&self, name: &str) -> Result<GatherReport> {
        self.engine.neighbor_allgather(name).await
    }

    /// Drop the algorithm state carried for `name`.
    pub async fn reset_consensus_state(&self, name: &str) {
        self.engine.reset_state(name).await
    }

    // Exact synchronization.

    /// Replicate `root`'s value of `name` to every rank.
    pub async fn broadcast(&self, name: &str, root: Rank) -> Result<TensorBuffer> {
        self.sync.broadcast(name, root).await
    }

    pub async fn allreduce(&self, name: &str, average: bool) -> Result<TensorBuffer> {
        self.sync.allreduce(name, average).await
    }

    pub async fn allgather(&self, name: &str) -> Result<Vec<TensorBuffer>> {
        self.sync.allgather(name).await
    }

    pub async fn barrier(&self) -> Result<()> {
        self.sync.barrier().await
    }

    // Windows.

    pub async fn win_create(&self, name: &str) -> Result<()> {
        self.windows.win_create(name).await
    }

    pub async fn win_free(&self, name: &str) -> Result<()> {
        self.windows.win_free(name).await
    }

    pub async fn win_put(&self, name: &str, dst_weights: Option<&Weights>) -> Result<()> {
        self.windows.win_put(name, dst_weights).await
    }

    pub async fn win_accumulate(&self, name: &str, dst_weights: Option<&Weights>) -> Result<()> {
        self.windows.win_accumulate(name, dst_weights).await
    }

    pub async fn win_get(&self, name: &str, src_weights: Option<&Weights>) -> Result<Vec<Rank>> {
        self.windows.win_get(name, src_weights).await
    }

    /// Start a `win_put` in the background.
    pub fn win_put_async(&self, name: &str, dst_weights: Option<Weights>) -> WindowHandle<()> {
        let windows = Arc::clone(&self.windows);
        let name = name.to_string();
        WindowHandle::spawn(async move { windows.win_put(&name, dst_weights.as_ref()).await })
    }

    /// Start a `win_accumulate` in the background.
    pub fn win_accumulate_async(
        &self,
        name: &str,
        dst_weights: Option<Weights>,
    ) -> WindowHandle<()> {
        let windows = Arc::clone(&self.windows);
        let name = name.to_string();
        WindowHandle::spawn(async move {
            windows
                .win_accumulate(&name, dst_weights.as_ref())
                .await
        })
    }

    /// Start a `win_get` in the background. The handle yields the sources
    /// that answered.
    pub fn win_get_async(&self, name: &str, src_weights: Option<Weights>) -> WindowHandle<Vec<Rank>> {
        let windows = Arc::clone(&self.windows);
        let name = name.to_string();
        WindowHandle::spawn(async move { windows.win_get(&name, src_weights.as_ref()).await })
    }

    pub async fn win_fence(&self, name: &str) -> Result<()> {
        self.windows.win_fence(name).await
    }

    /// Hold back neighbor writes into `name` until the returned lock drops.
    pub async fn win_lock(&self, name: &str) -> Result<WindowLock> {
        self.windows.win_lock(name).await
    }

    pub async fn win_sync(
        &self,
        name: &str,
        weights: Option<&Weights>,
        update_weights: Option<&Weights>,
    ) -> Result<TensorBuffer> {
        self.windows.win_sync(name, weights, update_weights).await
    }

    pub async fn win_sync_then_collect(&self, name: &str) -> Result<TensorBuffer> {
        self.windows.win_sync_then_collect(name).await
    }

    /// Slot contents of window `name`, by in-neighbor.
    pub fn win_slots(&self, name: &str) -> Result<BTreeMap<Rank, Vec<f64>>> {
        self.windows.slots(name)
    }

    pub fn win_names(&self) -> Vec<String> {
        self.windows.names()
    }

    // Lifecycle.

    fn stop_tasks(&self) -> Vec<JoinHandle<()>> {
        self.shutdown_tx.send_replace(true);
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Announce departure to every peer, stop background tasks and close the
    /// transport. In-flight rounds fail with `Cancelled`.
    pub async fn shutdown(&self) -> Result<()> {
        heartbeat::announce_leave(self.ctx.transport.as_ref()).await?;
        for task in self.stop_tasks() {
            if let Err(e) = task.await
                && e.is_panic()
            {
                tracing::error!(rank = self.rank(), error = %e, "background task panicked");
            }
        }
        self.ctx.transport.close().await
    }
}

impl Drop for DiffuseClient {
    fn drop(&mut self) {
        for task in self.stop_tasks() {
            task.abort();
        }
    }
}
