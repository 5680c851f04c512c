use crate::buffer::BufferRegistry;
use crate::config::DiffuseConfig;
use crate::error::Result;
use crate::fault::FaultMonitor;
use crate::topology::TopologyManager;
use crate::transport::Transport;
use crate::types::{Rank, RankInfo};
use std::sync::Arc;
use tokio::sync::watch;

/// Shared handles of one rank: transport, topology, fault monitor, buffers.
///
/// Cheap to clone. The engine, state sync and windows each hold one.
#[derive(Clone)]
pub struct Context {
    pub(crate) info: RankInfo,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) topology: Arc<TopologyManager>,
    pub(crate) monitor: Arc<FaultMonitor>,
    pub(crate) buffers: Arc<BufferRegistry>,
    pub(crate) config: Arc<DiffuseConfig>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Validate `config`, build the initial topology and a fault monitor.
    ///
    /// Waits are cancelled once `shutdown` turns true.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DiffuseConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let rank = transport.rank();
        let world_size = transport.world_size();
        let topology = Arc::new(TopologyManager::new(
            config.topology.clone(),
            world_size,
            config.require_connected,
        )?);
        let monitor = Arc::new(FaultMonitor::new(rank, &config, Arc::clone(&topology)));
        Ok(Self {
            info: RankInfo::new(rank, world_size, config.local_size),
            transport,
            topology,
            monitor,
            buffers: Arc::new(BufferRegistry::new()),
            config: Arc::new(config),
            shutdown,
        })
    }

    pub fn rank(&self) -> Rank {
        self.info.rank
    }

    pub fn world_size(&self) -> u32 {
        self.info.world_size
    }

    pub fn info(&self) -> RankInfo {
        self.info
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn monitor(&self) -> &Arc<FaultMonitor> {
        &self.monitor
    }

    pub fn buffers(&self) -> &Arc<BufferRegistry> {
        &self.buffers
    }

    pub fn config(&self) -> &DiffuseConfig {
        &self.config
    }

    /// Resolves once shutdown is signalled or the signal's sender is gone.
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.shutdown.clone();
        let _ = rx.wait_for(|s| *s).await;
    }
}
