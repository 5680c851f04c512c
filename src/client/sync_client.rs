use super::DiffuseClient;
use crate::buffer::TensorBuffer;
use crate::config::DiffuseConfig;
use crate::consensus::RoundReport;
use crate::error::{DiffuseError, Result};
use crate::transport::{LocalTransport, Transport};
use crate::types::Rank;
use std::sync::Arc;

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| DiffuseError::transport_with_source("tokio runtime", e))
}

/// Blocking wrapper around [`DiffuseClient`].
///
/// Owns a tokio runtime and calls `block_on()` for each operation. Each
/// client's background tasks run on its own runtime.
pub struct SyncClient {
    // Dropped before the runtime that drives its tasks.
    inner: DiffuseClient,
    rt: tokio::runtime::Runtime,
}

impl SyncClient {
    /// Bring up `world_size` ranks in this process over an in-memory fabric.
    pub fn bootstrap_local(world_size: u32, config: DiffuseConfig) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(DiffuseError::config("world_size must be >= 1"));
        }
        let (_fabric, transports) = LocalTransport::mesh(world_size);
        transports
            .into_iter()
            .map(|t| {
                let rt = runtime()?;
                let inner = rt.block_on(async {
                    DiffuseClient::new(Arc::new(t) as Arc<dyn Transport>, config.clone())
                })?;
                Ok(Self { inner, rt })
            })
            .collect()
    }

    /// Create a client on `transport` with a fresh runtime.
    pub fn new(transport: Arc<dyn Transport>, config: DiffuseConfig) -> Result<Self> {
        let rt = runtime()?;
        let inner = rt.block_on(async { DiffuseClient::new(transport, config) })?;
        Ok(Self { inner, rt })
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    /// The wrapped async client.
    pub fn inner(&self) -> &DiffuseClient {
        &self.inner
    }

    pub fn register(&self, buffer: TensorBuffer) {
        self.rt.block_on(self.inner.register(buffer))
    }

    pub fn buffer(&self, name: &str) -> Result<TensorBuffer> {
        self.rt.block_on(self.inner.buffer(name))
    }

    pub fn neighbor_allreduce(&self, name: &str) -> Result<RoundReport> {
        self.rt.block_on(self.inner.neighbor_allreduce(name))
    }

    pub fn broadcast(&self, name: &str, root: Rank) -> Result<TensorBuffer> {
        self.rt.block_on(self.inner.broadcast(name, root))
    }

    pub fn allreduce(&self, name: &str, average: bool) -> Result<TensorBuffer> {
        self.rt.block_on(self.inner.allreduce(name, average))
    }

    pub fn barrier(&self) -> Result<()> {
        self.rt.block_on(self.inner.barrier())
    }

    pub fn shutdown(&self) -> Result<()> {
        self.rt.block_on(self.inner.shutdown())
    }
}
