use super::DiffuseClient;
use crate::buffer::TensorBuffer;
use crate::consensus::RoundReport;
use crate::error::Result;
use crate::types::Rank;
use std::sync::Arc;

/// Glue between a training loop and the consensus engine.
///
/// The optimizer owns the update rule. Per step it hands the adapted
/// parameters over with [`on_step_begin`](Self::on_step_begin) and pulls the
/// averaged values back with [`consensus_step`](Self::consensus_step).
pub struct OptimizerAdapter {
    client: Arc<DiffuseClient>,
    last_reports: std::sync::Mutex<Vec<RoundReport>>,
}

impl OptimizerAdapter {
    pub fn new(client: Arc<DiffuseClient>) -> Self {
        Self {
            client,
            last_reports: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &Arc<DiffuseClient> {
        &self.client
    }

    /// Publish the values produced by this step's local update.
    pub async fn on_step_begin(&self, buffers: Vec<TensorBuffer>) {
        for buffer in buffers {
            self.client.register(buffer).await;
        }
    }

    /// Run one consensus round on `name` and return the merged value.
    pub async fn consensus_step(&self, name: &str) -> Result<TensorBuffer> {
        let report = self.client.neighbor_allreduce(name).await?;
        let value = self.client.buffer(name).await?;
        let mut reports = self.last_reports.lock().unwrap_or_else(|e| e.into_inner());
        reports.retain(|r| r.buffer != name);
        reports.push(report);
        Ok(value)
    }

    /// Run one round on every name concurrently.
    pub async fn consensus_step_all(&self, names: &[&str]) -> Result<Vec<TensorBuffer>> {
        futures::future::try_join_all(names.iter().map(|n| self.consensus_step(n))).await
    }

    /// Report of the latest round on `name`, if any.
    pub fn last_report(&self, name: &str) -> Option<RoundReport> {
        self.last_reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|r| r.buffer == name)
            .cloned()
    }

    /// Make every rank hold `root`'s checkpointed values.
    ///
    /// Every rank passes the same buffer names; only `root`'s values are
    /// used. Algorithm state carried between rounds is reset.
    pub async fn on_checkpoint_restore(
        &self,
        buffers: Vec<TensorBuffer>,
        root: Rank,
    ) -> Result<Vec<TensorBuffer>> {
        let names: Vec<String> = buffers.iter().map(|b| b.name.clone()).collect();
        if self.client.rank() == root {
            for buffer in buffers {
                self.client.register(buffer).await;
            }
        }
        let mut restored = Vec::with_capacity(names.len());
        for name in &names {
            restored.push(self.client.broadcast(name, root).await?);
            self.client.reset_consensus_state(name).await;
        }
        tracing::info!(rank = self.client.rank(), root, buffers = names.len(), "checkpoint restored");
        Ok(restored)
    }
}
