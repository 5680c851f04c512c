use crate::consensus::RoundReport;
use crate::error::{DiffuseError, Result};
use std::future::Future;
use tokio::task::JoinHandle;

/// A consensus round running in the background.
///
/// Dropping the handle abandons the round; the buffer keeps its pre-round
/// value.
pub struct RoundHandle {
    inner: Option<JoinHandle<Result<RoundReport>>>,
}

impl RoundHandle {
    pub(crate) fn spawn(fut: impl Future<Output = Result<RoundReport>> + Send + 'static) -> Self {
        Self {
            inner: Some(tokio::spawn(fut)),
        }
    }

    /// Wait for the round to finish.
    pub async fn wait(mut self) -> Result<RoundReport> {
        let handle = self
            .inner
            .take()
            .ok_or_else(|| DiffuseError::transport("round handle already consumed"))?;
        match handle.await {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Err(DiffuseError::Cancelled),
            Err(e) => Err(DiffuseError::transport_with_source("round task panicked", e)),
        }
    }

    /// Whether the round has finished, without blocking.
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().is_none_or(|h| h.is_finished())
    }
}

impl Drop for RoundHandle {
    fn drop(&mut self) {
        if let Some(handle) = &self.inner {
            handle.abort();
        }
    }
}

/// A one-sided window operation running in the background.
///
/// Unlike a round, dropping the handle does not cancel the operation: writes
/// already started still reach their destinations.
pub struct WindowHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> WindowHandle<T> {
    pub(crate) fn spawn(fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self {
            inner: tokio::spawn(fut),
        }
    }

    /// Whether the operation has completed, without blocking.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait for the operation to complete.
    pub async fn wait(self) -> Result<T> {
        match self.inner.await {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Err(DiffuseError::Cancelled),
            Err(e) => Err(DiffuseError::transport_with_source("window task panicked", e)),
        }
    }
}

/// Several background rounds waited on together.
#[derive(Default)]
pub struct RoundGroup {
    handles: Vec<RoundHandle>,
}

impl RoundGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: RoundHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every round. All rounds are awaited; the first error wins.
    pub async fn wait_all(self) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::with_capacity(self.handles.len());
        let mut first_err = None;
        for handle in self.handles {
            match handle.wait().await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}
