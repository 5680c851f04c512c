use super::Envelope;
use crate::error::{DiffuseError, Result};
use crate::types::{Rank, Tag};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>;

struct TagChannel {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: SharedReceiver,
}

impl TagChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

/// Per-tag inbound queues of one rank.
///
/// Channels are created lazily by whichever side touches a tag first, so a
/// message that arrives before anybody waits for it is queued rather than
/// dropped. Delivery order per `(sender, tag)` is preserved.
pub(crate) struct TagMailbox {
    rank: Rank,
    channels: Mutex<HashMap<Tag, TagChannel>>,
    closed_tx: watch::Sender<bool>,
}

impl TagMailbox {
    pub(crate) fn new(rank: Rank) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            rank,
            channels: Mutex::new(HashMap::new()),
            closed_tx,
        }
    }

    fn receiver(&self, tag: Tag) -> Result<SharedReceiver> {
        if self.is_closed() {
            return Err(DiffuseError::transport(format!(
                "rank {} transport closed",
                self.rank
            )));
        }
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(
            &channels.entry(tag).or_insert_with(TagChannel::new).rx,
        ))
    }

    /// Queue an inbound message. Silently discarded once closed.
    pub(crate) fn deliver(&self, envelope: Envelope) {
        if self.is_closed() {
            return;
        }
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels.entry(envelope.tag).or_insert_with(TagChannel::new);
        let _ = channel.tx.send(envelope);
    }

    /// Wait for the next message on `tag`. Fails once the mailbox is closed.
    pub(crate) async fn recv(&self, tag: Tag) -> Result<Envelope> {
        let rx = self.receiver(tag)?;
        let mut closed = self.closed_tx.subscribe();
        let mut rx = rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg.ok_or_else(|| DiffuseError::transport("mailbox channel closed")),
            _ = closed.wait_for(|c| *c) => Err(DiffuseError::transport(format!(
                "rank {} transport closed",
                self.rank
            ))),
        }
    }

    /// Take the next message on `tag` if one is queued.
    ///
    /// Returns `None` also when another task is currently waiting on `tag`.
    pub(crate) fn try_recv(&self, tag: Tag) -> Result<Option<Envelope>> {
        let rx = self.receiver(tag)?;
        let Ok(mut rx) = rx.try_lock() else {
            return Ok(None);
        };
        Ok(rx.try_recv().ok())
    }

    pub(crate) fn close(&self) {
        self.closed_tx.send_replace(true);
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}
