//! Transport bindings: tagged point-to-point byte delivery between ranks.
//!
//! Everything above this module speaks in `(destination, tag, bytes)`.
//! `LocalTransport` connects ranks of one process through an in-memory fabric
//! with fault injection; `QuicTransport` connects processes over QUIC.

mod collective;
mod local;
pub(crate) mod mailbox;
pub mod quic;
mod tag;

pub use collective::{Delivery, barrier, broadcast};
pub use local::{LocalFabric, LocalTransport};
pub use quic::QuicTransport;
pub use tag::tag_for;

use crate::error::Result;
use crate::types::{Rank, Tag};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

/// An inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub src: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

/// Point-to-point messaging between the ranks of one group.
///
/// Delivery between a pair of ranks on one tag is FIFO for sends issued one
/// after another. Messages can be lost (a dead peer, a dropped link); callers
/// bound every wait with a deadline.
pub trait Transport: Send + Sync + 'static {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Send `payload` to `dest` on `tag`.
    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Wait for the next message on `tag` from any sender.
    fn recv(&self, tag: Tag) -> BoxFuture<'_, Result<Envelope>>;

    /// Take the next message on `tag` if one is already queued.
    fn try_recv(&self, tag: Tag) -> Result<Option<Envelope>>;

    /// Replicate `payload` from `root` to every rank.
    ///
    /// Non-root ranks pass an empty payload and get `None` when the root's
    /// bytes do not arrive before `deadline`.
    fn broadcast(
        &self,
        tag: Tag,
        root: Rank,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(collective::broadcast(self, tag, root, payload, deadline))
    }

    /// Block until every rank has entered barrier `epoch` on `tag`.
    fn barrier(&self, tag: Tag, epoch: u64, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(collective::barrier(self, tag, epoch, timeout))
    }

    /// Stop delivering messages and fail pending receives.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
