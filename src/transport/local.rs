use super::mailbox::TagMailbox;
use super::{Envelope, Transport};
use crate::error::{DiffuseError, Result};
use crate::types::{Rank, Tag};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FaultPlan {
    /// Ranks that neither send nor receive.
    dead: HashSet<Rank>,
    /// Directed links whose messages are silently lost.
    dropped: HashSet<(Rank, Rank)>,
    /// Ranks whose outgoing messages are all silently lost.
    muted: HashSet<Rank>,
    /// Extra latency per directed link.
    delays: HashMap<(Rank, Rank), Duration>,
}

/// In-process network connecting the ranks of one test or simulation.
///
/// Supports fault injection: killing ranks, dropping or delaying links.
pub struct LocalFabric {
    world_size: u32,
    mailboxes: Vec<Arc<TagMailbox>>,
    faults: Mutex<FaultPlan>,
}

enum Route {
    Deliver,
    Delay(Duration),
    Lose,
}

impl LocalFabric {
    pub fn new(world_size: u32) -> Arc<Self> {
        Arc::new(Self {
            world_size,
            mailboxes: (0..world_size).map(|r| Arc::new(TagMailbox::new(r))).collect(),
            faults: Mutex::new(FaultPlan::default()),
        })
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Endpoint of `rank` on this fabric.
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> Result<LocalTransport> {
        if rank >= self.world_size {
            return Err(DiffuseError::UnknownRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(LocalTransport {
            rank,
            fabric: Arc::clone(self),
        })
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take `rank` down: its sends fail and messages to it are refused.
    pub fn kill(&self, rank: Rank) {
        tracing::debug!(rank, "fabric: rank killed");
        self.plan().dead.insert(rank);
    }

    /// Bring a killed rank back.
    pub fn revive(&self, rank: Rank) {
        self.plan().dead.remove(&rank);
    }

    /// Silently lose every message from `src` to `dst`.
    pub fn drop_link(&self, src: Rank, dst: Rank) {
        self.plan().dropped.insert((src, dst));
    }

    pub fn restore_link(&self, src: Rank, dst: Rank) {
        self.plan().dropped.remove(&(src, dst));
    }

    /// Silently lose every message sent by `rank`.
    pub fn mute(&self, rank: Rank) {
        self.plan().muted.insert(rank);
    }

    pub fn unmute(&self, rank: Rank) {
        self.plan().muted.remove(&rank);
    }

    /// Deliver messages from `src` to `dst` only after `delay`.
    pub fn delay_link(&self, src: Rank, dst: Rank, delay: Duration) {
        self.plan().delays.insert((src, dst), delay);
    }

    /// Remove every injected fault.
    pub fn heal(&self) {
        *self.plan() = FaultPlan::default();
    }

    fn route(&self, src: Rank, dst: Rank) -> Result<Route> {
        let plan = self.plan();
        if plan.dead.contains(&src) {
            return Err(DiffuseError::transport(format!("rank {src} is down")));
        }
        if plan.dead.contains(&dst) {
            return Err(DiffuseError::PeerDisconnected { rank: dst });
        }
        if plan.muted.contains(&src) || plan.dropped.contains(&(src, dst)) {
            return Ok(Route::Lose);
        }
        Ok(match plan.delays.get(&(src, dst)) {
            Some(&d) => Route::Delay(d),
            None => Route::Deliver,
        })
    }

    fn deliver(&self, src: Rank, dst: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        let mailbox = &self.mailboxes[dst as usize];
        let envelope = Envelope {
            src,
            tag,
            payload: payload.to_vec(),
        };
        match self.route(src, dst)? {
            Route::Deliver => mailbox.deliver(envelope),
            Route::Lose => tracing::trace!(src, dst, tag, "fabric: message dropped"),
            Route::Delay(delay) => {
                let mailbox = Arc::clone(mailbox);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    mailbox.deliver(envelope);
                });
            }
        }
        Ok(())
    }
}

/// One rank's endpoint on a [`LocalFabric`].
#[derive(Clone)]
pub struct LocalTransport {
    rank: Rank,
    fabric: Arc<LocalFabric>,
}

impl LocalTransport {
    /// A fabric of `world_size` ranks and one endpoint per rank.
    pub fn mesh(world_size: u32) -> (Arc<LocalFabric>, Vec<LocalTransport>) {
        let fabric = LocalFabric::new(world_size);
        let endpoints = (0..world_size)
            .map(|rank| LocalTransport {
                rank,
                fabric: Arc::clone(&fabric),
            })
            .collect();
        (fabric, endpoints)
    }

    pub fn fabric(&self) -> &Arc<LocalFabric> {
        &self.fabric
    }

    fn mailbox(&self) -> &TagMailbox {
        &self.fabric.mailboxes[self.rank as usize]
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.fabric.world_size
    }

    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if dest >= self.fabric.world_size {
                return Err(DiffuseError::UnknownRank {
                    rank: dest,
                    world_size: self.fabric.world_size,
                });
            }
            if self.mailbox().is_closed() {
                return Err(DiffuseError::transport(format!(
                    "rank {} transport closed",
                    self.rank
                )));
            }
            self.fabric.deliver(self.rank, dest, tag, payload)
        })
    }

    fn recv(&self, tag: Tag) -> BoxFuture<'_, Result<Envelope>> {
        Box::pin(self.mailbox().recv(tag))
    }

    fn try_recv(&self, tag: Tag) -> Result<Option<Envelope>> {
        self.mailbox().try_recv(tag)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.mailbox().close();
            Ok(())
        })
    }
}
