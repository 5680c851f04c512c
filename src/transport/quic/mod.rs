//! QUIC binding: one connection per peer pair, one uni stream per message.

mod connection;
mod listener;
mod router;
pub(crate) mod tls;

pub use connection::PeerConnection;
pub use listener::QuicListener;

use super::mailbox::TagMailbox;
use super::{Envelope, Transport};
use crate::error::{DiffuseError, Result};
use crate::types::{Rank, Tag};
use futures::future::{BoxFuture, try_join_all};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// A rank's QUIC connections to every other rank of the group.
pub struct QuicTransport {
    rank: Rank,
    world_size: u32,
    listener: QuicListener,
    peers: HashMap<Rank, PeerConnection>,
    mailbox: Arc<TagMailbox>,
    routers: Mutex<Vec<JoinHandle<()>>>,
}

impl QuicTransport {
    /// Connect `rank` to the rest of the group.
    ///
    /// `addrs[r]` is the listening address of rank `r`. Each rank dials every
    /// higher rank and accepts one connection from every lower rank; the
    /// dialing side identifies itself with a hello stream.
    pub async fn establish(
        rank: Rank,
        listener: QuicListener,
        addrs: &[SocketAddr],
    ) -> Result<Self> {
        let world_size = addrs.len() as u32;
        if rank >= world_size {
            return Err(DiffuseError::UnknownRank { rank, world_size });
        }

        let dial = async {
            let futs = ((rank + 1)..world_size).map(|peer| {
                let listener = &listener;
                async move {
                    let conn = listener.connect(addrs[peer as usize]).await?;
                    let pc = PeerConnection::new(peer, conn);
                    pc.send_hello(rank, world_size).await?;
                    Ok::<_, DiffuseError>(pc)
                }
            });
            try_join_all(futs).await
        };

        let accept = async {
            let mut accepted = Vec::with_capacity(rank as usize);
            for _ in 0..rank {
                let conn = listener.accept().await?;
                let (peer, peer_world) = router::read_hello(&conn).await?;
                if peer_world != world_size || peer >= rank {
                    return Err(DiffuseError::transport(format!(
                        "unexpected hello from rank {peer} (world {peer_world}) at rank {rank}"
                    )));
                }
                accepted.push(PeerConnection::new(peer, conn));
            }
            Ok::<_, DiffuseError>(accepted)
        };

        let (dialed, accepted) = tokio::try_join!(dial, accept)?;

        let mailbox = Arc::new(TagMailbox::new(rank));
        let mut peers = HashMap::new();
        let mut routers = Vec::new();
        for pc in dialed.into_iter().chain(accepted) {
            routers.push(tokio::spawn(router::route_peer(
                pc.rank,
                pc.conn.clone(),
                Arc::clone(&mailbox),
            )));
            peers.insert(pc.rank, pc);
        }
        if peers.len() != world_size as usize - 1 {
            return Err(DiffuseError::transport(format!(
                "rank {rank} connected to {} of {} peers",
                peers.len(),
                world_size - 1
            )));
        }
        tracing::debug!(rank, world_size, addr = %listener.local_addr(), "quic mesh established");

        Ok(Self {
            rank,
            world_size,
            listener,
            peers,
            mailbox,
            routers: Mutex::new(routers),
        })
    }

    /// Bring up `world_size` ranks on 127.0.0.1, all in this process.
    pub async fn bootstrap_local(world_size: u32) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(DiffuseError::config("world_size must be >= 1"));
        }
        let mut listeners = Vec::with_capacity(world_size as usize);
        for _ in 0..world_size {
            let addr: SocketAddr = "127.0.0.1:0"
                .parse()
                .map_err(|e| DiffuseError::config(format!("loopback address: {e}")))?;
            listeners.push(QuicListener::bind(addr)?);
        }
        let addrs: Vec<SocketAddr> = listeners.iter().map(QuicListener::local_addr).collect();
        let addrs = &addrs;
        let futs = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| Self::establish(rank as Rank, listener, addrs));
        try_join_all(futs).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    fn peer(&self, rank: Rank) -> Result<&PeerConnection> {
        self.peers.get(&rank).ok_or(DiffuseError::UnknownRank {
            rank,
            world_size: self.world_size,
        })
    }
}

impl Transport for QuicTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.mailbox.is_closed() {
                return Err(DiffuseError::transport(format!(
                    "rank {} transport closed",
                    self.rank
                )));
            }
            if dest == self.rank {
                self.mailbox.deliver(Envelope {
                    src: dest,
                    tag,
                    payload: payload.to_vec(),
                });
                return Ok(());
            }
            self.peer(dest)?.send_tagged(tag, payload).await
        })
    }

    fn recv(&self, tag: Tag) -> BoxFuture<'_, Result<Envelope>> {
        Box::pin(self.mailbox.recv(tag))
    }

    fn try_recv(&self, tag: Tag) -> Result<Option<Envelope>> {
        self.mailbox.try_recv(tag)
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.mailbox.close();
            for pc in self.peers.values() {
                pc.conn.close(0u32.into(), b"closed");
            }
            for handle in self
                .routers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
            {
                handle.abort();
            }
            self.listener.endpoint().close(0u32.into(), b"closed");
            Ok(())
        })
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        for handle in self
            .routers
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            handle.abort();
        }
    }
}
