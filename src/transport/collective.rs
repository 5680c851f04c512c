use super::Transport;
use crate::error::{DiffuseError, Result};
use crate::protocol::{Lane, WireMessage, decode_message, encode_message};
use crate::types::{Rank, Tag};
use futures::future::{join_all, try_join_all};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// What a flat broadcast delivered to one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The root's bytes.
    pub payload: Vec<u8>,
    /// Ranks the root could not send to. Always empty on non-root ranks.
    pub unreached: Vec<Rank>,
}

/// Flat broadcast: the root sends its bytes to every other rank.
///
/// A failed send does not stop the others; the root reports it in
/// `unreached`. Non-root ranks ignore anything on `tag` that does not come
/// from `root` and return `None` when nothing arrives before `deadline`.
pub async fn broadcast<T: Transport + ?Sized>(
    transport: &T,
    tag: Tag,
    root: Rank,
    payload: Vec<u8>,
    deadline: Instant,
) -> Result<Option<Delivery>> {
    let world = transport.world_size();
    if root >= world {
        return Err(DiffuseError::UnknownRank {
            rank: root,
            world_size: world,
        });
    }
    let rank = transport.rank();

    if rank == root {
        let peers: Vec<Rank> = (0..world).filter(|&r| r != root).collect();
        let sends = peers.iter().map(|&r| transport.send(r, tag, &payload));
        let mut unreached = Vec::new();
        for (&peer, res) in peers.iter().zip(join_all(sends).await) {
            if let Err(e) = res {
                tracing::warn!(rank, peer_rank = peer, error = %e, "broadcast: send failed");
                unreached.push(peer);
            }
        }
        return Ok(Some(Delivery { payload, unreached }));
    }

    loop {
        let Ok(env) = tokio::time::timeout_at(deadline, transport.recv(tag)).await else {
            return Ok(None);
        };
        let env = env?;
        if env.src == root {
            return Ok(Some(Delivery {
                payload: env.payload,
                unreached: Vec::new(),
            }));
        }
        tracing::warn!(rank, src = env.src, root, "broadcast: discarding message from non-root");
    }
}

/// Two-phase barrier coordinated by rank 0.
///
/// Every other rank sends `Barrier` to rank 0; once rank 0 has heard from all
/// of them it releases everybody with `BarrierAck`.
/// `epoch` tells consecutive barriers on one tag apart.
pub async fn barrier<T: Transport + ?Sized>(
    transport: &T,
    tag: Tag,
    epoch: u64,
    timeout: Duration,
) -> Result<()> {
    let world = transport.world_size();
    if world <= 1 {
        return Ok(());
    }
    let rank = transport.rank();
    let deadline = Instant::now() + timeout;
    let timed_out = || DiffuseError::BarrierTimeout {
        epoch,
        timeout_ms: timeout.as_millis() as u64,
    };

    if rank == 0 {
        let mut arrived = BTreeSet::new();
        while arrived.len() < (world - 1) as usize {
            let env = tokio::time::timeout_at(deadline, transport.recv(tag))
                .await
                .map_err(|_| timed_out())??;
            match decode_message(&env.payload)?.1 {
                WireMessage::Barrier { epoch: e } if e == epoch => {
                    arrived.insert(env.src);
                }
                other => {
                    tracing::debug!(rank, src = env.src, kind = other.kind(), "barrier: ignoring message");
                }
            }
        }
        let ack = encode_message(&WireMessage::BarrierAck { epoch }, Lane::Barrier)?;
        let sends = (1..world).map(|r| transport.send(r, tag, &ack));
        try_join_all(sends).await?;
        return Ok(());
    }

    let arrival = encode_message(&WireMessage::Barrier { epoch }, Lane::Barrier)?;
    transport.send(0, tag, &arrival).await?;
    loop {
        let env = tokio::time::timeout_at(deadline, transport.recv(tag))
            .await
            .map_err(|_| timed_out())??;
        match decode_message(&env.payload)?.1 {
            WireMessage::BarrierAck { epoch: e } if e == epoch && env.src == 0 => return Ok(()),
            other => {
                tracing::debug!(rank, src = env.src, kind = other.kind(), "barrier: ignoring message");
            }
        }
    }
}
