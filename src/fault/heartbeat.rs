use super::monitor::FaultMonitor;
use super::record::FaultReason;
use crate::error::Result;
use crate::protocol::{Lane, WireMessage, decode_message, encode_message};
use crate::transport::{Transport, tag_for};
use crate::types::{Rank, Tag};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tag carrying heartbeats and leave announcements.
pub(crate) fn health_tag() -> Tag {
    tag_for(Lane::Health, "")
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Consume the health lane: heartbeats count as successful contact, leave
/// announcements quarantine the sender.
pub(crate) fn spawn_health_listener(
    transport: Arc<dyn Transport>,
    monitor: Arc<FaultMonitor>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tag = health_tag();
        loop {
            let env = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                res = transport.recv(tag) => match res {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::debug!(rank = transport.rank(), error = %e, "health listener stopped");
                        return;
                    }
                },
            };
            match decode_message(&env.payload) {
                Ok((_, WireMessage::Heartbeat { .. })) => monitor.report_success(env.src),
                Ok((_, WireMessage::Leave { rank })) if rank == env.src => {
                    monitor.report_leave(rank)
                }
                Ok((_, other)) => {
                    tracing::warn!(src = env.src, kind = other.kind(), "unexpected message on health lane")
                }
                Err(e) => tracing::warn!(src = env.src, error = %e, "undecodable health message"),
            }
        }
    })
}

/// Send a heartbeat to every peer each `interval` and charge a timeout to
/// peers silent for longer than `timeout`.
pub(crate) fn spawn_heartbeat(
    transport: Arc<dyn Transport>,
    monitor: Arc<FaultMonitor>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rank = transport.rank();
        let tag = health_tag();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => return,
                _ = ticker.tick() => {}
            }
            let frame = match encode_message(&WireMessage::Heartbeat { timestamp_ns: now_ns() }, Lane::Health) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(rank, error = %e, "heartbeat encode failed");
                    return;
                }
            };
            let peers: Vec<Rank> = (0..transport.world_size())
                .filter(|&p| p != rank && !monitor.health(p).is_quarantined())
                .collect();
            let sends = peers.iter().map(|&p| transport.send(p, tag, &frame));
            for (&peer, res) in peers.iter().zip(join_all(sends).await) {
                if let Err(e) = res {
                    tracing::warn!(rank, peer_rank = peer, error = %e, "heartbeat send failed");
                    monitor.report_failure(peer, FaultReason::Transport(e.to_string()));
                }
            }
            for peer in monitor.charge_silent(timeout) {
                tracing::warn!(rank, peer_rank = peer, "peer exceeded heartbeat timeout");
            }
        }
    })
}

/// Tell every peer this rank is leaving. Delivery failures are ignored.
pub(crate) async fn announce_leave(transport: &dyn Transport) -> Result<()> {
    let rank = transport.rank();
    let frame = encode_message(&WireMessage::Leave { rank }, Lane::Health)?;
    let tag = health_tag();
    let sends = (0..transport.world_size())
        .filter(|&p| p != rank)
        .map(|p| transport.send(p, tag, &frame));
    for res in join_all(sends).await {
        if let Err(e) = res {
            tracing::debug!(rank, error = %e, "leave announcement not delivered");
        }
    }
    Ok(())
}
