use super::connection::{STREAM_TAG_DATA, STREAM_TAG_HELLO};
use crate::error::{DiffuseError, Result};
use crate::transport::Envelope;
use crate::transport::mailbox::TagMailbox;
use crate::types::Rank;
use std::sync::Arc;

/// Maximum message size accepted by the router (4 GiB).
const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Read the hello stream a connecting peer sends first.
///
/// Returns `(peer_rank, peer_world_size)`.
pub(crate) async fn read_hello(conn: &quinn::Connection) -> Result<(Rank, u32)> {
    let mut stream = conn
        .accept_uni()
        .await
        .map_err(|e| DiffuseError::transport_with_source("accept hello stream", e))?;
    let mut buf = [0u8; 9];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| DiffuseError::transport_with_source("read hello", e))?;
    if buf[0] != STREAM_TAG_HELLO {
        return Err(DiffuseError::transport(format!(
            "expected hello stream, got tag 0x{:02x}",
            buf[0]
        )));
    }
    let rank = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let world = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
    Ok((rank, world))
}

/// Receive loop for one peer connection.
///
/// Streams are read one at a time in the order they were accepted, which
/// keeps delivery from this peer FIFO. Ends when the connection closes.
pub(crate) async fn route_peer(peer: Rank, conn: quinn::Connection, mailbox: Arc<TagMailbox>) {
    loop {
        let mut stream = match conn.accept_uni().await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(peer_rank = peer, error = %e, "router: connection ended");
                return;
            }
        };
        match read_frame(&mut stream, peer).await {
            Some(envelope) => mailbox.deliver(envelope),
            None => continue,
        }
    }
}

async fn read_frame(stream: &mut quinn::RecvStream, peer: Rank) -> Option<Envelope> {
    let mut prefix = [0u8; 17];
    if let Err(e) = stream.read_exact(&mut prefix).await {
        tracing::warn!(peer_rank = peer, "router: frame prefix read failed: {e}");
        return None;
    }
    if prefix[0] != STREAM_TAG_DATA {
        tracing::warn!(
            peer_rank = peer,
            "router: unknown stream tag 0x{:02x}, skipping stream",
            prefix[0]
        );
        return None;
    }
    let tag = u64::from_le_bytes(prefix[1..9].try_into().ok()?);
    let len = u64::from_le_bytes(prefix[9..17].try_into().ok()?);
    if len > MAX_MESSAGE_SIZE {
        tracing::warn!(peer_rank = peer, len, "router: message too large, skipping");
        return None;
    }
    let mut payload = vec![0u8; len as usize];
    if let Err(e) = stream.read_exact(&mut payload).await {
        tracing::warn!(peer_rank = peer, "router: payload read failed: {e}");
        return None;
    }
    Some(Envelope {
        src: peer,
        tag,
        payload,
    })
}
