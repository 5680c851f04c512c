use crate::error::{DiffuseError, Result};
use crate::types::{Rank, Tag};

/// Stream type tag: first byte on every QUIC uni stream.
pub(crate) const STREAM_TAG_HELLO: u8 = 0x01;
pub(crate) const STREAM_TAG_DATA: u8 = 0x02;

/// Send side of a QUIC connection to one peer.
///
/// Every message travels on its own unidirectional stream:
/// `[STREAM_TAG_DATA][tag: u64 LE][len: u64 LE][payload]`. The receiving
/// router reads streams in the order they were opened.
pub struct PeerConnection {
    pub rank: Rank,
    pub(crate) conn: quinn::Connection,
}

impl PeerConnection {
    pub fn new(rank: Rank, conn: quinn::Connection) -> Self {
        Self { rank, conn }
    }

    /// Announce our rank on a fresh connection.
    pub(crate) async fn send_hello(&self, my_rank: Rank, world_size: u32) -> Result<()> {
        let mut stream = self.open().await?;
        let mut buf = Vec::with_capacity(9);
        buf.push(STREAM_TAG_HELLO);
        buf.extend_from_slice(&my_rank.to_le_bytes());
        buf.extend_from_slice(&world_size.to_le_bytes());
        stream
            .write_all(&buf)
            .await
            .map_err(|e| DiffuseError::transport_with_source("write hello", e))?;
        stream
            .finish()
            .map_err(|e| DiffuseError::transport_with_source("finish hello", e))?;
        Ok(())
    }

    /// Send `data` on `tag`.
    pub async fn send_tagged(&self, tag: Tag, data: &[u8]) -> Result<()> {
        let mut stream = self.open().await?;
        let mut prefix = [0u8; 17];
        prefix[0] = STREAM_TAG_DATA;
        prefix[1..9].copy_from_slice(&tag.to_le_bytes());
        prefix[9..17].copy_from_slice(&(data.len() as u64).to_le_bytes());
        stream
            .write_all(&prefix)
            .await
            .map_err(|e| self.lost("write frame prefix", e))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| self.lost("write payload", e))?;
        stream
            .finish()
            .map_err(|e| DiffuseError::transport_with_source("finish stream", e))?;
        Ok(())
    }

    async fn open(&self) -> Result<quinn::SendStream> {
        self.conn.open_uni().await.map_err(|e| match e {
            quinn::ConnectionError::LocallyClosed => {
                DiffuseError::transport(format!("connection to rank {} closed locally", self.rank))
            }
            other => {
                tracing::debug!(peer_rank = self.rank, error = %other, "open uni stream failed");
                DiffuseError::PeerDisconnected { rank: self.rank }
            }
        })
    }

    fn lost(&self, what: &str, e: quinn::WriteError) -> DiffuseError {
        tracing::debug!(peer_rank = self.rank, error = %e, "{what} failed");
        DiffuseError::PeerDisconnected { rank: self.rank }
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.conn.remote_address()
    }
}
