use crate::types::PROTOCOL_VERSION;

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Traffic class of a framed message.
///
/// The lane is part of the header and, together with a buffer name, selects
/// the transport tag a message is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Lane {
    /// Neighbor contributions of consensus rounds.
    Consensus = 0,
    /// Neighbor allgather exchanges.
    Gather = 1,
    /// Exact state broadcast (data, acks, commit).
    Sync = 2,
    /// One-sided window traffic.
    Window = 3,
    /// Heartbeats and leave announcements.
    Health = 4,
    /// Global allreduce / allgather.
    Collective = 5,
    /// Barrier arrivals and releases.
    Barrier = 6,
}

impl Lane {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Lane::Consensus),
            1 => Some(Lane::Gather),
            2 => Some(Lane::Sync),
            3 => Some(Lane::Window),
            4 => Some(Lane::Health),
            5 => Some(Lane::Collective),
            6 => Some(Lane::Barrier),
            _ => None,
        }
    }
}

/// 8-byte wire header prepended to every framed message.
///
/// ```text
/// [0..4] payload_length: u32 LE
/// [4]    lane: u8
/// [5]    reserved: u8 (must be 0)
/// [6..8] protocol_version: u16 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Length of the payload following this header.
    pub payload_length: u32,
    pub lane: Lane,
    pub version: u16,
}

impl Header {
    pub fn new(payload_length: u32, lane: Lane) -> Self {
        Self {
            payload_length,
            lane,
            version: PROTOCOL_VERSION,
        }
    }

    /// Encode header to 8 bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[4] = self.lane as u8;
        buf[6..8].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    /// Decode header from 8 bytes.
    ///
    /// Returns `None` if the lane byte is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let payload_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let lane = Lane::from_u8(buf[4])?;
        let version = u16::from_le_bytes([buf[6], buf[7]]);
        Some(Header {
            payload_length,
            lane,
            version,
        })
    }
}
