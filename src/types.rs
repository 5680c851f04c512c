/// Rank of a participant in the training group (0-indexed).
pub type Rank = u32;

/// Channel key used to demultiplex messages on a transport.
pub type Tag = u64;

/// Identity of this process within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RankInfo {
    /// Global rank.
    pub rank: Rank,
    /// Number of ranks in the group.
    pub world_size: u32,
    /// Position within the physical node.
    pub local_rank: u32,
    /// Number of ranks sharing the physical node.
    pub local_size: u32,
}

impl RankInfo {
    /// Derive node-local placement assuming ranks are packed `local_size` per node.
    pub fn new(rank: Rank, world_size: u32, local_size: u32) -> Self {
        let local_size = local_size.max(1);
        Self {
            rank,
            world_size,
            local_rank: rank % local_size,
            local_size,
        }
    }

    /// Index of the physical node hosting this rank.
    pub fn node(&self) -> u32 {
        self.rank / self.local_size
    }
}

/// Element types a tensor buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(DataType::F32),
            1 => Some(DataType::F64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
