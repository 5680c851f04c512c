use crate::types::Rank;

/// Messages exchanged between ranks.
///
/// Tensor contents travel as little-endian element bytes inside `payload`
/// fields. Consensus traffic always carries `f64` elements so that merges are
/// computed at full precision whatever the buffer's storage type; exact
/// broadcast carries the buffer's native element bytes so that receivers end
/// up bit-identical to the root.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// One rank's share for a consensus round on `buffer`.
    Contribution {
        buffer: String,
        round: u64,
        generation: u64,
        /// `f64` LE elements.
        payload: Vec<u8>,
        /// Auxiliary scalar (push-sum weight; 0 for other variants).
        weight: f64,
    },

    /// A neighbor allgather value.
    Gather {
        buffer: String,
        round: u64,
        dtype: u8,
        shape: Vec<u64>,
        payload: Vec<u8>,
    },

    /// Phase one of an exact broadcast: the root's state.
    BroadcastData {
        buffer: String,
        epoch: u64,
        dtype: u8,
        shape: Vec<u64>,
        version: u64,
        payload: Vec<u8>,
    },

    /// A receiver's acknowledgement of `BroadcastData`.
    BroadcastAck {
        buffer: String,
        epoch: u64,
        accepted: bool,
    },

    /// Phase two: install (`commit = true`) or discard the staged state.
    BroadcastCommit {
        buffer: String,
        epoch: u64,
        commit: bool,
        /// Ranks that failed to acknowledge, reported when aborting.
        missing: Vec<Rank>,
    },

    /// Global allreduce / allgather contribution.
    Collective {
        buffer: String,
        epoch: u64,
        dtype: u8,
        shape: Vec<u64>,
        payload: Vec<u8>,
    },

    /// Barrier arrival.
    Barrier { epoch: u64 },

    /// Barrier release from the coordinator.
    BarrierAck { epoch: u64 },

    /// Periodic liveness signal.
    Heartbeat { timestamp_ns: u64 },

    /// Orderly departure announcement.
    Leave { rank: Rank },

    /// One-sided write into the sender's slot of window `name` at the receiver.
    WinPut {
        name: String,
        accumulate: bool,
        /// `f64` LE elements, already scaled by the sender.
        payload: Vec<u8>,
    },

    /// Ask the receiver for its current window value.
    WinGetRequest { name: String, request_id: u64 },

    /// Answer to `WinGetRequest`; `None` when the window does not exist.
    WinGetResponse {
        name: String,
        request_id: u64,
        payload: Option<Vec<u8>>,
    },

    /// Fence marker: the sender had issued `writes` writes to the receiver's
    /// window `name` when it entered fence `epoch`.
    WinFence {
        name: String,
        epoch: u64,
        writes: u64,
    },
}

impl WireMessage {
    /// Short variant name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Contribution { .. } => "contribution",
            WireMessage::Gather { .. } => "gather",
            WireMessage::BroadcastData { .. } => "broadcast-data",
            WireMessage::BroadcastAck { .. } => "broadcast-ack",
            WireMessage::BroadcastCommit { .. } => "broadcast-commit",
            WireMessage::Collective { .. } => "collective",
            WireMessage::Barrier { .. } => "barrier",
            WireMessage::BarrierAck { .. } => "barrier-ack",
            WireMessage::Heartbeat { .. } => "heartbeat",
            WireMessage::Leave { .. } => "leave",
            WireMessage::WinPut { .. } => "win-put",
            WireMessage::WinGetRequest { .. } => "win-get-request",
            WireMessage::WinGetResponse { .. } => "win-get-response",
            WireMessage::WinFence { .. } => "win-fence",
        }
    }
}
