use crate::types::Rank;

pub type Result<T> = std::result::Result<T, DiffuseError>;

#[derive(Debug, thiserror::Error)]
pub enum DiffuseError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rank {rank} not found in group of {world_size}")]
    UnknownRank { rank: Rank, world_size: u32 },

    #[error("peer {rank} disconnected unexpectedly")]
    PeerDisconnected { rank: Rank },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("buffer '{name}' is not registered")]
    UnknownBuffer { name: String },

    #[error("buffer '{name}' mismatch: {reason}")]
    BufferMismatch { name: String, reason: String },

    #[error("broadcast of '{name}' from root {root} incomplete (missing ranks: {missing:?})")]
    IncompleteBroadcast {
        name: String,
        root: Rank,
        missing: Vec<Rank>,
    },

    #[error("topology disconnected at generation {generation}: every surviving rank is isolated")]
    TopologyDisconnected {
        generation: u64,
        quarantined: Vec<Rank>,
    },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("barrier timed out after {timeout_ms}ms (epoch {epoch})")]
    BarrierTimeout { epoch: u64, timeout_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiffuseError {
    /// Create a `Config` error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error is a communication failure that the fault monitor
    /// absorbs instead of surfacing to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::PeerDisconnected { .. } | Self::DecodeFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_display() {
        let e = DiffuseError::config("edge 0->9 references unknown rank");
        assert_eq!(
            e.to_string(),
            "invalid configuration: edge 0->9 references unknown rank"
        );
    }

    #[test]
    fn test_incomplete_broadcast_display() {
        let e = DiffuseError::IncompleteBroadcast {
            name: "fc.weight".into(),
            root: 0,
            missing: vec![2, 3],
        };
        assert_eq!(
            e.to_string(),
            "broadcast of 'fc.weight' from root 0 incomplete (missing ranks: [2, 3])"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(DiffuseError::transport("reset").is_transient());
        assert!(DiffuseError::PeerDisconnected { rank: 1 }.is_transient());
        assert!(!DiffuseError::config("bad").is_transient());
        assert!(
            !DiffuseError::TopologyDisconnected {
                generation: 3,
                quarantined: vec![0, 1],
            }
            .is_transient()
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy");
        let err: DiffuseError = io_err.into();
        assert!(err.to_string().contains("port busy"));
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<DiffuseError> = vec![
            DiffuseError::config("x"),
            DiffuseError::InvalidArgument("weights".into()),
            DiffuseError::UnknownRank {
                rank: 5,
                world_size: 4,
            },
            DiffuseError::PeerDisconnected { rank: 1 },
            DiffuseError::transport("conn reset"),
            DiffuseError::DecodeFailed("bad".into()),
            DiffuseError::EncodeFailed("bad".into()),
            DiffuseError::UnknownBuffer { name: "w".into() },
            DiffuseError::BufferMismatch {
                name: "w".into(),
                reason: "dtype".into(),
            },
            DiffuseError::IncompleteBroadcast {
                name: "w".into(),
                root: 0,
                missing: vec![1],
            },
            DiffuseError::TopologyDisconnected {
                generation: 1,
                quarantined: vec![],
            },
            DiffuseError::CollectiveFailed {
                operation: "allreduce",
                rank: 2,
                reason: "timeout".into(),
            },
            DiffuseError::BarrierTimeout {
                epoch: 0,
                timeout_ms: 100,
            },
            DiffuseError::Cancelled,
            DiffuseError::Tls("bad cert".into()),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
