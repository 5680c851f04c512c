pub mod buffer;
pub mod client;
pub mod config;
pub mod consensus;
mod context;
pub mod error;
pub mod fault;
pub mod protocol;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod types;
pub mod window;

pub use buffer::{BufferRegistry, TensorBuffer, TensorData};
pub use client::{
    DiffuseClient, OptimizerAdapter, RoundGroup, RoundHandle, SyncClient, WindowHandle,
};
pub use config::DiffuseConfig;
pub use consensus::{
    ConsensusAlgorithm, ConsensusEngine, ExactDiffusion, GatherReport, MergeStrategy,
    NeighborAverage, PushSum, RoundReport,
};
pub use context::Context;
pub use error::{DiffuseError, Result};
pub use fault::{FaultMonitor, FaultReason, FaultRecord, RankHealth};
pub use sync::StateSync;
pub use topology::{Topology, TopologyEvent, TopologyManager, TopologySpec};
pub use transport::{Envelope, LocalFabric, LocalTransport, QuicTransport, Transport};
pub use types::{DataType, Rank, RankInfo, Tag};
pub use window::{Weights, WindowLock, WindowRegistry};
