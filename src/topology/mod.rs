//! Logical communication graph: who sends to whom, and with what weight.

mod build;
mod graph;
mod manager;
mod spec;

pub use build::build_topology;
pub use graph::{Neighbors, STOCHASTIC_TOLERANCE, Topology};
pub use manager::{TopologyEvent, TopologyManager};
pub use spec::{Edge, TopologySpec};
