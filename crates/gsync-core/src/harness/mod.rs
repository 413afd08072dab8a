//! In-memory cluster and seeded simulator
//!
//! Used by the integration tests and the `gsync-sim` binary.

mod cluster;
mod simulator;

pub use cluster::{Cluster, ClusterStats};
pub use simulator::{
    base_graph, run_simulator, ServerCounters, SimulatorConfig, SimulatorReport, SimulatorStats,
    Violation,
};
