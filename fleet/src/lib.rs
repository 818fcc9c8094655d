//! Bootstrap and barrier-synchronized execution for a fleet of RDMA benchmark nodes.
//!
//! Each machine is a memory node, a compute node, both, or neither,
//! depending on where its id falls in the configured ranges. Compute
//! threads on every machine then move in lockstep through four control
//! barrier phases, discover each other's memory through a root table of
//! remote pointers, run a workload, and report metrics to the leader.
//!
//! The RDMA transport is abstracted by [`remote::Fabric`];
//! [`loopback::LoopbackFabric`] runs every machine inside one process.

pub mod barrier;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod layout;
pub mod loopback;
pub mod machine;
pub mod metrics;
pub mod remote;
pub mod root;
pub mod run;

pub use barrier::{BarrierWait, ControlBarrier, Phase};
pub use bootstrap::{Node, bootstrap};
pub use config::ExperimentConfig;
pub use error::{ConfigError, Error, Result};
pub use layout::{RegionLayout, SharedLayout, ThreadRegions};
pub use loopback::LoopbackFabric;
pub use machine::{GlobalThreadId, MachineInfo, Role};
pub use metrics::{MachineMetrics, Metrics, Results};
pub use remote::{ComputeNode, Fabric, MemoryNode, RemoteAccess, RemotePtr, RemoteRegion};
pub use root::{Published, RootTable};
pub use run::{Driver, MachineReport, WorkerContext, run_machine};
