//! Error types for fleet.

use std::time::Duration;

use crate::barrier::Phase;
use crate::remote::RemotePtr;

/// Invalid or inconsistent experiment parameters.
///
/// Always detected at startup, before any connection or barrier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The per-thread operation batch must equal the number of threads in the system.
    #[error("must have batch size equal to system size: cn_ops_per_thread={ops_per_thread}, total_threads={total_threads}")]
    BatchSizeMismatch {
        ops_per_thread: u64,
        total_threads: u64,
    },
    /// Only `ONE_TO_ONE` queue-pair scheduling is supported.
    #[error("only supports ONE_TO_ONE scheduling policy at this time, got {0:?}")]
    UnsupportedPolicy(String),
    /// An id range whose first id is past its last id.
    #[error("empty {role} id range: first={first}, last={last}")]
    EmptyRange {
        role: &'static str,
        first: u64,
        last: u64,
    },
    /// Node ids must fit in the node field of a remote pointer.
    #[error("node id {0} does not fit in a remote pointer")]
    NodeIdTooLarge(u64),
    #[error("cn_threads must be at least 1")]
    NoThreads,
    #[error("capacity must be at least 1")]
    ZeroCapacity,
    /// A derived size (thread count, allocation or pool requirement) does not fit in a `u64`.
    #[error("{0} does not fit in 64 bits")]
    LayoutOverflow(&'static str),
    #[error("memory node pool of {pool_words} words cannot hold the {required} words this experiment needs")]
    PoolTooSmall { pool_words: u64, required: u64 },
}

/// Fleet operation errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Local or remote connection establishment failed. Never retried.
    #[error("failed to connect to memory node {node}: {reason}")]
    Connect { node: u64, reason: String },
    /// A remote operation addressed a memory node this compute node never connected to.
    #[error("memory node {0} is not connected")]
    NotConnected(u64),
    #[error("remote pointer {ptr} is outside the pool of memory node {node}")]
    OutOfBounds { node: u64, ptr: RemotePtr },
    #[error("memory pool on node {node} exhausted: requested {requested} words, {available} available")]
    PoolExhausted {
        node: u64,
        requested: u64,
        available: u64,
    },
    /// Root pointer read before global thread 0 published it.
    #[error("root pointer has not been published")]
    RootUnset,
    /// The configured barrier wait elapsed before every participant arrived.
    #[error("barrier timeout in {phase}: {arrived}/{expected} arrivals after {waited:?}")]
    BarrierTimeout {
        phase: Phase,
        arrived: u64,
        expected: u64,
        waited: Duration,
    },
    /// An arrival landed on a phase that had already released.
    #[error("barrier overrun in {phase}: counter at {observed}, phase released at {released_at}")]
    BarrierOverrun {
        phase: Phase,
        observed: u64,
        released_at: u64,
    },
    #[error("worker thread {0} panicked")]
    WorkerPanicked(u32),
    /// Error raised by an experiment driver.
    #[error("driver error: {0}")]
    Driver(String),
}

/// Result type alias for fleet operations.
pub type Result<T> = std::result::Result<T, Error>;
