//! Error types for distributed operations.

use candle_core::DType;
use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// A rank, world-size or collective call was made while the process group
    /// is not initialized (never initialized, or already finalized).
    #[error("process group is not initialized: `{operation}` requires a successful initialize() and must run before finalize()")]
    NotInitialized { operation: &'static str },

    /// The transport session could not be established.
    #[error("failed to initialize process group: {0}")]
    Initialization(String),

    /// A configuration value (environment variable or option) is malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// World size must be at least one.
    #[error("invalid world_size {0}: must be >= 1")]
    InvalidWorldSize(usize),

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensor dtype mismatch for collective operation.
    #[error("tensor dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },

    /// Payload structure differs across ranks (best-effort detection).
    #[error("payload structure differs across ranks (local fingerprint {fingerprint:#018x})")]
    StructureMismatch { fingerprint: u64 },

    /// Tensor device mismatch.
    #[error("tensor device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: String, actual: String },

    /// The transport cannot carry tensors of this dtype.
    #[error("unsupported dtype for collective transport: {0:?}")]
    UnsupportedDType(DType),

    /// Transport failure (peer disconnected, protocol violation, shut down).
    #[error("transport error: {0}")]
    Transport(String),

    /// Communication timeout.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Index outside a partitioned dataset view.
    #[error("index {index} out of range for partition of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Socket or process I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
