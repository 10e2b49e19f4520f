use crate::Real;
use std::collections::TryReserveError;
use thiserror::Error;

/// Errors reported by balancer construction, updates and queries.
#[derive(Error, Debug)]
pub enum BalanceError {
    /// The rebalance threshold must be a non-negative number.
    #[error("imbalance epsilon must be >= 0, got {0}")]
    InvalidEpsilon(Real),

    /// The partition cutoff exceeds what the chosen partitioning supports.
    #[error("partition cutoff {cutoff} exceeds the maximum of {max}")]
    InvalidCutoff {
        /// Requested cutoff
        cutoff: usize,
        /// Largest accepted cutoff
        max: usize,
    },

    /// The three coordinate arrays of a point set differ in length.
    #[error("coordinate arrays differ in length: x={x}, y={y}, z={z}")]
    MismatchedAxes {
        /// Length of the x array
        x: usize,
        /// Length of the y array
        y: usize,
        /// Length of the z array
        z: usize,
    },

    /// An interleaved coordinate buffer is not a multiple of three long.
    #[error("interleaved coordinate buffer of length {0} is not a multiple of 3")]
    InterleavedLength(usize),

    /// A rank output buffer cannot hold every task.
    #[error("rank buffer of length {len} is smaller than the task count {needed}")]
    BufferTooSmall {
        /// Required length (the task count)
        needed: usize,
        /// Supplied length
        len: usize,
    },

    /// Allocation of partition storage failed.
    #[error("failed to allocate partition storage: {0}")]
    Allocation(#[from] TryReserveError),
}
