//! Error kinds reported by collective operations.

use thiserror::Error;

/// Failures surfaced by tree collectives and buffer reads.
///
/// Invariant violations (unsorted storage, overlapping leaves) are library
/// bugs and abort via assertions instead of returning a variant.
#[derive(Error, Debug)]
pub enum TreeError {
    /// The 2:1 balance fixed point did not converge. A valid marker
    /// configuration converges in at most `2 * MAX_LEVEL` rounds.
    #[error("2:1 balance failed to converge after {0} rounds")]
    BalanceDiverged(usize),

    /// A typed-buffer read ran past the end of the received byte stream.
    #[error("communication buffer exhausted: requested {requested} bytes, {remaining} remaining")]
    BufferUnderrun {
        /// Bytes requested by the read.
        requested: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// An octant index outside the local (or ghost) range.
    #[error("octant index {0} out of range")]
    InvalidIndex(usize),
}
