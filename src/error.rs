//! Error taxonomy.
//!
//! Running out of file is deliberately not a variant here: it is not an
//! error but a short count, so the read/write paths return `usize` byte
//! counts rather than a `Result`. Allocation metadata exhaustion is not
//! modeled as a distinct variant either: under `std`, allocation failure
//! aborts rather than surfacing as a recoverable `Result`, so it collapses
//! to the allocator's own abort.

use thiserror::Error;

/// Errors surfaced by the inode store. The buffer cache never returns a
/// `Result`: it treats block-device failure as fatal and has no other
/// failure mode.
#[derive(Debug, Error)]
pub enum Error {
    /// The free-map has no sector left to hand out.
    #[error("allocation failure: free-map exhausted")]
    AllocationFailure,

    /// An internal consistency check failed (e.g. a magic mismatch, or
    /// `deny_write_cnt` exceeding `open_cnt`). Fatal by definition.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
