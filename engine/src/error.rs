//! Error types shared by the storage and synchronization engines.
//!
//! Internal invariant violations are deliberately *not* represented here:
//! they are programming errors and abort via `panic!`/`assert!`, matching
//! the storage layer's treatment of out-of-range indices.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All recoverable failures surfaced by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A changeset could not be parsed, or a merge rule encountered an
    /// instruction combination that a well-formed log cannot produce.
    /// Aborts the current sync round; other changesets are unaffected.
    #[error("bad changeset: {0}")]
    BadChangeset(String),

    /// Two sides declared the same schema item with conflicting details.
    /// Not recoverable without operator intervention.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The allocator could not satisfy a request (a single allocation is
    /// bounded by the 24-bit capacity field of the array header). The
    /// current write transaction must be aborted.
    #[error("allocation failure: requested {0} bytes")]
    AllocationFailure(usize),

    /// A header or length invariant did not hold while attaching to
    /// persisted state. Fatal for the affected file.
    #[error("corrupted database: {0}")]
    Corruption(String),

    /// An external party cancelled an in-progress I/O callback. The
    /// current transaction must be aborted.
    #[error("interrupted")]
    Interrupted,

    /// Underlying file I/O failed while opening or committing a group.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `BadChangeset` from anything displayable.
    pub(crate) fn bad_changeset(msg: impl Into<String>) -> Self {
        Error::BadChangeset(msg.into())
    }

    /// Build a `SchemaMismatch` from anything displayable.
    pub(crate) fn schema_mismatch(msg: impl Into<String>) -> Self {
        Error::SchemaMismatch(msg.into())
    }

    /// Build a `Corruption` from anything displayable.
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_detail() {
        let err = Error::bad_changeset("truncated instruction");
        assert_eq!(err.to_string(), "bad changeset: truncated instruction");

        let err = Error::schema_mismatch("'x' is int on one side");
        assert_eq!(err.to_string(), "schema mismatch: 'x' is int on one side");

        let err = Error::AllocationFailure(1 << 30);
        assert!(err.to_string().contains("bytes"));
    }
}
