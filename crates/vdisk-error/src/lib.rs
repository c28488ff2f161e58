#![forbid(unsafe_code)]
//! Error types for vdisk.
//!
//! # Error Taxonomy
//!
//! One user-facing enum, [`VdiskError`], covers every failure the engine can
//! report. Each variant maps to exactly one caller-visible condition:
//!
//! | Variant | Condition |
//! |---------|-----------|
//! | `InvalidHandle` | stale, closed, or never-allocated drive handle |
//! | `NotFound` | identity has no live drive |
//! | `AlreadyOpen` | create/remove contended with an open handle |
//! | `Exhausted` | handle pool (or catalog slot table) is full |
//! | `OutOfRange` | request extends past the drive's `max_lba` |
//! | `InvalidArgument` | zero-length or malformed request |
//! | `BackingStore` | I/O failure or capacity exhaustion on the backing medium |
//!
//! ## Propagation Policy
//!
//! Every boundary and argument check runs before any state mutation; a
//! returned error means the extent lists, catalog, and handle table are
//! exactly as they were. The one exception: a `BackingStore` failure in
//! the middle of persisting an already-validated write means the drive's
//! on-disk integrity is unknown and the caller must treat it as such. The
//! engine never retries on its own.
//!
//! `OutOfRange` carries the requested range and the drive's bound so a test
//! misconfiguration can be diagnosed from the error alone.
//!
//! ## Design Constraints
//!
//! - This crate depends on nothing in the workspace (no cyclic deps); drive
//!   identities appear pre-formatted as `String`.
//! - `std::io::Error` converts into `BackingStore` at the I/O boundary; the
//!   original error text is preserved in `detail`.

use thiserror::Error;

/// Unified error type for all vdisk engine operations.
#[derive(Debug, Error)]
pub enum VdiskError {
    /// The handle does not name a live open session.
    #[error("invalid or stale drive handle")]
    InvalidHandle,

    /// No drive exists with the given identity.
    #[error("no drive with identity {identity}")]
    NotFound { identity: String },

    /// The operation requires the drive to have no open handles.
    #[error("drive {identity} is currently open")]
    AlreadyOpen { identity: String },

    /// A fixed-capacity table (handle pool or drive catalog) is full.
    #[error("capacity exhausted ({kind}, capacity {capacity})")]
    Exhausted {
        kind: &'static str,
        capacity: usize,
    },

    /// The requested block range extends past the drive's last block.
    #[error("request out of range: lba={lba} blocks={blocks} max_lba={max_lba}")]
    OutOfRange { lba: u64, blocks: u64, max_lba: u64 },

    /// A zero-length or otherwise malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The backing medium failed or ran out of capacity.
    #[error("backing store failure: {detail}")]
    BackingStore { detail: String },
}

impl From<std::io::Error> for VdiskError {
    fn from(err: std::io::Error) -> Self {
        Self::BackingStore {
            detail: err.to_string(),
        }
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, VdiskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_is_diagnosable() {
        let err = VdiskError::OutOfRange {
            lba: 990,
            blocks: 16,
            max_lba: 999,
        };
        let text = err.to_string();
        assert!(text.contains("lba=990"));
        assert!(text.contains("blocks=16"));
        assert!(text.contains("max_lba=999"));
    }

    #[test]
    fn io_error_maps_to_backing_store() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = VdiskError::from(io);
        assert!(matches!(err, VdiskError::BackingStore { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }
}
