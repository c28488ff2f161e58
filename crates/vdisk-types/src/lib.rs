#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of virtual drives an engine instance can hold.
///
/// The persisted catalog header has a fixed slot table of this size, so the
/// bound applies to both backends.
pub const MAX_DRIVES: usize = 64;

/// Default bound on concurrently open handles across all drives.
pub const DEFAULT_HANDLE_CAPACITY: usize = 256;

/// Default backing-capacity ceiling in mebibytes.
pub const DEFAULT_TOTAL_CAPACITY_MB: u64 = 4096;

/// Marker value stamped into synthetic zero-read blocks.
pub const ZERO_STAMP: u64 = 0x7fff_5eed;

/// Byte offset of the stamp within a block (520-byte-sector metadata slot).
pub const ZERO_STAMP_OFFSET: usize = 512;

/// Logical block address: the unit of addressing for all read/write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of bytes in a fixed-size drive identity.
pub const IDENTITY_LEN: usize = 16;

/// Fixed-size opaque drive key.
///
/// Uniquely identifies a drive within an engine for its whole lifetime.
/// Labels shorter than [`IDENTITY_LEN`] are zero-padded, matching the
/// persisted catalog slot width.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DriveIdentity([u8; IDENTITY_LEN]);

impl DriveIdentity {
    #[must_use]
    pub fn new(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identity from a text label.
    ///
    /// Returns `None` if the label is empty or longer than [`IDENTITY_LEN`]
    /// bytes; shorter labels are zero-padded.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        let raw = label.as_bytes();
        if raw.is_empty() || raw.len() > IDENTITY_LEN {
            return None;
        }
        let mut bytes = [0_u8; IDENTITY_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self(bytes))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// True for the all-zero identity, which marks an empty catalog slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for DriveIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printable = self
            .0
            .iter()
            .take_while(|b| **b != 0)
            .all(|b| b.is_ascii_graphic());
        if printable {
            let end = self.0.iter().position(|b| *b == 0).unwrap_or(IDENTITY_LEN);
            match std::str::from_utf8(&self.0[..end]) {
                Ok(s) if !s.is_empty() => return f.write_str(s),
                _ => {}
            }
        }
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Catalog snapshot entry returned by `list_drives`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveSummary {
    pub identity: DriveIdentity,
    /// Bytes per logical block.
    pub block_size: u32,
    /// Highest valid block address, inclusive.
    pub max_lba: u64,
    /// Bytes of unique payload currently persisted for this drive.
    pub data_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_is_zero_padded() {
        let id = DriveIdentity::from_label("disk0").expect("valid label");
        assert_eq!(&id.as_bytes()[..5], b"disk0");
        assert!(id.as_bytes()[5..].iter().all(|b| *b == 0));
        assert_eq!(id.to_string(), "disk0");
    }

    #[test]
    fn oversized_and_empty_labels_rejected() {
        assert!(DriveIdentity::from_label("").is_none());
        assert!(DriveIdentity::from_label("a-rather-long-drive-name").is_none());
    }

    #[test]
    fn empty_identity_marks_free_slot() {
        assert!(DriveIdentity::default().is_empty());
        assert!(!DriveIdentity::from_label("d").expect("label").is_empty());
    }

    #[test]
    fn non_printable_identity_displays_as_hex() {
        let id = DriveIdentity::new([0xff; IDENTITY_LEN]);
        assert_eq!(id.to_string(), "ff".repeat(IDENTITY_LEN));
    }
}
