//! Persisted layout and backing-capacity accounting.
//!
//! # Format Overview
//!
//! ```text
//! Store File:
//! +----------------+
//! | Catalog Header |  (3092 bytes, fixed)
//! +----------------+
//! | Extent Record  |  (variable, append-only)
//! +----------------+
//! | Extent Record  |
//! +----------------+
//! | ...            |
//! +----------------+
//!
//! Catalog Header:
//! +------------------+----------+
//! | magic            |  4 bytes | = 0x5644_4B31 ("VDK1")
//! | version          |  2 bytes | = 1
//! | reserved         |  2 bytes | = 0
//! | drive_count      |  8 bytes |
//! +------------------+----------+
//! | MAX_DRIVES slots, 48 bytes each:
//! |   identity       | 16 bytes |
//! |   block_size     |  8 bytes |
//! |   max_lba        |  8 bytes |
//! |   data_size      |  8 bytes |
//! |   first_extent   |  8 bytes | 0 = empty chain
//! +------------------+----------+
//! | crc32c           |  4 bytes | CRC of everything above
//! +------------------+----------+
//!
//! Extent Record:
//! +------------------+----------+
//! | start_lba        |  8 bytes |
//! | next_location    |  8 bytes | 0 = end of chain
//! | stored_bytes     |  8 bytes | payload length
//! | logical_bytes    |  8 bytes | >= stored_bytes, tiled on read
//! +------------------+----------+
//! | payload          |  N bytes |
//! +------------------+----------+
//! ```
//!
//! Records for one drive form a singly linked chain in ascending LBA order,
//! rooted at the catalog slot's `first_extent`. Overwrites append fresh
//! records and patch `next_location` / `logical_bytes` fields in place;
//! superseded records become dead space and are never reclaimed. The whole
//! header is rewritten (and re-checksummed) on every catalog or data-size
//! change.
//!
//! A zero-length file is a valid "no drives" store. A file shorter than the
//! header, or one whose header fails the magic/version/CRC check, is rejected
//! as a backing-store failure.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vdisk_error::{Result, VdiskError};
use vdisk_types::{DriveIdentity, IDENTITY_LEN, MAX_DRIVES};

/// Store file magic ("VDK1").
pub(crate) const STORE_MAGIC: u32 = 0x5644_4B31;

/// Current store format version.
pub(crate) const STORE_VERSION: u16 = 1;

const HEADER_FIXED: usize = 16;
const SLOT_SIZE: usize = 48;
const HEADER_CRC_OFFSET: usize = HEADER_FIXED + MAX_DRIVES * SLOT_SIZE;

/// Total catalog header size, including the trailing CRC.
pub(crate) const HEADER_SIZE: usize = HEADER_CRC_OFFSET + 4;

/// Extent record header size; the payload follows immediately.
pub(crate) const RECORD_HEADER_SIZE: u64 = 32;

const RECORD_NEXT_OFFSET: u64 = 8;
const RECORD_LOGICAL_OFFSET: u64 = 24;

/// One live drive's persisted catalog entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CatalogSlot {
    pub identity: DriveIdentity,
    pub block_size: u32,
    pub max_lba: u64,
    pub data_size: u64,
    pub first_extent: u64,
}

/// Extent record header as read back from a chain walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoadedExtent {
    pub loc: u64,
    pub start_lba: u64,
    pub stored_bytes: u64,
    pub logical_bytes: u64,
}

/// One drive reconstructed from the store on open.
#[derive(Debug)]
pub(crate) struct LoadedDrive {
    pub identity: DriveIdentity,
    pub block_size: u32,
    pub max_lba: u64,
    pub data_size: u64,
    pub extents: Vec<LoadedExtent>,
}

/// A record image queued for appending.
#[derive(Debug)]
pub(crate) struct RecordImage<'a> {
    pub start_lba: u64,
    pub stored_bytes: u64,
    pub logical_bytes: u64,
    pub payload: &'a [u8],
}

/// Where the first appended record hangs off the existing chain.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChainPred {
    /// The records become the new chain head (catalog slot is patched).
    Head,
    /// The record at this location gets its `next_location` patched.
    Record(u64),
}

/// File-backed store: catalog header mirror plus the append point.
#[derive(Debug)]
pub(crate) struct BackingFile {
    file: File,
    path: PathBuf,
    end: u64,
    capacity_bytes: u64,
    slots: Vec<CatalogSlot>,
}

impl BackingFile {
    /// Open (or create) the store file and rebuild every drive's extent
    /// chain. `fresh` discards any existing contents first (temporary
    /// lifecycle mode).
    pub fn open(
        path: impl AsRef<Path>,
        capacity_bytes: u64,
        fresh: bool,
    ) -> Result<(Self, Vec<LoadedDrive>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(fresh)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mut store = Self {
            file,
            path,
            end: HEADER_SIZE as u64,
            capacity_bytes,
            slots: Vec::new(),
        };

        if fresh || len == 0 {
            store.write_header()?;
            return Ok((store, Vec::new()));
        }
        if len < HEADER_SIZE as u64 {
            return Err(VdiskError::BackingStore {
                detail: format!("store header truncated: {len} bytes, need {HEADER_SIZE}"),
            });
        }

        store.read_header()?;
        store.end = len;
        let drives = store.load_chains(len)?;
        debug!(drives = drives.len(), "store file loaded");
        Ok((store, drives))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read `len` payload bytes starting `offset` bytes into a record's payload.
    pub fn read_payload(&self, loc: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| VdiskError::BackingStore {
            detail: "payload length does not fit usize".to_owned(),
        })?;
        let at = loc
            .checked_add(RECORD_HEADER_SIZE)
            .and_then(|v| v.checked_add(offset))
            .ok_or_else(|| VdiskError::BackingStore {
                detail: "payload offset overflow".to_owned(),
            })?;
        let mut buf = vec![0_u8; len];
        self.file.read_exact_at(&mut buf, at)?;
        Ok(buf)
    }

    /// Create a catalog slot, or reset an existing one to empty geometry.
    pub fn upsert_slot(&mut self, identity: DriveIdentity, block_size: u32, max_lba: u64) -> Result<()> {
        match self.slots.iter_mut().find(|s| s.identity == identity) {
            Some(slot) => {
                slot.block_size = block_size;
                slot.max_lba = max_lba;
                slot.data_size = 0;
                slot.first_extent = 0;
            }
            None => {
                if self.slots.len() >= MAX_DRIVES {
                    return Err(VdiskError::Exhausted {
                        kind: "drive catalog",
                        capacity: MAX_DRIVES,
                    });
                }
                self.slots.push(CatalogSlot {
                    identity,
                    block_size,
                    max_lba,
                    data_size: 0,
                    first_extent: 0,
                });
            }
        }
        self.write_header()
    }

    /// Drop a drive's catalog slot. Its records become dead space.
    pub fn remove_slot(&mut self, identity: DriveIdentity) -> Result<()> {
        self.slots.retain(|s| s.identity != identity);
        self.write_header()
    }

    /// Append records for one write, patch chain linkage, and rewrite the
    /// catalog header. Returns the location of each appended record.
    ///
    /// The capacity check runs before the first byte is written, so an
    /// exhausted store rejects the whole write with nothing mutated.
    pub fn commit_write(
        &mut self,
        identity: DriveIdentity,
        records: &[RecordImage<'_>],
        pred: ChainPred,
        tail_next: u64,
        shrink: Option<(u64, u64)>,
        new_data_size: u64,
    ) -> Result<Vec<u64>> {
        debug_assert!(!records.is_empty());

        let mut total = 0_u64;
        for record in records {
            let size = RECORD_HEADER_SIZE
                .checked_add(record.payload.len() as u64)
                .ok_or_else(|| VdiskError::BackingStore {
                    detail: "record size overflow".to_owned(),
                })?;
            total = total
                .checked_add(size)
                .ok_or_else(|| VdiskError::BackingStore {
                    detail: "write size overflow".to_owned(),
                })?;
        }
        let new_end = self
            .end
            .checked_add(total)
            .ok_or_else(|| VdiskError::BackingStore {
                detail: "store size overflow".to_owned(),
            })?;
        if new_end > self.capacity_bytes {
            warn!(
                needed = new_end,
                capacity = self.capacity_bytes,
                "write exceeds backing capacity"
            );
            return Err(VdiskError::BackingStore {
                detail: format!(
                    "write needs {new_end} bytes but backing capacity is {} bytes",
                    self.capacity_bytes
                ),
            });
        }

        let mut locs = Vec::with_capacity(records.len());
        let mut at = self.end;
        for record in records {
            locs.push(at);
            at += RECORD_HEADER_SIZE + record.payload.len() as u64;
        }

        for (i, record) in records.iter().enumerate() {
            let next = locs.get(i + 1).copied().unwrap_or(tail_next);
            let mut buf =
                Vec::with_capacity(RECORD_HEADER_SIZE as usize + record.payload.len());
            buf.extend_from_slice(&record.start_lba.to_le_bytes());
            buf.extend_from_slice(&next.to_le_bytes());
            buf.extend_from_slice(&record.stored_bytes.to_le_bytes());
            buf.extend_from_slice(&record.logical_bytes.to_le_bytes());
            buf.extend_from_slice(record.payload);
            self.file.write_all_at(&buf, locs[i])?;
        }
        self.end = new_end;

        if let ChainPred::Record(loc) = pred {
            self.patch_u64(loc + RECORD_NEXT_OFFSET, locs[0])?;
        }
        if let Some((loc, logical_bytes)) = shrink {
            self.patch_u64(loc + RECORD_LOGICAL_OFFSET, logical_bytes)?;
        }

        let slot = self.slot_mut(identity)?;
        slot.data_size = new_data_size;
        if matches!(pred, ChainPred::Head) {
            slot.first_extent = locs[0];
        }
        self.write_header()?;
        Ok(locs)
    }

    fn slot_mut(&mut self, identity: DriveIdentity) -> Result<&mut CatalogSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.identity == identity)
            .ok_or_else(|| VdiskError::BackingStore {
                detail: format!("no catalog slot for drive {identity}"),
            })
    }

    fn patch_u64(&self, loc: u64, value: u64) -> Result<()> {
        self.file.write_all_at(&value.to_le_bytes(), loc)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buf = vec![0_u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&STORE_VERSION.to_le_bytes());
        // bytes 6..8 reserved
        buf[8..16].copy_from_slice(&(self.slots.len() as u64).to_le_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let at = HEADER_FIXED + i * SLOT_SIZE;
            buf[at..at + IDENTITY_LEN].copy_from_slice(slot.identity.as_bytes());
            buf[at + 16..at + 24].copy_from_slice(&u64::from(slot.block_size).to_le_bytes());
            buf[at + 24..at + 32].copy_from_slice(&slot.max_lba.to_le_bytes());
            buf[at + 32..at + 40].copy_from_slice(&slot.data_size.to_le_bytes());
            buf[at + 40..at + 48].copy_from_slice(&slot.first_extent.to_le_bytes());
        }
        let crc = crc32c::crc32c(&buf[..HEADER_CRC_OFFSET]);
        buf[HEADER_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        self.file.write_all_at(&buf, 0)?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let mut buf = vec![0_u8; HEADER_SIZE];
        self.file.read_exact_at(&mut buf, 0)?;

        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != STORE_MAGIC {
            return Err(VdiskError::BackingStore {
                detail: format!("store magic mismatch: expected {STORE_MAGIC:#010x}, got {magic:#010x}"),
            });
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != STORE_VERSION {
            return Err(VdiskError::BackingStore {
                detail: format!("unsupported store version: {version}"),
            });
        }
        let stored_crc = u32::from_le_bytes([
            buf[HEADER_CRC_OFFSET],
            buf[HEADER_CRC_OFFSET + 1],
            buf[HEADER_CRC_OFFSET + 2],
            buf[HEADER_CRC_OFFSET + 3],
        ]);
        let computed_crc = crc32c::crc32c(&buf[..HEADER_CRC_OFFSET]);
        if stored_crc != computed_crc {
            return Err(VdiskError::BackingStore {
                detail: format!(
                    "store header CRC mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
                ),
            });
        }

        let drive_count = read_le_u64(&buf, 8);
        if drive_count > MAX_DRIVES as u64 {
            return Err(VdiskError::BackingStore {
                detail: format!("store drive count {drive_count} exceeds {MAX_DRIVES}"),
            });
        }
        self.slots.clear();
        for i in 0..drive_count as usize {
            let at = HEADER_FIXED + i * SLOT_SIZE;
            let mut identity = [0_u8; IDENTITY_LEN];
            identity.copy_from_slice(&buf[at..at + IDENTITY_LEN]);
            let block_size_raw = read_le_u64(&buf, at + 16);
            let block_size =
                u32::try_from(block_size_raw).map_err(|_| VdiskError::BackingStore {
                    detail: format!("catalog slot {i} block_size {block_size_raw} exceeds u32"),
                })?;
            self.slots.push(CatalogSlot {
                identity: DriveIdentity::new(identity),
                block_size,
                max_lba: read_le_u64(&buf, at + 24),
                data_size: read_le_u64(&buf, at + 32),
                first_extent: read_le_u64(&buf, at + 40),
            });
        }
        Ok(())
    }

    fn load_chains(&self, file_len: u64) -> Result<Vec<LoadedDrive>> {
        let mut drives = Vec::with_capacity(self.slots.len());
        // Any valid chain has fewer records than this; a corrupt cycle does not.
        let record_bound = file_len / RECORD_HEADER_SIZE + 1;
        for slot in &self.slots {
            let mut extents = Vec::new();
            let mut loc = slot.first_extent;
            let mut walked = 0_u64;
            while loc != 0 {
                walked += 1;
                if walked > record_bound {
                    return Err(VdiskError::BackingStore {
                        detail: format!("extent chain cycle for drive {}", slot.identity),
                    });
                }
                let header_end = loc.checked_add(RECORD_HEADER_SIZE);
                if loc < HEADER_SIZE as u64 || header_end.map_or(true, |e| e > file_len) {
                    return Err(VdiskError::BackingStore {
                        detail: format!(
                            "extent record location {loc} out of bounds for drive {}",
                            slot.identity
                        ),
                    });
                }
                let mut header = [0_u8; RECORD_HEADER_SIZE as usize];
                self.file.read_exact_at(&mut header, loc)?;
                let start_lba = read_le_u64(&header, 0);
                let next = read_le_u64(&header, 8);
                let stored_bytes = read_le_u64(&header, 16);
                let logical_bytes = read_le_u64(&header, 24);
                let payload_end = (loc + RECORD_HEADER_SIZE).checked_add(stored_bytes);
                if payload_end.map_or(true, |e| e > file_len) {
                    return Err(VdiskError::BackingStore {
                        detail: format!(
                            "extent payload at {loc} runs past end of store for drive {}",
                            slot.identity
                        ),
                    });
                }
                extents.push(LoadedExtent {
                    loc,
                    start_lba,
                    stored_bytes,
                    logical_bytes,
                });
                loc = next;
            }
            drives.push(LoadedDrive {
                identity: slot.identity,
                block_size: slot.block_size,
                max_lba: slot.max_lba,
                data_size: slot.data_size,
                extents,
            });
        }
        Ok(drives)
    }
}

fn read_le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Live-payload accounting for the memory backend.
///
/// The file backend bounds the file size (dead space included, as the
/// original store did); the memory backend bounds live payload bytes.
#[derive(Debug)]
pub(crate) struct MemoryLedger {
    used: u64,
    capacity_bytes: u64,
}

impl MemoryLedger {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            used: 0,
            capacity_bytes,
        }
    }

    /// Account one write: `freed` bytes released, `added` bytes retained.
    /// Fails (mutating nothing) if the result would exceed capacity.
    pub fn charge(&mut self, added: u64, freed: u64) -> Result<()> {
        let next = self
            .used
            .saturating_sub(freed)
            .checked_add(added)
            .ok_or_else(|| VdiskError::BackingStore {
                detail: "memory usage overflow".to_owned(),
            })?;
        if next > self.capacity_bytes {
            warn!(
                needed = next,
                capacity = self.capacity_bytes,
                "write exceeds backing capacity"
            );
            return Err(VdiskError::BackingStore {
                detail: format!(
                    "write needs {next} bytes but backing capacity is {} bytes",
                    self.capacity_bytes
                ),
            });
        }
        self.used = next;
        Ok(())
    }

    /// Release bytes without a paired charge (drive remove / reset).
    pub fn release(&mut self, freed: u64) {
        self.used = self.used.saturating_sub(freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const CAP: u64 = 1024 * 1024;

    fn identity(label: &str) -> DriveIdentity {
        DriveIdentity::from_label(label).expect("label")
    }

    #[test]
    fn empty_file_is_a_valid_store() {
        let tmp = NamedTempFile::new().expect("temp file");
        std::fs::remove_file(tmp.path()).ok();
        let (store, drives) = BackingFile::open(tmp.path(), CAP, false).expect("open");
        assert!(drives.is_empty());
        assert_eq!(store.end, HEADER_SIZE as u64);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let tmp = NamedTempFile::new().expect("temp file");
        std::fs::write(tmp.path(), b"short").expect("write");
        let err = BackingFile::open(tmp.path(), CAP, false).expect_err("torn header");
        assert!(matches!(err, VdiskError::BackingStore { .. }));
    }

    #[test]
    fn corrupt_header_crc_is_rejected() {
        let tmp = NamedTempFile::new().expect("temp file");
        {
            let (mut store, _) = BackingFile::open(tmp.path(), CAP, false).expect("open");
            store.upsert_slot(identity("d0"), 512, 99).expect("slot");
        }
        let mut bytes = std::fs::read(tmp.path()).expect("read");
        bytes[20] ^= 0xff;
        std::fs::write(tmp.path(), &bytes).expect("write");
        let err = BackingFile::open(tmp.path(), CAP, false).expect_err("bad crc");
        assert!(err.to_string().contains("CRC"));
    }

    #[test]
    fn records_survive_reopen() {
        let tmp = NamedTempFile::new().expect("temp file");
        let id = identity("d0");
        let payload = vec![0xab_u8; 1024];
        {
            let (mut store, _) = BackingFile::open(tmp.path(), CAP, false).expect("open");
            store.upsert_slot(id, 512, 999).expect("slot");
            let records = [RecordImage {
                start_lba: 7,
                stored_bytes: 1024,
                logical_bytes: 4096,
                payload: &payload,
            }];
            let locs = store
                .commit_write(id, &records, ChainPred::Head, 0, None, 1024)
                .expect("commit");
            assert_eq!(locs.len(), 1);
        }
        let (store, drives) = BackingFile::open(tmp.path(), CAP, false).expect("reopen");
        assert_eq!(drives.len(), 1);
        let drive = &drives[0];
        assert_eq!(drive.identity, id);
        assert_eq!(drive.block_size, 512);
        assert_eq!(drive.max_lba, 999);
        assert_eq!(drive.data_size, 1024);
        assert_eq!(drive.extents.len(), 1);
        let extent = drive.extents[0];
        assert_eq!(extent.start_lba, 7);
        assert_eq!(extent.stored_bytes, 1024);
        assert_eq!(extent.logical_bytes, 4096);
        let read = store
            .read_payload(extent.loc, 0, extent.stored_bytes)
            .expect("payload");
        assert_eq!(read, payload);
    }

    #[test]
    fn chains_link_through_multiple_records() {
        let tmp = NamedTempFile::new().expect("temp file");
        let id = identity("d0");
        let a = vec![1_u8; 512];
        let b = vec![2_u8; 512];
        {
            let (mut store, _) = BackingFile::open(tmp.path(), CAP, false).expect("open");
            store.upsert_slot(id, 512, 999).expect("slot");
            let records = [
                RecordImage {
                    start_lba: 0,
                    stored_bytes: 512,
                    logical_bytes: 512,
                    payload: &a,
                },
                RecordImage {
                    start_lba: 10,
                    stored_bytes: 512,
                    logical_bytes: 512,
                    payload: &b,
                },
            ];
            store
                .commit_write(id, &records, ChainPred::Head, 0, None, 1024)
                .expect("commit");
        }
        let (_, drives) = BackingFile::open(tmp.path(), CAP, false).expect("reopen");
        let chain: Vec<u64> = drives[0].extents.iter().map(|e| e.start_lba).collect();
        assert_eq!(chain, vec![0, 10]);
    }

    #[test]
    fn capacity_check_rejects_before_writing() {
        let tmp = NamedTempFile::new().expect("temp file");
        let id = identity("d0");
        let (mut store, _) =
            BackingFile::open(tmp.path(), HEADER_SIZE as u64 + 64, false).expect("open");
        store.upsert_slot(id, 512, 999).expect("slot");
        let payload = vec![0_u8; 512];
        let records = [RecordImage {
            start_lba: 0,
            stored_bytes: 512,
            logical_bytes: 512,
            payload: &payload,
        }];
        let end_before = store.end;
        let err = store
            .commit_write(id, &records, ChainPred::Head, 0, None, 512)
            .expect_err("over capacity");
        assert!(matches!(err, VdiskError::BackingStore { .. }));
        assert_eq!(store.end, end_before);
        assert_eq!(store.slots[0].first_extent, 0);
    }

    #[test]
    fn ledger_enforces_capacity_and_releases() {
        let mut ledger = MemoryLedger::new(1000);
        ledger.charge(600, 0).expect("first charge");
        let err = ledger.charge(600, 0).expect_err("over capacity");
        assert!(matches!(err, VdiskError::BackingStore { .. }));
        ledger.charge(600, 300).expect("net fits");
        ledger.release(900);
        ledger.charge(1000, 0).expect("empty again");
    }
}
