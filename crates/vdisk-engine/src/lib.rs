#![forbid(unsafe_code)]
//! Chunked sparse virtual block-store engine.
//!
//! Emulates a physical drive's LBA address space on top of a backing file or
//! anonymous memory. Each drive keeps a sparse, ordered, repeat-compressed
//! extent list; reads fill unwritten gaps with the zero pattern and expand
//! repeat-compressed extents; writes (and "write same block N times")
//! insert into the list, trimming or superseding whatever they overlap.
//!
//! # Construction
//!
//! An [`Engine`] is an explicit instance with no process-wide state, so
//! independent engines can coexist in one process:
//!
//! ```no_run
//! use vdisk_engine::{DriveIdentity, Engine, EngineConfig, Lba};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let id = DriveIdentity::from_label("disk0").unwrap();
//! let handle = engine.create_drive(id, 520, 999)?;
//! engine.write(handle, Lba(0), 1, &[0u8; 520])?;
//! # Ok::<(), vdisk_engine::VdiskError>(())
//! ```
//!
//! # Locking
//!
//! Four lock levels, always acquired downward, never upward:
//!
//! 1. catalog lock: drive create/remove/find/list; never held across I/O
//! 2. handle-pool lock: allocate/release/handle resolution only
//! 3. per-drive io lock: held for the whole of one read or write call
//! 4. backing lock: file appends/patches or the memory capacity ledger
//!
//! Operations on different drives never contend past level 2; operations on
//! the same drive serialize on its io lock in call order.

mod backing;
mod extent;
mod pool;

pub use pool::DriveHandle;
pub use vdisk_error::{Result, VdiskError};
pub use vdisk_types::{DriveIdentity, DriveSummary, Lba};

use backing::{BackingFile, ChainPred, MemoryLedger, RecordImage};
use extent::{Extent, ExtentMap, Payload};
use parking_lot::Mutex;
use pool::{ExtentHint, HandlePool, Session};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vdisk_types::{
    DEFAULT_HANDLE_CAPACITY, DEFAULT_TOTAL_CAPACITY_MB, MAX_DRIVES, ZERO_STAMP, ZERO_STAMP_OFFSET,
};

/// Storage medium behind an engine instance.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// No persistence; all drives vanish with the engine.
    Memory,
    /// File-backed store at `<directory>/vdisk_<session>.img`.
    File { directory: PathBuf, session: String },
}

/// How unwritten regions read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroFillMode {
    /// Plain zero bytes.
    RealZero,
    /// Zero blocks carrying the valid-zero stamp at the 520-byte-sector
    /// metadata offset (blocks smaller than that read as plain zeros).
    Synthetic,
}

/// Backing-store lifetime across engine instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// File-backed drives persist and are reloaded on the next open.
    Permanent,
    /// The store is recreated empty on init and deleted on clean shutdown.
    Temporary,
}

/// Cursor origin for [`Engine::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    /// End of written data (one past the last extent), not `max_lba`.
    End,
}

/// Engine construction parameters. Applied once, before any drive exists.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Backing-capacity ceiling in mebibytes (file size, or live payload
    /// bytes for the memory backend).
    pub total_capacity_mb: u64,
    pub zero_fill: ZeroFillMode,
    /// Bound on concurrently open handles across all drives.
    pub handle_capacity: usize,
    pub lifecycle: Lifecycle,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            total_capacity_mb: DEFAULT_TOTAL_CAPACITY_MB,
            zero_fill: ZeroFillMode::RealZero,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            lifecycle: Lifecycle::Permanent,
        }
    }
}

/// One virtual drive: immutable geometry plus io-locked extent state.
#[derive(Debug)]
pub(crate) struct DriveState {
    pub identity: DriveIdentity,
    /// Bytes per logical block.
    pub block_size: u32,
    /// Highest valid block address, inclusive.
    pub max_lba: u64,
    pub io: Mutex<DriveIo>,
}

/// Mutable per-drive state, guarded by the drive's io lock.
#[derive(Debug, Default)]
pub(crate) struct DriveIo {
    pub extents: ExtentMap,
    /// Bytes of unique payload currently persisted for this drive.
    pub data_size: u64,
}

#[derive(Debug)]
enum Backend {
    Memory(Mutex<MemoryLedger>),
    File(Mutex<BackingFile>),
}

/// The block-store engine: drive catalog, handle pool, and backing store.
#[derive(Debug)]
pub struct Engine {
    zero_fill: ZeroFillMode,
    lifecycle: Lifecycle,
    catalog: Mutex<BTreeMap<DriveIdentity, Arc<DriveState>>>,
    pool: Mutex<HandlePool>,
    backend: Backend,
    cleaned: AtomicBool,
}

impl Engine {
    /// Build an engine, loading any persisted drives for a file-backed
    /// permanent store. A temporary store starts (and ends) empty.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let EngineConfig {
            backend,
            total_capacity_mb,
            zero_fill,
            handle_capacity,
            lifecycle,
        } = config;
        if handle_capacity == 0 {
            return Err(VdiskError::InvalidArgument("handle capacity must be nonzero"));
        }
        let capacity_bytes = total_capacity_mb
            .checked_mul(1024 * 1024)
            .ok_or(VdiskError::InvalidArgument("total capacity overflows bytes"))?;

        let mut catalog = BTreeMap::new();
        let (backend, backend_name) = match backend {
            BackendKind::Memory => (
                Backend::Memory(Mutex::new(MemoryLedger::new(capacity_bytes))),
                "memory",
            ),
            BackendKind::File { directory, session } => {
                let path = directory.join(format!("vdisk_{session}.img"));
                let fresh = matches!(lifecycle, Lifecycle::Temporary);
                let (file, loaded) = BackingFile::open(&path, capacity_bytes, fresh)?;
                for drive in loaded {
                    let state = rebuild_drive(drive)?;
                    catalog.insert(state.identity, Arc::new(state));
                }
                (Backend::File(Mutex::new(file)), "file")
            }
        };

        info!(
            backend = backend_name,
            drives = catalog.len(),
            capacity_mb = total_capacity_mb,
            "vdisk engine ready"
        );
        Ok(Self {
            zero_fill,
            lifecycle,
            catalog: Mutex::new(catalog),
            pool: Mutex::new(HandlePool::new(handle_capacity)),
            backend,
            cleaned: AtomicBool::new(false),
        })
    }

    /// Tear the engine down. A temporary file-backed store is deleted; a
    /// permanent one is synced to stable storage.
    pub fn shutdown(self) -> Result<()> {
        self.cleaned.store(true, Ordering::Relaxed);
        match (&self.backend, self.lifecycle) {
            (Backend::File(file), Lifecycle::Temporary) => {
                let path = file.lock().path().to_path_buf();
                std::fs::remove_file(&path)?;
                info!(path = %path.display(), "temporary store removed");
            }
            (Backend::File(file), Lifecycle::Permanent) => {
                file.lock().sync()?;
                info!("store synced");
            }
            (Backend::Memory(_), _) => {}
        }
        Ok(())
    }

    /// Create a drive and open a handle to it.
    ///
    /// Creating over an existing identity resets it to empty (all prior
    /// extents are discarded), unless it is currently open, which fails
    /// with `AlreadyOpen`.
    pub fn create_drive(
        &self,
        identity: DriveIdentity,
        block_size: u32,
        max_lba: u64,
    ) -> Result<DriveHandle> {
        if identity.is_empty() {
            return Err(VdiskError::InvalidArgument("drive identity must be nonempty"));
        }
        if block_size == 0 {
            return Err(VdiskError::InvalidArgument("block_size must be nonzero"));
        }

        let mut catalog = self.catalog.lock();
        let mut pool = self.pool.lock();
        if !pool.has_free_slot() {
            return Err(VdiskError::Exhausted {
                kind: "handle pool",
                capacity: pool.capacity(),
            });
        }
        let existing = catalog.get(&identity).cloned();
        if existing.is_some() {
            if pool.is_open(identity) {
                return Err(VdiskError::AlreadyOpen {
                    identity: identity.to_string(),
                });
            }
        } else if catalog.len() >= MAX_DRIVES {
            return Err(VdiskError::Exhausted {
                kind: "drive catalog",
                capacity: MAX_DRIVES,
            });
        }

        if let Backend::File(file) = &self.backend {
            file.lock().upsert_slot(identity, block_size, max_lba)?;
        }
        if let Some(existing) = existing {
            let mut io = existing.io.lock();
            let freed = io.extents.clear(existing.block_size);
            io.data_size = 0;
            if let Backend::Memory(ledger) = &self.backend {
                ledger.lock().release(freed);
            }
        }

        let drive = Arc::new(DriveState {
            identity,
            block_size,
            max_lba,
            io: Mutex::new(DriveIo::default()),
        });
        catalog.insert(identity, drive.clone());
        let handle = pool.allocate(Session::new(drive))?;
        debug!(%identity, block_size, max_lba, "drive created");
        Ok(handle)
    }

    /// Open a handle to an existing drive. Multiple handles may be open on
    /// the same drive concurrently.
    pub fn open_drive(&self, identity: DriveIdentity) -> Result<DriveHandle> {
        let catalog = self.catalog.lock();
        let drive = catalog
            .get(&identity)
            .cloned()
            .ok_or_else(|| VdiskError::NotFound {
                identity: identity.to_string(),
            })?;
        let mut pool = self.pool.lock();
        let handle = pool.allocate(Session::new(drive))?;
        drop(pool);
        drop(catalog);
        debug!(%identity, "drive opened");
        Ok(handle)
    }

    /// Close a handle. The handle (and any copy of it) goes stale.
    pub fn close_drive(&self, handle: DriveHandle) -> Result<()> {
        let session = self.pool.lock().release(handle)?;
        debug!(identity = %session.drive.identity, "drive closed");
        Ok(())
    }

    /// Remove a drive and free its extents. Returns `false` if the identity
    /// does not exist; fails with `AlreadyOpen` while any handle is open.
    pub fn remove_drive(&self, identity: DriveIdentity) -> Result<bool> {
        let mut catalog = self.catalog.lock();
        if !catalog.contains_key(&identity) {
            return Ok(false);
        }
        {
            let pool = self.pool.lock();
            if pool.is_open(identity) {
                return Err(VdiskError::AlreadyOpen {
                    identity: identity.to_string(),
                });
            }
        }
        if let Backend::File(file) = &self.backend {
            file.lock().remove_slot(identity)?;
        }
        if let Some(drive) = catalog.remove(&identity) {
            let freed = drive.io.lock().extents.clear(drive.block_size);
            if let Backend::Memory(ledger) = &self.backend {
                ledger.lock().release(freed);
            }
        }
        debug!(%identity, "drive removed");
        Ok(true)
    }

    /// Snapshot of the catalog, taken under the catalog lock.
    pub fn list_drives(&self) -> Vec<DriveSummary> {
        let catalog = self.catalog.lock();
        catalog
            .values()
            .map(|drive| {
                let io = drive.io.lock();
                DriveSummary {
                    identity: drive.identity,
                    block_size: drive.block_size,
                    max_lba: drive.max_lba,
                    data_size: io.data_size,
                }
            })
            .collect()
    }

    /// Read `block_count` blocks starting at `lba`.
    ///
    /// Gaps read back as the configured zero pattern; repeat-compressed
    /// extents are expanded exactly as if stored block by block. Advances
    /// the handle's cursor past the range on success.
    pub fn read(&self, handle: DriveHandle, lba: Lba, block_count: u64) -> Result<Vec<u8>> {
        if block_count == 0 {
            return Err(VdiskError::InvalidArgument("block_count must be nonzero"));
        }
        let (drive, hint) = self.resolve(handle)?;
        let bs = u64::from(drive.block_size);
        let end = lba
            .0
            .checked_add(block_count)
            .ok_or_else(|| out_of_range(lba.0, block_count, drive.max_lba))?;
        if end - 1 > drive.max_lba {
            return Err(out_of_range(lba.0, block_count, drive.max_lba));
        }
        let total = to_usize(
            block_count
                .checked_mul(bs)
                .ok_or(VdiskError::InvalidArgument("read length overflows u64"))?,
        )?;

        let mut buf = vec![0_u8; total];
        self.fill_unwritten(&mut buf, drive.block_size);

        let new_hint;
        {
            let io = drive.io.lock();
            let hinted = hint
                .filter(|h| h.generation == io.extents.generation())
                .map(|h| h.start);
            for extent in io.extents.overlapping(lba.0, block_count, hinted) {
                let payload = self.payload_bytes(extent, extent.stored_blocks * bs)?;
                let first = extent.start.max(lba.0);
                let last = extent.end().min(end);
                for block in first..last {
                    let src = to_usize(((block - extent.start) % extent.stored_blocks) * bs)?;
                    let dst = to_usize((block - lba.0) * bs)?;
                    buf[dst..dst + bs as usize].copy_from_slice(&payload[src..src + bs as usize]);
                }
            }
            new_hint = self.hint_at(&io.extents, end);
        }
        self.advance_cursor(handle, end, new_hint);
        Ok(buf)
    }

    /// Write `block_count` blocks at `lba`. Returns bytes written.
    pub fn write(
        &self,
        handle: DriveHandle,
        lba: Lba,
        block_count: u64,
        data: &[u8],
    ) -> Result<u64> {
        self.write_same(handle, lba, block_count, 1, data)
    }

    /// Write the `block_count`-block pattern `data`, logically repeated
    /// `repeat_count` times, starting at `lba`. The repetitions share one
    /// stored copy of the pattern. Returns bytes written (logical).
    pub fn write_same(
        &self,
        handle: DriveHandle,
        lba: Lba,
        block_count: u64,
        repeat_count: u64,
        data: &[u8],
    ) -> Result<u64> {
        if block_count == 0 {
            return Err(VdiskError::InvalidArgument("block_count must be nonzero"));
        }
        if repeat_count == 0 {
            return Err(VdiskError::InvalidArgument("repeat_count must be nonzero"));
        }
        let (drive, _) = self.resolve(handle)?;
        let bs = u64::from(drive.block_size);
        let logical = block_count
            .checked_mul(repeat_count)
            .ok_or(VdiskError::InvalidArgument("repeat length overflows u64"))?;
        let total_bytes = logical
            .checked_mul(bs)
            .ok_or(VdiskError::InvalidArgument("write length overflows u64"))?;
        let end = lba
            .0
            .checked_add(logical)
            .ok_or_else(|| out_of_range(lba.0, logical, drive.max_lba))?;
        if end - 1 > drive.max_lba {
            return Err(out_of_range(lba.0, logical, drive.max_lba));
        }
        if data.len() as u64 != block_count * bs {
            return Err(VdiskError::InvalidArgument(
                "pattern buffer does not hold block_count blocks",
            ));
        }

        let mut io = drive.io.lock();
        let plan = {
            let mut fetch = |extent: &Extent, offset: u64, len: u64| -> Result<Vec<u8>> {
                self.fetch_payload_slice(extent, offset, len)
            };
            io.extents.plan_write(
                lba.0,
                block_count,
                logical,
                data.to_vec(),
                drive.block_size,
                &mut fetch,
            )?
        };
        let new_data_size = io
            .data_size
            .checked_sub(plan.freed_bytes)
            .and_then(|v| v.checked_add(plan.added_bytes))
            .ok_or_else(|| VdiskError::BackingStore {
                detail: "data size accounting overflow".to_owned(),
            })?;

        match &self.backend {
            Backend::Memory(ledger) => {
                ledger.lock().charge(plan.added_bytes, plan.freed_bytes)?;
                io.extents.apply_write(plan, None);
            }
            Backend::File(file) => {
                let locs = {
                    let extents = &io.extents;
                    let records = plan
                        .added
                        .iter()
                        .map(|e| {
                            Ok(RecordImage {
                                start_lba: e.start,
                                stored_bytes: e.stored_blocks * bs,
                                logical_bytes: e.logical_blocks * bs,
                                payload: e.inline().ok_or_else(|| VdiskError::BackingStore {
                                    detail: "planned extent has no inline payload".to_owned(),
                                })?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let pred = match plan.previous {
                        Some(key) => ChainPred::Record(record_loc(extents.get(key))?),
                        None => ChainPred::Head,
                    };
                    let tail_next = match plan.next {
                        Some(key) => record_loc(extents.get(key))?,
                        None => 0,
                    };
                    let shrink = match plan.shrink {
                        Some(s) => Some((record_loc(extents.get(s.key))?, s.logical_blocks * bs)),
                        None => None,
                    };
                    file.lock().commit_write(
                        drive.identity,
                        &records,
                        pred,
                        tail_next,
                        shrink,
                        new_data_size,
                    )?
                };
                io.extents.apply_write(plan, Some(&locs));
            }
        }
        io.data_size = new_data_size;
        let new_hint = self.hint_at(&io.extents, end);
        drop(io);

        self.advance_cursor(handle, end, new_hint);
        Ok(total_bytes)
    }

    /// Position the handle's cursor. `End` is the end of written data, not
    /// `max_lba`. The target must land in `[0, max_lba]`.
    pub fn seek(&self, handle: DriveHandle, offset: i64, whence: Whence) -> Result<Lba> {
        let (drive, cursor) = {
            let pool = self.pool.lock();
            let session = pool.get(handle)?;
            (session.drive.clone(), session.cursor)
        };
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => cursor,
            Whence::End => drive.io.lock().extents.end_of_data(),
        };
        let target = i128::from(base) + i128::from(offset);
        if target < 0 || target > i128::from(drive.max_lba) {
            return Err(out_of_range(
                u64::try_from(target.max(0)).unwrap_or(u64::MAX),
                0,
                drive.max_lba,
            ));
        }
        let target = target as u64;
        let hint = self.hint_at(&drive.io.lock().extents, target);

        let mut pool = self.pool.lock();
        let session = pool.get_mut(handle)?;
        session.cursor = target;
        session.hint = hint;
        Ok(Lba(target))
    }

    /// The handle's current cursor position.
    pub fn cursor(&self, handle: DriveHandle) -> Result<Lba> {
        Ok(Lba(self.pool.lock().get(handle)?.cursor))
    }

    fn resolve(&self, handle: DriveHandle) -> Result<(Arc<DriveState>, Option<ExtentHint>)> {
        let pool = self.pool.lock();
        let session = pool.get(handle)?;
        Ok((session.drive.clone(), session.hint))
    }

    /// Best-effort cursor bookkeeping after an I/O call; a concurrently
    /// closed handle is simply skipped.
    fn advance_cursor(&self, handle: DriveHandle, cursor: u64, hint: Option<ExtentHint>) {
        let mut pool = self.pool.lock();
        if let Ok(session) = pool.get_mut(handle) {
            session.cursor = cursor;
            session.hint = hint;
        }
    }

    fn hint_at(&self, extents: &ExtentMap, lba: u64) -> Option<ExtentHint> {
        extents.hint_for(lba).map(|start| ExtentHint {
            start,
            generation: extents.generation(),
        })
    }

    /// Whole stored payload of an extent (`len` = stored bytes).
    fn payload_bytes<'a>(&self, extent: &'a Extent, len: u64) -> Result<Cow<'a, [u8]>> {
        match &extent.payload {
            Payload::Inline(bytes) => Ok(Cow::Borrowed(bytes.as_slice())),
            Payload::Stored { loc } => match &self.backend {
                Backend::File(file) => Ok(Cow::Owned(file.lock().read_payload(*loc, 0, len)?)),
                Backend::Memory(_) => Err(VdiskError::BackingStore {
                    detail: "stored payload without a file backend".to_owned(),
                }),
            },
        }
    }

    fn fetch_payload_slice(&self, extent: &Extent, offset: u64, len: u64) -> Result<Vec<u8>> {
        match &extent.payload {
            Payload::Inline(bytes) => {
                let offset = to_usize(offset)?;
                let len = to_usize(len)?;
                Ok(bytes[offset..offset + len].to_vec())
            }
            Payload::Stored { loc } => match &self.backend {
                Backend::File(file) => file.lock().read_payload(*loc, offset, len),
                Backend::Memory(_) => Err(VdiskError::BackingStore {
                    detail: "stored payload without a file backend".to_owned(),
                }),
            },
        }
    }

    fn fill_unwritten(&self, buf: &mut [u8], block_size: u32) {
        match self.zero_fill {
            ZeroFillMode::RealZero => {}
            ZeroFillMode::Synthetic => {
                let bs = block_size as usize;
                if bs < ZERO_STAMP_OFFSET + 8 {
                    return;
                }
                for block in buf.chunks_exact_mut(bs) {
                    block[ZERO_STAMP_OFFSET..ZERO_STAMP_OFFSET + 8]
                        .copy_from_slice(&ZERO_STAMP.to_le_bytes());
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.cleaned.load(Ordering::Relaxed) {
            return;
        }
        if let (Backend::File(file), Lifecycle::Temporary) = (&self.backend, self.lifecycle) {
            let path = file.lock().path().to_path_buf();
            if let Err(error) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %error, "failed to remove temporary store");
            }
        }
    }
}

fn rebuild_drive(loaded: backing::LoadedDrive) -> Result<DriveState> {
    let bs = u64::from(loaded.block_size);
    if bs == 0 {
        return Err(VdiskError::BackingStore {
            detail: format!("catalog slot for {} has zero block size", loaded.identity),
        });
    }
    let mut extents = ExtentMap::new();
    for record in loaded.extents {
        if record.stored_bytes % bs != 0 || record.logical_bytes % bs != 0 {
            return Err(VdiskError::BackingStore {
                detail: format!(
                    "extent record at {} is not block-aligned for drive {}",
                    record.loc, loaded.identity
                ),
            });
        }
        extents.push_loaded(Extent {
            start: record.start_lba,
            stored_blocks: record.stored_bytes / bs,
            logical_blocks: record.logical_bytes / bs,
            payload: Payload::Stored { loc: record.loc },
        })?;
    }
    Ok(DriveState {
        identity: loaded.identity,
        block_size: loaded.block_size,
        max_lba: loaded.max_lba,
        io: Mutex::new(DriveIo {
            extents,
            data_size: loaded.data_size,
        }),
    })
}

fn record_loc(extent: Option<&Extent>) -> Result<u64> {
    extent
        .and_then(Extent::stored_loc)
        .ok_or_else(|| VdiskError::BackingStore {
            detail: "extent record location missing".to_owned(),
        })
}

fn out_of_range(lba: u64, blocks: u64, max_lba: u64) -> VdiskError {
    VdiskError::OutOfRange {
        lba,
        blocks,
        max_lba,
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| VdiskError::BackingStore {
        detail: "size does not fit usize".to_owned(),
    })
}
