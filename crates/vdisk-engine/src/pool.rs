//! Handle pool: bounds and tracks concurrently open drive sessions.
//!
//! Handles are `(slot, generation)` pairs rather than pointers: releasing a
//! slot bumps its generation, so a stale handle can never reach another
//! caller's session. The cursor and its extent hint live in the slot and are
//! only touched through a validated handle.

use crate::DriveState;
use std::sync::Arc;
use vdisk_error::{Result, VdiskError};
use vdisk_types::DriveIdentity;

/// Opaque session token returned by open/create and required by all
/// read/write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriveHandle {
    slot: u32,
    generation: u32,
}

/// Generation-checked bookmark of the last extent a cursor visited.
///
/// Valid only while the drive's extent map generation still matches; any
/// consumer revalidates before use, so a concurrent writer can never cause
/// a reader to chase a stale extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExtentHint {
    pub start: u64,
    pub generation: u64,
}

/// One open session: drive reference plus cursor state.
#[derive(Debug)]
pub(crate) struct Session {
    pub drive: Arc<DriveState>,
    /// Current logical position in blocks, advanced by read/write.
    pub cursor: u64,
    pub hint: Option<ExtentHint>,
}

impl Session {
    pub fn new(drive: Arc<DriveState>) -> Self {
        Self {
            drive,
            cursor: 0,
            hint: None,
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Fixed-capacity table of open sessions.
#[derive(Debug)]
pub(crate) struct HandlePool {
    slots: Vec<Slot>,
}

impl HandlePool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            generation: 1,
            session: None,
        });
        Self { slots }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| s.session.is_none())
    }

    /// Claim a free slot for `session`; fails with `Exhausted` when full.
    pub fn allocate(&mut self, session: Session) -> Result<DriveHandle> {
        let capacity = self.slots.len();
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.session.is_none())
            .ok_or(VdiskError::Exhausted {
                kind: "handle pool",
                capacity,
            })?;
        slot.session = Some(session);
        Ok(DriveHandle {
            slot: index as u32,
            generation: slot.generation,
        })
    }

    /// Release a session; the slot's generation is bumped so the handle
    /// (and any copy of it) goes stale immediately.
    pub fn release(&mut self, handle: DriveHandle) -> Result<Session> {
        let slot = self.slot_mut(handle)?;
        let session = slot.session.take().ok_or(VdiskError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(session)
    }

    pub fn get(&self, handle: DriveHandle) -> Result<&Session> {
        let slot = self
            .slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .ok_or(VdiskError::InvalidHandle)?;
        slot.session.as_ref().ok_or(VdiskError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: DriveHandle) -> Result<&mut Session> {
        let slot = self.slot_mut(handle)?;
        slot.session.as_mut().ok_or(VdiskError::InvalidHandle)
    }

    /// True if any live session references the drive.
    #[must_use]
    pub fn is_open(&self, identity: DriveIdentity) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.session.as_ref())
            .any(|s| s.drive.identity == identity)
    }

    fn slot_mut(&mut self, handle: DriveHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .ok_or(VdiskError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriveIo;
    use parking_lot::Mutex;

    fn drive(label: &str) -> Arc<DriveState> {
        Arc::new(DriveState {
            identity: DriveIdentity::from_label(label).expect("label"),
            block_size: 512,
            max_lba: 99,
            io: Mutex::new(DriveIo::default()),
        })
    }

    #[test]
    fn allocate_until_exhausted() {
        let mut pool = HandlePool::new(2);
        let d = drive("d0");
        let h1 = pool.allocate(Session::new(d.clone())).expect("first");
        let _h2 = pool.allocate(Session::new(d.clone())).expect("second");
        let err = pool.allocate(Session::new(d.clone())).expect_err("full");
        assert!(matches!(err, VdiskError::Exhausted { capacity: 2, .. }));
        // Earlier handles stay valid.
        assert!(pool.get(h1).is_ok());
    }

    #[test]
    fn released_handle_goes_stale() {
        let mut pool = HandlePool::new(1);
        let h = pool.allocate(Session::new(drive("d0"))).expect("allocate");
        pool.release(h).expect("release");
        assert!(matches!(pool.get(h), Err(VdiskError::InvalidHandle)));
        assert!(matches!(pool.release(h), Err(VdiskError::InvalidHandle)));

        // The slot is reusable, and the old handle cannot reach the new session.
        let h2 = pool.allocate(Session::new(drive("d1"))).expect("reuse");
        assert!(pool.get(h2).is_ok());
        assert!(matches!(pool.get(h), Err(VdiskError::InvalidHandle)));
    }

    #[test]
    fn is_open_tracks_live_sessions() {
        let mut pool = HandlePool::new(4);
        let d0 = drive("d0");
        let id = d0.identity;
        let h = pool.allocate(Session::new(d0)).expect("allocate");
        assert!(pool.is_open(id));
        pool.release(h).expect("release");
        assert!(!pool.is_open(id));
    }
}
