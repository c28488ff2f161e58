//! Extent store: the per-drive ordered, non-overlapping extent map.
//!
//! Extents are kept in a `BTreeMap` keyed by start LBA, with a mutation
//! generation counter that lets cursor hints be revalidated instead of
//! trusted. Writes are planned against an immutable view ([`ExtentMap::plan_write`])
//! and applied separately ([`ExtentMap::apply_write`]), so the file backend can
//! persist the outcome between the two steps and a failed persist leaves the
//! in-memory list untouched.
//!
//! # Invariants
//!
//! - Extents are strictly increasing and non-overlapping by start LBA.
//! - `stored_blocks` divides `logical_blocks`; the payload holds exactly
//!   `stored_blocks` blocks and reads tile it `logical_blocks / stored_blocks`
//!   times (repeat compression).
//! - A partially overwritten extent is decomposed into at most two survivors
//!   per side: a repeat-aligned remainder (whole repetitions, payload reused)
//!   and an unaligned piece (a sub-slice of one repetition). The newest write
//!   always wins inside the overlapped range.

use std::collections::BTreeMap;
use vdisk_error::{Result, VdiskError};

/// Where an extent's payload lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Payload {
    /// Owned bytes (memory backend, or a planned extent not yet persisted).
    Inline(Vec<u8>),
    /// Record location in the backing file; payload is read on demand.
    Stored { loc: u64 },
}

/// One contiguous run of logical blocks backed by a single stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Extent {
    /// First LBA covered.
    pub start: u64,
    /// Blocks of unique payload actually stored.
    pub stored_blocks: u64,
    /// Blocks logically covered; `>= stored_blocks`, tiled on read.
    pub logical_blocks: u64,
    pub payload: Payload,
}

impl Extent {
    /// One past the last LBA covered.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.logical_blocks
    }

    #[must_use]
    pub fn inline(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Inline(bytes) => Some(bytes),
            Payload::Stored { .. } => None,
        }
    }

    #[must_use]
    pub fn stored_loc(&self) -> Option<u64> {
        match &self.payload {
            Payload::Inline(_) => None,
            Payload::Stored { loc } => Some(*loc),
        }
    }
}

/// Four-pointer context around a target range: the minimal information
/// needed to perform an insertion without rescanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeContext {
    /// Extent immediately before the range (no overlap).
    pub previous: Option<u64>,
    /// First extent intersecting the range.
    pub first_overlap: Option<u64>,
    /// Last extent intersecting the range.
    pub last_overlap: Option<u64>,
    /// Extent immediately after the range.
    pub next: Option<u64>,
}

/// In-place shrink of a partially kept extent (left repeat survivor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Shrink {
    pub key: u64,
    pub logical_blocks: u64,
}

/// Outcome of planning a write: everything needed to persist and then apply.
#[derive(Debug)]
pub(crate) struct WritePlan {
    /// Keys of extents fully superseded (removed from the map).
    pub removed: Vec<u64>,
    /// Extent kept with a reduced logical length, if any.
    pub shrink: Option<Shrink>,
    /// Extents to insert, ascending by start; payloads are always `Inline`.
    pub added: Vec<Extent>,
    /// Surviving extent immediately before `added[0]` after apply.
    pub previous: Option<u64>,
    /// Surviving extent immediately after the last added extent.
    pub next: Option<u64>,
    /// Stored payload bytes released by `removed`.
    pub freed_bytes: u64,
    /// Stored payload bytes introduced by `added`.
    pub added_bytes: u64,
}

/// Ordered extent map for one drive.
#[derive(Debug, Default)]
pub(crate) struct ExtentMap {
    map: BTreeMap<u64, Extent>,
    /// Bumped on every mutation; cursor hints carry the value they saw.
    generation: u64,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<&Extent> {
        self.map.get(&key)
    }

    /// One past the last logically covered LBA, or 0 for an empty drive.
    #[must_use]
    pub fn end_of_data(&self) -> u64 {
        self.map.values().next_back().map_or(0, Extent::end)
    }

    /// Total stored payload bytes across all extents.
    #[must_use]
    pub fn total_stored_bytes(&self, block_size: u32) -> u64 {
        self.map
            .values()
            .map(|e| e.stored_blocks * u64::from(block_size))
            .sum()
    }

    /// Extents intersecting `[start, start + blocks)`, in address order.
    ///
    /// `hint` is a candidate key for the extent straddling `start` (a cursor
    /// hint whose generation the caller has already validated); when it
    /// checks out it replaces the ordered-map probe for the leading extent.
    pub fn overlapping(
        &self,
        start: u64,
        blocks: u64,
        hint: Option<u64>,
    ) -> impl Iterator<Item = &Extent> {
        let end = start.saturating_add(blocks);
        let lead = hint
            .and_then(|key| self.map.get(&key))
            .filter(|e| e.start < start && e.end() > start)
            .or_else(|| {
                self.map
                    .range(..start)
                    .next_back()
                    .map(|(_, e)| e)
                    .filter(|e| e.end() > start)
            });
        lead.into_iter()
            .chain(self.map.range(start..end).map(|(_, e)| e))
    }

    /// Bookmark key for a cursor at `lba`: the extent containing it, or the
    /// nearest one before it.
    #[must_use]
    pub fn hint_for(&self, lba: u64) -> Option<u64> {
        self.map.range(..=lba).next_back().map(|(k, _)| *k)
    }

    /// Locate the four-pointer context for `[start, start + blocks)`.
    pub fn locate(&self, start: u64, blocks: u64) -> RangeContext {
        let end = start.saturating_add(blocks);
        let mut previous = None;
        let mut first_overlap = None;
        if let Some((k, e)) = self.map.range(..start).next_back() {
            if e.end() > start {
                first_overlap = Some(*k);
                previous = self.map.range(..*k).next_back().map(|(k, _)| *k);
            } else {
                previous = Some(*k);
            }
        }
        let mut last_overlap = first_overlap;
        for (k, _) in self.map.range(start..end) {
            if first_overlap.is_none() {
                first_overlap = Some(*k);
            }
            last_overlap = Some(*k);
        }
        let next = self.map.range(end..).next().map(|(k, _)| *k);
        RangeContext {
            previous,
            first_overlap,
            last_overlap,
            next,
        }
    }

    /// Insert an extent rebuilt from the backing file on open.
    ///
    /// Records must arrive in chain order; the ordering and non-overlap
    /// invariants are validated against the previous record.
    pub fn push_loaded(&mut self, extent: Extent) -> Result<()> {
        if extent.stored_blocks == 0
            || extent.logical_blocks % extent.stored_blocks != 0
        {
            return Err(VdiskError::BackingStore {
                detail: format!(
                    "corrupt extent record: stored={} logical={}",
                    extent.stored_blocks, extent.logical_blocks
                ),
            });
        }
        if let Some((_, prev)) = self.map.iter().next_back() {
            if extent.start < prev.end() {
                return Err(VdiskError::BackingStore {
                    detail: format!(
                        "extent chain out of order: {} follows run ending at {}",
                        extent.start,
                        prev.end()
                    ),
                });
            }
        }
        self.map.insert(extent.start, extent);
        Ok(())
    }

    /// Drop every extent, returning the stored bytes released.
    pub fn clear(&mut self, block_size: u32) -> u64 {
        let freed = self.total_stored_bytes(block_size);
        self.map.clear();
        self.generation += 1;
        freed
    }

    /// Plan the insertion of a new extent over `[start, start + logical_blocks)`.
    ///
    /// `payload` holds `stored_blocks` blocks; `fetch` resolves
    /// `(extent, byte_offset, byte_len)` into payload bytes for survivors of
    /// split extents. The map is not modified; callers persist the plan and
    /// then hand it to [`Self::apply_write`] while still holding the drive's
    /// io lock.
    pub fn plan_write(
        &self,
        start: u64,
        stored_blocks: u64,
        logical_blocks: u64,
        payload: Vec<u8>,
        block_size: u32,
        fetch: &mut dyn FnMut(&Extent, u64, u64) -> Result<Vec<u8>>,
    ) -> Result<WritePlan> {
        let bs = u64::from(block_size);
        debug_assert_eq!(payload.len() as u64, stored_blocks * bs);
        debug_assert_eq!(logical_blocks % stored_blocks, 0);

        let end = start + logical_blocks;
        let ctx = self.locate(start, logical_blocks);

        let mut removed: Vec<u64> = match (ctx.first_overlap, ctx.last_overlap) {
            (Some(first), Some(last)) => self.map.range(first..=last).map(|(k, _)| *k).collect(),
            _ => Vec::new(),
        };

        let mut shrink = None;
        let mut left_piece = None;
        // Left survivors: the head of the first overlapped extent.
        if let Some(first) = ctx.first_overlap {
            let x = &self.map[&first];
            if x.start < start {
                let offset = start - x.start;
                let repeats_kept = offset / x.stored_blocks;
                let remainder = offset % x.stored_blocks;
                if repeats_kept > 0 {
                    shrink = Some(Shrink {
                        key: first,
                        logical_blocks: repeats_kept * x.stored_blocks,
                    });
                    removed.retain(|k| *k != first);
                }
                if remainder > 0 {
                    let bytes = fetch(x, 0, remainder * bs)?;
                    left_piece = Some(Extent {
                        start: x.start + repeats_kept * x.stored_blocks,
                        stored_blocks: remainder,
                        logical_blocks: remainder,
                        payload: Payload::Inline(bytes),
                    });
                }
            }
        }

        let mut right_piece = None;
        let mut right_repeat = None;
        // Right survivors: the tail of the last overlapped extent.
        if let Some(last) = ctx.last_overlap {
            let y = &self.map[&last];
            if y.end() > end {
                let within = (end - y.start) % y.stored_blocks;
                let mut tail = y.end() - end;
                let mut at = end;
                if within > 0 {
                    let piece = (y.stored_blocks - within).min(tail);
                    let bytes = fetch(y, within * bs, piece * bs)?;
                    right_piece = Some(Extent {
                        start: at,
                        stored_blocks: piece,
                        logical_blocks: piece,
                        payload: Payload::Inline(bytes),
                    });
                    tail -= piece;
                    at += piece;
                }
                if tail > 0 {
                    debug_assert_eq!(tail % y.stored_blocks, 0);
                    let bytes = fetch(y, 0, y.stored_blocks * bs)?;
                    right_repeat = Some(Extent {
                        start: at,
                        stored_blocks: y.stored_blocks,
                        logical_blocks: tail,
                        payload: Payload::Inline(bytes),
                    });
                }
            }
        }

        // A non-compressed write absorbs adjacent non-compressed pieces so
        // sequential partial overwrites do not fragment the list.
        let mut new_start = start;
        let mut new_payload = payload;
        if stored_blocks == logical_blocks {
            if let Some(piece) = left_piece.take() {
                new_start = piece.start;
                let mut merged = match piece.payload {
                    Payload::Inline(bytes) => bytes,
                    Payload::Stored { .. } => unreachable!("planned pieces are inline"),
                };
                merged.extend_from_slice(&new_payload);
                new_payload = merged;
            }
            if let Some(piece) = right_piece.take() {
                match piece.payload {
                    Payload::Inline(bytes) => new_payload.extend_from_slice(&bytes),
                    Payload::Stored { .. } => unreachable!("planned pieces are inline"),
                }
            }
        }
        let new_stored = new_payload.len() as u64 / bs;
        let new_logical = if stored_blocks == logical_blocks {
            new_stored
        } else {
            logical_blocks
        };
        let new_extent = Extent {
            start: new_start,
            stored_blocks: new_stored,
            logical_blocks: new_logical,
            payload: Payload::Inline(new_payload),
        };

        let mut added = Vec::with_capacity(4);
        if let Some(piece) = left_piece {
            added.push(piece);
        }
        added.push(new_extent);
        if let Some(piece) = right_piece {
            added.push(piece);
        }
        if let Some(rep) = right_repeat {
            added.push(rep);
        }

        let freed_bytes = removed
            .iter()
            .map(|k| self.map[k].stored_blocks * bs)
            .sum();
        let added_bytes = added.iter().map(|e| e.stored_blocks * bs).sum();

        Ok(WritePlan {
            previous: shrink.map(|s| s.key).or(ctx.previous),
            next: ctx.next,
            removed,
            shrink,
            added,
            freed_bytes,
            added_bytes,
        })
    }

    /// Apply a previously planned write.
    ///
    /// `locs` (file backend) gives one record location per added extent, in
    /// order; the inline payloads are replaced with stored references.
    pub fn apply_write(&mut self, plan: WritePlan, locs: Option<&[u64]>) {
        if let Some(locs) = locs {
            debug_assert_eq!(locs.len(), plan.added.len());
        }
        for key in &plan.removed {
            self.map.remove(key);
        }
        if let Some(shrink) = plan.shrink {
            if let Some(kept) = self.map.get_mut(&shrink.key) {
                kept.logical_blocks = shrink.logical_blocks;
            }
        }
        for (i, mut extent) in plan.added.into_iter().enumerate() {
            if let Some(locs) = locs {
                extent.payload = Payload::Stored { loc: locs[i] };
            }
            self.map.insert(extent.start, extent);
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u32 = 4;

    fn block(fill: u8, blocks: u64) -> Vec<u8> {
        vec![fill; (blocks * u64::from(BS)) as usize]
    }

    fn inline_fetch(extent: &Extent, off: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = extent.inline().expect("test extents are inline");
        Ok(bytes[off as usize..(off + len) as usize].to_vec())
    }

    fn write(map: &mut ExtentMap, start: u64, stored: u64, logical: u64, fill: u8) {
        let plan = map
            .plan_write(start, stored, logical, block(fill, stored), BS, &mut inline_fetch)
            .expect("plan");
        map.apply_write(plan, None);
    }

    fn spans(map: &ExtentMap) -> Vec<(u64, u64, u64)> {
        map.map
            .values()
            .map(|e| (e.start, e.stored_blocks, e.logical_blocks))
            .collect()
    }

    #[test]
    fn pure_insert_into_gap() {
        let mut map = ExtentMap::new();
        write(&mut map, 10, 2, 2, 0xaa);
        write(&mut map, 20, 2, 2, 0xbb);
        write(&mut map, 14, 2, 2, 0xcc);
        assert_eq!(spans(&map), vec![(10, 2, 2), (14, 2, 2), (20, 2, 2)]);
    }

    #[test]
    fn locate_reports_four_pointers() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 2, 2, 1);
        write(&mut map, 4, 2, 2, 2);
        write(&mut map, 10, 2, 2, 3);

        let ctx = map.locate(5, 4);
        assert_eq!(ctx.previous, Some(0));
        assert_eq!(ctx.first_overlap, Some(4));
        assert_eq!(ctx.last_overlap, Some(4));
        assert_eq!(ctx.next, Some(10));

        let ctx = map.locate(2, 2);
        assert_eq!(ctx.previous, Some(0));
        assert_eq!(ctx.first_overlap, None);
        assert_eq!(ctx.last_overlap, None);
        assert_eq!(ctx.next, Some(4));
    }

    #[test]
    fn overwrite_middle_of_plain_extent_coalesces() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 5, 5, 0x11);
        write(&mut map, 2, 1, 1, 0x22);
        // Left piece + new + right piece merge back into one plain extent.
        assert_eq!(spans(&map), vec![(0, 5, 5)]);
        let e = map.get(0).expect("merged extent");
        let bytes = e.inline().expect("inline");
        assert_eq!(&bytes[..8], &block(0x11, 2)[..]);
        assert_eq!(&bytes[8..12], &block(0x22, 1)[..]);
        assert_eq!(&bytes[12..], &block(0x11, 2)[..]);
    }

    #[test]
    fn overwrite_middle_of_repeat_extent_splits() {
        let mut map = ExtentMap::new();
        // 1 stored block repeated 100 times at LBA 10.
        write(&mut map, 10, 1, 100, 0x5a);
        write(&mut map, 50, 10, 10, 0x22);
        assert_eq!(spans(&map), vec![(10, 1, 40), (50, 10, 10), (60, 1, 50)]);
        let gen_before = map.generation();
        write(&mut map, 0, 1, 1, 0x01);
        assert!(map.generation() > gen_before);
    }

    #[test]
    fn unaligned_split_of_multiblock_repeat() {
        let mut map = ExtentMap::new();
        // 3 stored blocks repeated 4x: logical [0, 12).
        let mut pattern = Vec::new();
        for b in 0_u8..3 {
            pattern.extend_from_slice(&vec![b + 1; BS as usize]);
        }
        let plan = map
            .plan_write(0, 3, 12, pattern.clone(), BS, &mut inline_fetch)
            .expect("plan");
        map.apply_write(plan, None);

        write(&mut map, 4, 2, 2, 0xee);
        // Survivors: full repeat [0,3), piece [3,4) = pattern block 0,
        // new [4,6), tail repeats [6,12).
        assert_eq!(spans(&map), vec![(0, 3, 3), (3, 3, 3), (6, 3, 6)]);
        // The piece coalesced into the new extent; its first block must be
        // the first pattern block.
        let merged = map.get(3).expect("coalesced extent");
        let bytes = merged.inline().expect("inline");
        assert_eq!(&bytes[..BS as usize], &vec![1_u8; BS as usize][..]);
        assert_eq!(&bytes[BS as usize..], &block(0xee, 2)[..]);
        let tail = map.get(6).expect("tail repeats");
        assert_eq!(tail.inline().expect("inline"), &pattern[..]);
    }

    #[test]
    fn full_cover_removes_all_overlapped() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 2, 2, 1);
        write(&mut map, 4, 2, 2, 2);
        write(&mut map, 8, 2, 2, 3);
        write(&mut map, 0, 10, 10, 9);
        assert_eq!(spans(&map), vec![(0, 10, 10)]);
    }

    #[test]
    fn newest_write_wins_on_exact_overlap() {
        let mut map = ExtentMap::new();
        write(&mut map, 5, 3, 3, 0x10);
        write(&mut map, 5, 3, 3, 0x20);
        assert_eq!(spans(&map), vec![(5, 3, 3)]);
        let e = map.get(5).expect("extent");
        assert_eq!(e.inline().expect("inline"), &block(0x20, 3)[..]);
    }

    #[test]
    fn plan_reports_byte_accounting() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 4, 4, 1);
        let plan = map
            .plan_write(0, 4, 4, block(2, 4), BS, &mut inline_fetch)
            .expect("plan");
        assert_eq!(plan.freed_bytes, 4 * u64::from(BS));
        assert_eq!(plan.added_bytes, 4 * u64::from(BS));
    }

    #[test]
    fn write_same_tail_survivor_keeps_payload() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 2, 20, 0x77);
        // Overwrite the head; tail must survive as repeats of the payload.
        write(&mut map, 0, 4, 4, 0x88);
        assert_eq!(spans(&map), vec![(0, 4, 4), (4, 2, 16)]);
        let tail = map.get(4).expect("tail");
        assert_eq!(tail.inline().expect("inline"), &block(0x77, 2)[..]);
    }

    #[test]
    fn clear_reports_freed_bytes() {
        let mut map = ExtentMap::new();
        write(&mut map, 0, 3, 3, 1);
        write(&mut map, 10, 1, 50, 2);
        assert_eq!(map.clear(BS), 4 * u64::from(BS));
        assert!(spans(&map).is_empty());
        assert_eq!(map.end_of_data(), 0);
    }

    #[test]
    fn loaded_chain_must_be_ordered() {
        let mut map = ExtentMap::new();
        map.push_loaded(Extent {
            start: 10,
            stored_blocks: 2,
            logical_blocks: 4,
            payload: Payload::Stored { loc: 100 },
        })
        .expect("first record");
        let err = map
            .push_loaded(Extent {
                start: 12,
                stored_blocks: 1,
                logical_blocks: 1,
                payload: Payload::Stored { loc: 200 },
            })
            .expect_err("overlapping record");
        assert!(matches!(err, VdiskError::BackingStore { .. }));
    }

    #[test]
    fn hint_for_and_end_of_data() {
        let mut map = ExtentMap::new();
        write(&mut map, 10, 1, 8, 0x42);
        assert!(map.hint_for(9).is_none());
        assert_eq!(map.hint_for(10), Some(10));
        assert_eq!(map.hint_for(17), Some(10));
        // Past the extent the bookmark still names the nearest run before it.
        assert_eq!(map.hint_for(500), Some(10));
        assert_eq!(map.end_of_data(), 18);
    }
}
