#![forbid(unsafe_code)]
//! Entry-slot and data-extent allocation.
//!
//! The entry table is append-only per slot: a slot is allocatable iff all
//! 32 of its bytes still read 0xFF. The data allocator builds the sorted
//! occupied ranges from the table and picks either an end-of-data append
//! or the first fitting gap, then proves the candidate range erased (or
//! erases it) before any metadata points at it.

use mmrofs_error::{MmrofsError, Result};
use mmrofs_flash::{NorFlash, range_is_erased};
use mmrofs_ondisk::{Entry, EntryState, slot_is_blank};
use mmrofs_types::{
    DATA_REGION_START, ENTRY_SIZE, ERASE_BLOCK_SIZE, SlotIndex, align_down_4k, align_up_4k,
};
use tracing::{debug, warn};

// ── Entry slots ─────────────────────────────────────────────────────────────

fn read_raw_slot(dev: &dyn NorFlash, slot: SlotIndex) -> Result<[u8; ENTRY_SIZE]> {
    let mut raw = [0_u8; ENTRY_SIZE];
    dev.read(slot.flash_offset(), &mut raw)?;
    Ok(raw)
}

/// Claim the next FREE slot at or after `*next_free`.
///
/// A slot whose state byte reads 0xFF but whose body does not (an
/// interrupted rewrite of an erased page) is downgraded to ERASED and
/// skipped. Returns `None` when the table has no FREE slot left.
pub fn alloc_slot(
    dev: &dyn NorFlash,
    max_entries: u16,
    next_free: &mut u16,
) -> Result<Option<SlotIndex>> {
    let mut index = *next_free;
    while index < max_entries {
        let slot = SlotIndex(index);
        let raw = read_raw_slot(dev, slot)?;
        if raw[0] != EntryState::Free as u8 {
            index += 1;
            continue;
        }
        if !slot_is_blank(&raw) {
            warn!(
                target: "mmrofs::alloc",
                event = "free_slot_downgraded",
                slot = slot.0
            );
            dev.program(slot.flash_offset(), &[EntryState::Erased as u8])?;
            index += 1;
            continue;
        }
        *next_free = index + 1;
        return Ok(Some(slot));
    }
    *next_free = max_entries;
    Ok(None)
}

/// Lowest fully-blank slot, or `max_entries` when none remain.
pub fn rebuild_next_free(dev: &dyn NorFlash, max_entries: u16) -> Result<u16> {
    for index in 0..max_entries {
        if slot_is_blank(&read_raw_slot(dev, SlotIndex(index))?) {
            return Ok(index);
        }
    }
    Ok(max_entries)
}

// ── Occupied data ranges ────────────────────────────────────────────────────

/// One entry's claim on the data region, block-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupiedRange {
    pub slot: SlotIndex,
    pub start: u32,
    pub end: u64,
}

fn occupies_data(state: u8) -> bool {
    matches!(
        EntryState::from_byte(state),
        Some(
            EntryState::Active
                | EntryState::Valid
                | EntryState::TombstoningOld
                | EntryState::BadBlock
        )
    )
}

/// Sorted, block-aligned ranges claimed by live, in-flight, and bad-block
/// entries. `exclude` drops one slot from consideration (used when the
/// caller is relocating that very entry).
pub fn collect_occupied(
    dev: &dyn NorFlash,
    max_entries: u16,
    exclude: Option<SlotIndex>,
) -> Result<Vec<OccupiedRange>> {
    let mut ranges = Vec::new();
    for index in 0..max_entries {
        let slot = SlotIndex(index);
        if exclude == Some(slot) {
            continue;
        }
        let entry = Entry::decode(&read_raw_slot(dev, slot)?);
        if !occupies_data(entry.state) || entry.offset < DATA_REGION_START {
            continue;
        }
        // Defensive alignment: a torn BADBLOCK offset must still shadow
        // whole blocks.
        let start = align_down_4k(u64::from(entry.offset));
        let end = align_up_4k(entry.footprint_end());
        let start = u32::try_from(start)
            .map_err(|_| MmrofsError::InvalidArgument("occupied range beyond u32 offsets"))?;
        ranges.push(OccupiedRange { slot, start, end });
    }
    ranges.sort_by_key(|r| r.start);
    Ok(ranges)
}

fn first_fit(ranges: &[OccupiedRange], alloc: u64, limit: u64) -> Option<u32> {
    let mut candidate = u64::from(DATA_REGION_START);
    for range in ranges {
        if candidate + alloc <= u64::from(range.start) && candidate + alloc <= limit {
            #[allow(clippy::cast_possible_truncation)] // candidate < limit <= 2^32
            return Some(candidate as u32);
        }
        if range.end > candidate {
            candidate = range.end;
        }
    }
    if candidate + alloc <= limit {
        #[allow(clippy::cast_possible_truncation)]
        return Some(candidate as u32);
    }
    None
}

/// Find a 4 KiB-aligned contiguous extent for `needed` bytes.
///
/// Tries an append after the highest occupied range first, then first-fit
/// across gaps. Blocks belonging to tombstoned entries count as free here;
/// `prepare_extent` erases them before use.
pub fn find_free_extent(
    dev: &dyn NorFlash,
    max_entries: u16,
    partition_size: u64,
    needed: u64,
) -> Result<u32> {
    let alloc = align_up_4k(needed);
    if alloc == 0 {
        return Err(MmrofsError::InvalidArgument("cannot allocate 0 bytes"));
    }
    let ranges = collect_occupied(dev, max_entries, None)?;

    let data_end = ranges
        .iter()
        .map(|r| r.end)
        .max()
        .unwrap_or(u64::from(DATA_REGION_START));
    if data_end + alloc <= partition_size {
        #[allow(clippy::cast_possible_truncation)] // data_end < partition_size <= 2^32
        let candidate = data_end as u32;
        debug!(
            target: "mmrofs::alloc",
            event = "extent_append",
            offset = candidate,
            bytes = alloc
        );
        return Ok(candidate);
    }

    if let Some(candidate) = first_fit(&ranges, alloc, partition_size) {
        debug!(
            target: "mmrofs::alloc",
            event = "extent_gap_fit",
            offset = candidate,
            bytes = alloc
        );
        return Ok(candidate);
    }
    Err(MmrofsError::NoSpace)
}

/// First-fit gap for `needed` bytes that ends at or before `bound`,
/// ignoring the entry being relocated. Used by the data defragmenter.
pub fn find_gap_before(
    dev: &dyn NorFlash,
    max_entries: u16,
    needed: u64,
    bound: u32,
    exclude: SlotIndex,
) -> Result<Option<u32>> {
    let alloc = align_up_4k(needed);
    let ranges = collect_occupied(dev, max_entries, Some(exclude))?;
    Ok(first_fit(&ranges, alloc, u64::from(bound)))
}

// ── Extent preparation ──────────────────────────────────────────────────────

/// Outcome of proving an extent erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentPrep {
    Ready,
    /// A block kept non-0xFF bytes after erase and must be retired.
    BadBlock { offset: u32 },
}

/// Verify that every block of `[offset, offset + needed)` reads 0xFF,
/// erasing blocks that do not. A block that fails verification after its
/// erase is reported for permanent retirement.
pub fn prepare_extent(dev: &dyn NorFlash, offset: u32, needed: u64) -> Result<ExtentPrep> {
    let blocks = align_up_4k(needed) / u64::from(ERASE_BLOCK_SIZE);
    for i in 0..blocks {
        let block = u64::from(offset) + i * u64::from(ERASE_BLOCK_SIZE);
        let block = u32::try_from(block)
            .map_err(|_| MmrofsError::InvalidArgument("extent beyond u32 offsets"))?;
        if range_is_erased(dev, block, u64::from(ERASE_BLOCK_SIZE))? {
            continue;
        }
        dev.erase_4k(block)?;
        if !range_is_erased(dev, block, u64::from(ERASE_BLOCK_SIZE))? {
            warn!(
                target: "mmrofs::alloc",
                event = "bad_block",
                offset = block
            );
            return Ok(ExtentPrep::BadBlock { offset: block });
        }
    }
    Ok(ExtentPrep::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmrofs_flash::RamNorFlash;
    use mmrofs_types::{ENTRY_NONE, MAX_ENTRIES};

    const PARTITION: usize = 0x10000 + 8 * 4096;

    fn put_entry(dev: &dyn NorFlash, slot: SlotIndex, state: EntryState, offset: u32, size: u32) {
        let entry = Entry {
            state: state as u8,
            name_len: 4,
            name_hash: 0x1234_5678,
            offset,
            size,
            mtime: 1_700_000_000,
            ctime: 1_700_000_000,
            old_entry: ENTRY_NONE,
            dst_entry: ENTRY_NONE,
        };
        dev.program(slot.flash_offset(), &entry.encode()).unwrap();
    }

    #[test]
    fn alloc_slot_claims_lowest_blank() {
        let dev = RamNorFlash::new(PARTITION);
        let mut hint = 0;
        assert_eq!(
            alloc_slot(dev.as_ref(), MAX_ENTRIES, &mut hint).unwrap(),
            Some(SlotIndex(0))
        );
        assert_eq!(hint, 1);
        assert_eq!(
            alloc_slot(dev.as_ref(), MAX_ENTRIES, &mut hint).unwrap(),
            Some(SlotIndex(1))
        );
    }

    #[test]
    fn alloc_slot_downgrades_dirty_free_slot() {
        let dev = RamNorFlash::new(PARTITION);
        // State byte FREE but a body byte already programmed.
        dev.program(SlotIndex(0).flash_offset() + 9, &[0x00]).unwrap();
        let mut hint = 0;
        assert_eq!(
            alloc_slot(dev.as_ref(), MAX_ENTRIES, &mut hint).unwrap(),
            Some(SlotIndex(1))
        );
        let mut state = [0_u8; 1];
        dev.read(SlotIndex(0).flash_offset(), &mut state).unwrap();
        assert_eq!(state[0], EntryState::Erased as u8);
    }

    #[test]
    fn alloc_slot_exhausts() {
        let dev = RamNorFlash::new(PARTITION);
        let mut hint = 0;
        assert_eq!(alloc_slot(dev.as_ref(), 2, &mut hint).unwrap(), Some(SlotIndex(0)));
        assert_eq!(alloc_slot(dev.as_ref(), 2, &mut hint).unwrap(), Some(SlotIndex(1)));
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x10000, 100);
        put_entry(dev.as_ref(), SlotIndex(1), EntryState::Valid, 0x11000, 100);
        hint = 0;
        assert_eq!(alloc_slot(dev.as_ref(), 2, &mut hint).unwrap(), None);
    }

    #[test]
    fn rebuild_next_free_skips_used_slots() {
        let dev = RamNorFlash::new(PARTITION);
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x10000, 100);
        put_entry(dev.as_ref(), SlotIndex(1), EntryState::Tombstone, 0x11000, 100);
        assert_eq!(rebuild_next_free(dev.as_ref(), MAX_ENTRIES).unwrap(), 2);
    }

    #[test]
    fn empty_table_allocates_at_data_region_start() {
        let dev = RamNorFlash::new(PARTITION);
        let offset =
            find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 100).unwrap();
        assert_eq!(offset, DATA_REGION_START);
    }

    #[test]
    fn append_after_highest_live_range() {
        let dev = RamNorFlash::new(PARTITION);
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x10000, 5000);
        let offset =
            find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 100).unwrap();
        assert_eq!(offset, 0x12000);
    }

    #[test]
    fn gap_reuse_when_append_does_not_fit() {
        let dev = RamNorFlash::new(PARTITION);
        // Occupy blocks 1 and the final block, leaving a gap at block 0 and 2..7.
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x11000, 4000);
        put_entry(
            dev.as_ref(),
            SlotIndex(1),
            EntryState::Valid,
            0x10000 + 7 * 4096,
            4000,
        );
        // Append would land past the end; the first gap that fits is block 0.
        let offset =
            find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 4096).unwrap();
        assert_eq!(offset, 0x10000);
        // Two-block request fits between block 1 and the last block.
        let offset =
            find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 8192).unwrap();
        assert_eq!(offset, 0x12000);
    }

    #[test]
    fn no_space_when_gaps_too_small() {
        let dev = RamNorFlash::new(PARTITION);
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x11000, 4000);
        put_entry(
            dev.as_ref(),
            SlotIndex(1),
            EntryState::Valid,
            0x10000 + 7 * 4096,
            4000,
        );
        let err = find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 6 * 4096)
            .unwrap_err();
        assert!(matches!(err, MmrofsError::NoSpace));
    }

    #[test]
    fn tombstoning_old_and_badblock_ranges_stay_reserved() {
        let dev = RamNorFlash::new(PARTITION);
        put_entry(
            dev.as_ref(),
            SlotIndex(0),
            EntryState::TombstoningOld,
            0x10000,
            100,
        );
        put_entry(dev.as_ref(), SlotIndex(1), EntryState::BadBlock, 0x11000, 4096);
        put_entry(dev.as_ref(), SlotIndex(2), EntryState::Tombstone, 0x12000, 100);
        let ranges = collect_occupied(dev.as_ref(), MAX_ENTRIES, None).unwrap();
        let starts: Vec<u32> = ranges.iter().map(|r| r.start).collect();
        // Tombstones are reclaimable; the other two are not.
        assert_eq!(starts, vec![0x10000, 0x11000]);
        let offset =
            find_free_extent(dev.as_ref(), MAX_ENTRIES, PARTITION as u64, 100).unwrap();
        assert_eq!(offset, 0x12000);
    }

    #[test]
    fn find_gap_before_ignores_relocating_entry() {
        let dev = RamNorFlash::new(PARTITION);
        put_entry(dev.as_ref(), SlotIndex(0), EntryState::Valid, 0x13000, 4000);
        let gap =
            find_gap_before(dev.as_ref(), MAX_ENTRIES, 4096, 0x13000, SlotIndex(0)).unwrap();
        assert_eq!(gap, Some(0x10000));
        // No gap strictly before an entry already at the region start.
        put_entry(dev.as_ref(), SlotIndex(1), EntryState::Valid, 0x10000, 3 * 4096);
        let gap =
            find_gap_before(dev.as_ref(), MAX_ENTRIES, 4096, 0x10000, SlotIndex(1)).unwrap();
        assert_eq!(gap, None);
    }

    #[test]
    fn prepare_extent_erases_stale_blocks() {
        let dev = RamNorFlash::new(PARTITION);
        dev.program(0x11000, &[0x00; 64]).unwrap();
        assert_eq!(
            prepare_extent(dev.as_ref(), 0x10000, 3 * 4096).unwrap(),
            ExtentPrep::Ready
        );
        assert!(range_is_erased(dev.as_ref(), 0x10000, 3 * 4096).unwrap());
        // Already-erased blocks are not erased again.
        let erases = dev.erase_count();
        assert_eq!(
            prepare_extent(dev.as_ref(), 0x10000, 3 * 4096).unwrap(),
            ExtentPrep::Ready
        );
        assert_eq!(dev.erase_count(), erases);
    }
}
