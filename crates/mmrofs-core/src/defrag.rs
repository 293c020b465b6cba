//! Reclamation passes: entry-table compaction and data-region
//! defragmentation.
//!
//! A TOMBSTONE slot only returns to FREE when its whole 4 KiB header page
//! is erased, and a page may be erased only while every slot on it is
//! TOMBSTONE, ERASED, or FREE. Compaction therefore relocates the few
//! live entries off mostly-dead pages (a metadata-only copy aliasing the
//! same data offset) and then erases the vacated pages. Open handles are
//! patched by the old→new slot mapping before the mutex is released.

use crate::fs::Inner;
use crate::txn::NewEntrySpec;
use mmrofs_alloc::{ExtentPrep, find_gap_before, prepare_extent, rebuild_next_free};
use mmrofs_error::Result;
use mmrofs_flash::range_is_erased;
use mmrofs_ondisk::{Entry, EntryState, slot_is_blank};
use mmrofs_types::{
    ENTRIES_PER_PAGE, ENTRY_NONE, ERASE_BLOCK_SIZE, HEADER_PAGES, SlotIndex,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
struct PageCensus {
    free: u16,
    live: u16,
    reclaimable: u16,
    other: u16,
}

impl PageCensus {
    fn erasable(self) -> bool {
        self.live == 0 && self.other == 0 && self.reclaimable > 0
    }
}

impl Inner {
    fn page_census(&self, page: u16) -> Result<PageCensus> {
        let mut census = PageCensus::default();
        let first = page * ENTRIES_PER_PAGE;
        for index in first..first + ENTRIES_PER_PAGE {
            let raw = self.read_raw_entry(SlotIndex(index))?;
            match EntryState::from_byte(raw[0]) {
                Some(EntryState::Free) => {
                    if slot_is_blank(&raw) {
                        census.free += 1;
                    } else {
                        census.reclaimable += 1;
                    }
                }
                Some(EntryState::Active | EntryState::Valid) => census.live += 1,
                Some(EntryState::Tombstone | EntryState::Erased) => census.reclaimable += 1,
                Some(
                    EntryState::Allocating
                    | EntryState::PendingData
                    | EntryState::TombstoningOld
                    | EntryState::BadBlock,
                )
                | None => census.other += 1,
            }
        }
        Ok(census)
    }

    /// Erase one header page back to FREE slots. A page that keeps
    /// residue after erase has every slot branded BADBLOCK.
    fn erase_header_page(&mut self, page: u16) -> Result<()> {
        let offset = u32::from(page) * ERASE_BLOCK_SIZE;
        self.dev.erase_4k(offset)?;
        if !range_is_erased(self.dev.as_ref(), offset, u64::from(ERASE_BLOCK_SIZE))? {
            warn!(
                target: "mmrofs::alloc",
                event = "bad_header_page",
                page = page
            );
            let first = page * ENTRIES_PER_PAGE;
            for index in first..first + ENTRIES_PER_PAGE {
                if let Err(err) = self.write_state(SlotIndex(index), EntryState::BadBlock) {
                    warn!(
                        target: "mmrofs::alloc",
                        event = "bad_header_page_mark_failed",
                        slot = index,
                        error = %err
                    );
                }
            }
        } else {
            info!(target: "mmrofs::alloc", event = "header_page_reclaimed", page = page);
        }
        Ok(())
    }

    fn blank_slot_off_page(&self, avoid_page: u16) -> Result<Option<SlotIndex>> {
        for index in 0..self.max_entries {
            let slot = SlotIndex(index);
            if slot.page() == avoid_page {
                continue;
            }
            if slot_is_blank(&self.read_raw_entry(slot)?) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    /// Metadata-only relocation: the new slot aliases the same data
    /// offset, `old_entry` points back so a crash completes the move.
    fn relocate_entry_slot(&mut self, src: SlotIndex, dst: SlotIndex) -> Result<()> {
        let entry = self.read_entry(src)?;
        let was_valid = entry.lifecycle() == Some(EntryState::Valid);
        let replacement = Entry {
            state: EntryState::Allocating as u8,
            name_len: entry.name_len,
            name_hash: entry.name_hash,
            offset: entry.offset,
            size: entry.size,
            mtime: entry.mtime,
            ctime: entry.ctime,
            old_entry: src.to_entry_ref(),
            dst_entry: ENTRY_NONE,
        };
        self.write_state(dst, EntryState::Allocating)?;
        self.write_entry_tail(dst, &replacement)?;
        self.write_state(dst, EntryState::PendingData)?;
        self.write_state(dst, EntryState::TombstoningOld)?;
        self.write_state(src, EntryState::Tombstone)?;
        self.write_state(dst, EntryState::Active)?;
        if was_valid {
            self.write_state(dst, EntryState::Valid)?;
        }
        self.patch_handles(src, dst);
        debug!(
            target: "mmrofs::alloc",
            event = "entry_relocated",
            from = src.0,
            to = dst.0
        );
        Ok(())
    }

    /// Erase every header page whose slots are all TOMBSTONE/ERASED (or
    /// dirty-FREE). No entry moves, so this is safe to run from inside a
    /// transaction flow that still holds slot indices.
    pub(crate) fn reclaim_dead_pages(&mut self) -> Result<bool> {
        let mut reclaimed_any = false;
        for page in 0..HEADER_PAGES {
            if self.page_census(page)?.erasable() {
                self.erase_header_page(page)?;
                reclaimed_any = true;
            }
        }
        if reclaimed_any {
            self.next_free_entry = rebuild_next_free(self.dev.as_ref(), self.max_entries)?;
        }
        Ok(reclaimed_any)
    }

    /// Reclaim header pages: erase fully-dead pages, then consolidate
    /// live entries off pages that are mostly dead so those pages become
    /// erasable too. Returns whether any page went back to FREE.
    ///
    /// Relocation retargets open handles via `patch_handles`; it must only
    /// run between operations (the public maintenance entry point), never
    /// from inside a flow that caches slot indices in locals.
    pub(crate) fn compact_entry_table(&mut self) -> Result<bool> {
        let mut reclaimed_any = self.reclaim_dead_pages()?;

        // Consolidation: bounded by the page count, every round erases one
        // page or stops.
        for _ in 0..HEADER_PAGES {
            let mut victim: Option<(u16, PageCensus)> = None;
            let mut free_total = 0_u16;
            let mut censuses = [PageCensus::default(); HEADER_PAGES as usize];
            for page in 0..HEADER_PAGES {
                let census = self.page_census(page)?;
                free_total += census.free;
                censuses[usize::from(page)] = census;
            }
            for page in 0..HEADER_PAGES {
                let census = censuses[usize::from(page)];
                if census.live == 0 || census.other > 0 || census.reclaimable == 0 {
                    continue;
                }
                if census.live > free_total - census.free {
                    continue;
                }
                if victim.map_or(true, |(_, best)| census.live < best.live) {
                    victim = Some((page, census));
                }
            }
            let Some((page, _)) = victim else { break };

            let first = page * ENTRIES_PER_PAGE;
            for index in first..first + ENTRIES_PER_PAGE {
                let slot = SlotIndex(index);
                let raw = self.read_raw_entry(slot)?;
                if !mmrofs_ondisk::state_byte_is_live(raw[0]) {
                    continue;
                }
                let Some(dst) = self.blank_slot_off_page(page)? else {
                    // Spare slots ran out mid-page; stop consolidating.
                    self.next_free_entry = rebuild_next_free(self.dev.as_ref(), self.max_entries)?;
                    return Ok(reclaimed_any);
                };
                self.relocate_entry_slot(slot, dst)?;
            }
            self.erase_header_page(page)?;
            reclaimed_any = true;
        }

        self.next_free_entry = rebuild_next_free(self.dev.as_ref(), self.max_entries)?;
        Ok(reclaimed_any)
    }

    /// Forward compaction of the data region: for each VALID entry in
    /// offset order, relocate it into the first earlier gap that fits its
    /// footprint, iterating to fixpoint. One 4 KiB scratch buffer does
    /// all the copying.
    pub(crate) fn defragment_data(&mut self) -> Result<usize> {
        let mut moved_total = 0_usize;
        'rounds: loop {
            let mut candidates = Vec::new();
            for index in 0..self.max_entries {
                let slot = SlotIndex(index);
                let entry = self.read_entry(slot)?;
                if entry.lifecycle() != Some(EntryState::Valid)
                    || entry.validate(self.partition_size, self.max_entries).is_err()
                    || self.slot_has_other_handles(slot, None)
                {
                    continue;
                }
                candidates.push((slot, entry));
            }
            candidates.sort_by_key(|(_, entry)| entry.offset);

            for (slot, entry) in candidates {
                let footprint = entry.alloc_footprint();
                let Some(gap) = find_gap_before(
                    self.dev.as_ref(),
                    self.max_entries,
                    footprint,
                    entry.offset,
                    slot,
                )?
                else {
                    continue;
                };
                let prep = prepare_extent(self.dev.as_ref(), gap, footprint)?;
                self.window.invalidate();
                match prep {
                    ExtentPrep::Ready => {}
                    ExtentPrep::BadBlock { offset } => {
                        self.retire_bad_block(offset)?;
                        continue;
                    }
                }
                self.relocate_data(slot, &entry, gap)?;
                moved_total += 1;
                if moved_total > usize::from(self.max_entries) {
                    break 'rounds;
                }
                // Occupied ranges changed; rescan from the top.
                continue 'rounds;
            }
            break;
        }
        if moved_total > 0 {
            info!(
                target: "mmrofs::alloc",
                event = "data_defragmented",
                relocations = moved_total
            );
        }
        Ok(moved_total)
    }

    /// Full relocation of a VALID entry's content to `gap` via the
    /// TOMBSTONING_OLD flow.
    fn relocate_data(&mut self, src_slot: SlotIndex, entry: &Entry, gap: u32) -> Result<()> {
        let new_slot = self.create_entry(&NewEntrySpec {
            name_len: entry.name_len,
            name_hash: entry.name_hash,
            offset: gap,
            size: entry.size,
            mtime: entry.mtime,
            ctime: entry.ctime,
            old_entry: src_slot.to_entry_ref(),
            dst_entry: ENTRY_NONE,
        })?;
        if let Err(err) = self.copy_data(entry.offset, gap, u64::from(entry.size)) {
            self.rollback_new(new_slot);
            return Err(err);
        }
        self.tombstone_old_flow(new_slot, src_slot, None)?;
        self.write_state(new_slot, EntryState::Valid)?;
        self.patch_handles(src_slot, new_slot);
        debug!(
            target: "mmrofs::alloc",
            event = "data_relocated",
            slot = new_slot.0,
            from = entry.offset,
            to = gap
        );
        Ok(())
    }
}
