//! Transaction flows: every mutation is an ordered program sequence whose
//! every prefix is recoverable.
//!
//! Flow skeleton for anything that publishes a new entry:
//! ALLOCATING reserves the slot, the other 31 metadata bytes follow,
//! PENDING_DATA covers the data-region writes, and the entry becomes
//! visible only at the ACTIVE program. Replacements interpose
//! TOMBSTONING_OLD so that a crash deterministically finishes the
//! tombstones of the predecessors.

use crate::fs::Inner;
use crate::handle::{Fd, HandleKind};
use mmrofs_alloc::{ExtentPrep, alloc_slot, find_free_extent, prepare_extent};
use mmrofs_error::{MmrofsError, Result};
use mmrofs_ondisk::{Entry, EntryState};
use mmrofs_types::{
    CAPACITY_MASK_BITS, ENTRY_NONE, ERASE_BLOCK_SIZE, MAX_PARTITION_SIZE, MTIME_UNSET, SlotIndex,
    align_up_4k,
};
use tracing::{debug, warn};

pub(crate) struct NewEntrySpec {
    pub name_len: u16,
    pub name_hash: u32,
    pub offset: u32,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub old_entry: u32,
    pub dst_entry: u32,
}

fn guarded_total(parts: &[u64]) -> Result<u64> {
    let total: u64 = parts.iter().sum();
    // Headroom for a capacity mask one block above an exact-multiple total.
    if total + u64::from(ERASE_BLOCK_SIZE) > MAX_PARTITION_SIZE {
        return Err(MmrofsError::NoSpace);
    }
    Ok(total)
}

/// Streaming capacity mask covering `total`: low 12 bits all set and never
/// numerically below `total`, so the exact size programmed at close can
/// only clear bits. An exact-multiple total costs one block of headroom.
#[allow(clippy::cast_possible_truncation)] // guarded_total keeps values below 2^32
fn capacity_mask_for(total: u64) -> u32 {
    (total | u64::from(CAPACITY_MASK_BITS)) as u32
}

/// Allocation footprint reserved by `capacity_mask_for(total)`.
fn mask_alloc(total: u64) -> u64 {
    (total | u64::from(CAPACITY_MASK_BITS)) + 1
}

// ── Entry-level building blocks ─────────────────────────────────────────────

impl Inner {
    /// Claim a FREE slot. On exhaustion, erase fully-dead header pages and
    /// retry once. The relocating consolidation pass is not run here: a
    /// flow in progress holds slot indices in locals that a relocation
    /// would invalidate.
    pub(crate) fn alloc_entry_slot(&mut self) -> Result<SlotIndex> {
        if let Some(slot) =
            alloc_slot(self.dev.as_ref(), self.max_entries, &mut self.next_free_entry)?
        {
            return Ok(slot);
        }
        if self.reclaim_dead_pages()? {
            if let Some(slot) =
                alloc_slot(self.dev.as_ref(), self.max_entries, &mut self.next_free_entry)?
            {
                return Ok(slot);
            }
        }
        Err(MmrofsError::NoSpace)
    }

    /// ALLOCATING → metadata tail → PENDING_DATA. Rolls the slot back to
    /// TOMBSTONE on any intermediate failure.
    pub(crate) fn create_entry(&mut self, spec: &NewEntrySpec) -> Result<SlotIndex> {
        let slot = self.alloc_entry_slot()?;
        if let Err(err) = self.write_state(slot, EntryState::Allocating) {
            self.rollback_new(slot);
            return Err(err);
        }
        let entry = Entry {
            state: EntryState::Allocating as u8,
            name_len: spec.name_len,
            name_hash: spec.name_hash,
            offset: spec.offset,
            size: spec.size,
            mtime: spec.mtime,
            ctime: spec.ctime,
            old_entry: spec.old_entry,
            dst_entry: spec.dst_entry,
        };
        if let Err(err) = self.write_entry_tail(slot, &entry) {
            self.rollback_new(slot);
            return Err(err);
        }
        if let Err(err) = self.write_state(slot, EntryState::PendingData) {
            self.rollback_new(slot);
            return Err(err);
        }
        Ok(slot)
    }

    /// Best-effort TOMBSTONE over an in-flight entry after a failed flow.
    /// If this program fails too, recovery finishes the job at next mount.
    pub(crate) fn rollback_new(&mut self, slot: SlotIndex) {
        warn!(target: "mmrofs::txn", event = "rollback", slot = slot.0);
        if let Err(err) = self.write_state(slot, EntryState::Tombstone) {
            warn!(
                target: "mmrofs::txn",
                event = "rollback_failed",
                slot = slot.0,
                error = %err
            );
        }
    }

    /// PENDING_DATA → TOMBSTONING_OLD → tombstone predecessors → ACTIVE.
    ///
    /// From TOMBSTONING_OLD onward a failure must NOT tombstone the new
    /// entry (its predecessors may already be dead); recovery completes
    /// the transition instead.
    pub(crate) fn tombstone_old_flow(
        &mut self,
        new_slot: SlotIndex,
        old_slot: SlotIndex,
        dst_slot: Option<SlotIndex>,
    ) -> Result<()> {
        self.write_state(new_slot, EntryState::TombstoningOld)?;
        self.write_state(old_slot, EntryState::Tombstone)?;
        if let Some(dst) = dst_slot {
            self.write_state(dst, EntryState::Tombstone)?;
        }
        self.write_state(new_slot, EntryState::Active)
    }

    /// Permanently shadow a data block that failed erase verification.
    /// The synthetic entry writes its fields first and commits with the
    /// BADBLOCK state byte, so a crash mid-way leaves only a downgradable
    /// dirty FREE slot.
    pub(crate) fn retire_bad_block(&mut self, block: u32) -> Result<()> {
        warn!(target: "mmrofs::txn", event = "retire_bad_block", offset = block);
        let slot = self.alloc_entry_slot()?;
        let entry = Entry {
            state: EntryState::BadBlock as u8,
            name_len: 0,
            name_hash: 0,
            offset: block,
            size: ERASE_BLOCK_SIZE,
            mtime: 0,
            ctime: 0,
            old_entry: ENTRY_NONE,
            dst_entry: ENTRY_NONE,
        };
        self.write_entry_tail(slot, &entry)?;
        self.write_state(slot, EntryState::BadBlock)
    }

    /// Find and prove a free extent for `needed` bytes, retiring bad
    /// blocks until one verifies or space runs out.
    pub(crate) fn alloc_data_extent(&mut self, needed: u64) -> Result<u32> {
        loop {
            let offset = find_free_extent(
                self.dev.as_ref(),
                self.max_entries,
                self.partition_size,
                needed,
            )?;
            let prep = prepare_extent(self.dev.as_ref(), offset, needed)?;
            self.window.invalidate();
            match prep {
                ExtentPrep::Ready => return Ok(offset),
                ExtentPrep::BadBlock { offset: bad } => self.retire_bad_block(bad)?,
            }
        }
    }

    /// Whether `[offset + old_alloc, offset + new_alloc)` can be annexed
    /// for an in-place append: inside the partition, claimed by no entry,
    /// and provably erased (tombstoned remains get erased here).
    fn extend_region_usable(
        &mut self,
        offset: u32,
        old_alloc: u64,
        new_alloc: u64,
    ) -> Result<bool> {
        if new_alloc <= old_alloc {
            return Ok(true);
        }
        let extra_start = u64::from(offset) + old_alloc;
        let extra_end = u64::from(offset) + new_alloc;
        if extra_end > self.partition_size {
            return Ok(false);
        }
        let ranges = mmrofs_alloc::collect_occupied(self.dev.as_ref(), self.max_entries, None)?;
        if ranges
            .iter()
            .any(|r| u64::from(r.start) < extra_end && r.end > extra_start)
        {
            return Ok(false);
        }
        let extra_start = u32::try_from(extra_start)
            .map_err(|_| MmrofsError::InvalidArgument("append region beyond u32 offsets"))?;
        let prep = prepare_extent(
            self.dev.as_ref(),
            extra_start,
            extra_end - u64::from(extra_start),
        )?;
        self.window.invalidate();
        match prep {
            ExtentPrep::Ready => Ok(true),
            ExtentPrep::BadBlock { offset: bad } => {
                self.retire_bad_block(bad)?;
                Ok(false)
            }
        }
    }

    /// Point a handle at its committed entry. Done the moment a flow
    /// publishes the entry, so a later failure cannot leave the handle on
    /// a tombstoned slot.
    fn set_committed(&mut self, fd: Fd, slot: SlotIndex, flash_offset: u32, data_size: u32) {
        if let Some(handle) = self.fds.get_mut(fd.0).and_then(Option::as_mut) {
            handle.kind = HandleKind::Committed {
                slot,
                flash_offset,
                data_size,
            };
        }
    }
}

// ── Write flows ─────────────────────────────────────────────────────────────

impl Inner {
    /// First write on a brand-new file: streaming allocation under a
    /// capacity mask, finalized at close.
    pub(crate) fn first_write_new(
        &mut self,
        fd: Fd,
        name: &[u8],
        hash: u32,
        data: &[u8],
    ) -> Result<()> {
        let total = guarded_total(&[name.len() as u64, data.len() as u64])?;
        let offset = self.alloc_data_extent(mask_alloc(total))?;
        let now = self.now();
        let slot = self.create_entry(&NewEntrySpec {
            name_len: name.len() as u16,
            name_hash: hash,
            offset,
            size: capacity_mask_for(total),
            mtime: MTIME_UNSET,
            ctime: now,
            old_entry: ENTRY_NONE,
            dst_entry: ENTRY_NONE,
        })?;

        if let Err(err) = self
            .program(offset, name)
            .and_then(|()| self.program(offset + name.len() as u32, data))
        {
            self.rollback_new(slot);
            return Err(err);
        }
        if let Err(err) = self.write_state(slot, EntryState::Active) {
            self.rollback_new(slot);
            return Err(err);
        }
        self.set_committed(fd, slot, offset, data.len() as u32);
        debug!(
            target: "mmrofs::txn",
            event = "new_file_committed",
            slot = slot.0,
            offset = offset
        );
        Ok(())
    }

    /// First write through an update handle: append in place when the
    /// blocks after the current allocation are annexable, otherwise a
    /// full rewrite at a fresh extent.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn first_write_update(
        &mut self,
        fd: Fd,
        name: &[u8],
        hash: u32,
        old_slot: SlotIndex,
        old_offset: u32,
        old_data_size: u32,
        old_ctime: u32,
        data: &[u8],
    ) -> Result<()> {
        let old_alloc = self.read_entry(old_slot)?.alloc_footprint();
        let new_total = guarded_total(&[
            name.len() as u64,
            u64::from(old_data_size),
            data.len() as u64,
        ])?;
        let new_alloc = mask_alloc(new_total);
        let new_data_size = old_data_size + data.len() as u32;

        // Appending lands right after the exact content; a crashed earlier
        // append may have left stray programmed bytes inside the footprint
        // tail, which cannot be re-programmed. Rewrite in that case.
        let data_end = u64::from(old_offset) + name.len() as u64 + u64::from(old_data_size);
        let tail_len = (u64::from(old_offset) + old_alloc).saturating_sub(data_end);
        let tail_clean = tail_len == 0
            || mmrofs_flash::range_is_erased(
                self.dev.as_ref(),
                u32::try_from(data_end)
                    .map_err(|_| MmrofsError::InvalidArgument("content end beyond u32 offsets"))?,
                tail_len,
            )?;

        if tail_clean && self.extend_region_usable(old_offset, old_alloc, new_alloc)? {
            // Append: the prior content stays in place, only the new bytes
            // are programmed.
            let slot = self.create_entry(&NewEntrySpec {
                name_len: name.len() as u16,
                name_hash: hash,
                offset: old_offset,
                size: capacity_mask_for(new_total),
                mtime: MTIME_UNSET,
                ctime: old_ctime,
                old_entry: old_slot.to_entry_ref(),
                dst_entry: ENTRY_NONE,
            })?;
            let write_pos = old_offset + name.len() as u32 + old_data_size;
            if let Err(err) = self.program(write_pos, data) {
                self.rollback_new(slot);
                return Err(err);
            }
            self.tombstone_old_flow(slot, old_slot, None)?;
            self.set_committed(fd, slot, old_offset, new_data_size);
            debug!(target: "mmrofs::txn", event = "append_committed", slot = slot.0);
            return Ok(());
        }

        // Rewrite: copy the prior content to a fresh extent, new bytes last.
        let new_offset = self.alloc_data_extent(new_alloc)?;
        let slot = self.create_entry(&NewEntrySpec {
            name_len: name.len() as u16,
            name_hash: hash,
            offset: new_offset,
            size: capacity_mask_for(new_total),
            mtime: MTIME_UNSET,
            ctime: old_ctime,
            old_entry: old_slot.to_entry_ref(),
            dst_entry: ENTRY_NONE,
        })?;
        let result = self
            .program(new_offset, name)
            .and_then(|()| {
                self.copy_data(
                    old_offset + name.len() as u32,
                    new_offset + name.len() as u32,
                    u64::from(old_data_size),
                )
            })
            .and_then(|()| self.program(new_offset + name.len() as u32 + old_data_size, data));
        if let Err(err) = result {
            self.rollback_new(slot);
            return Err(err);
        }
        self.tombstone_old_flow(slot, old_slot, None)?;
        self.set_committed(fd, slot, new_offset, new_data_size);
        debug!(target: "mmrofs::txn", event = "rewrite_committed", slot = slot.0);
        Ok(())
    }

    /// Write through an already-committed handle: extend within the
    /// current footprint, else streaming expansion (in place when the
    /// following blocks are annexable, else a rewrite).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn subsequent_write(
        &mut self,
        fd: Fd,
        name: &[u8],
        hash: u32,
        slot: SlotIndex,
        flash_offset: u32,
        data_size: u32,
        data: &[u8],
    ) -> Result<()> {
        let current = self.read_entry(slot)?;
        let cur_alloc = current.alloc_footprint();
        let new_total = guarded_total(&[
            name.len() as u64,
            u64::from(data_size),
            data.len() as u64,
        ])?;
        let new_data_size = data_size + data.len() as u32;

        if new_total <= cur_alloc {
            let pos = flash_offset + name.len() as u32 + data_size;
            self.program(pos, data)?;
            self.set_committed(fd, slot, flash_offset, new_data_size);
            return Ok(());
        }

        #[allow(clippy::cast_possible_truncation)] // guarded_total keeps new_total below 2^32
        let new_capacity = (new_total as u32) | CAPACITY_MASK_BITS;
        let new_alloc = u64::from(new_capacity) + 1;
        if new_alloc >= MAX_PARTITION_SIZE {
            return Err(MmrofsError::NoSpace);
        }

        if self.extend_region_usable(flash_offset, cur_alloc, new_alloc)? {
            // In-place expansion. The appended bytes are programmed only
            // after the widened entry is ACTIVE: a crash before then must
            // not let the old (narrower) entry infer the new bytes as
            // content.
            let new_slot = self.create_entry(&NewEntrySpec {
                name_len: name.len() as u16,
                name_hash: hash,
                offset: flash_offset,
                size: new_capacity,
                mtime: MTIME_UNSET,
                ctime: current.ctime,
                old_entry: slot.to_entry_ref(),
                dst_entry: ENTRY_NONE,
            })?;
            self.tombstone_old_flow(new_slot, slot, None)?;
            self.set_committed(fd, new_slot, flash_offset, data_size);
            let pos = flash_offset + name.len() as u32 + data_size;
            self.program(pos, data)?;
            self.set_committed(fd, new_slot, flash_offset, new_data_size);
            debug!(target: "mmrofs::txn", event = "stream_expanded", slot = new_slot.0);
            return Ok(());
        }

        // Rewrite to a fresh extent carrying the content written so far.
        let new_offset = self.alloc_data_extent(new_alloc)?;
        let new_slot = self.create_entry(&NewEntrySpec {
            name_len: name.len() as u16,
            name_hash: hash,
            offset: new_offset,
            size: new_capacity,
            mtime: MTIME_UNSET,
            ctime: current.ctime,
            old_entry: slot.to_entry_ref(),
            dst_entry: ENTRY_NONE,
        })?;
        let result = self.program(new_offset, name).and_then(|()| {
            self.copy_data(
                flash_offset + name.len() as u32,
                new_offset + name.len() as u32,
                u64::from(data_size),
            )
        });
        if let Err(err) = result {
            self.rollback_new(new_slot);
            return Err(err);
        }
        self.tombstone_old_flow(new_slot, slot, None)?;
        self.set_committed(fd, new_slot, new_offset, data_size);
        self.program(new_offset + name.len() as u32 + data_size, data)?;
        self.set_committed(fd, new_slot, new_offset, new_data_size);
        debug!(target: "mmrofs::txn", event = "stream_relocated", slot = new_slot.0);
        Ok(())
    }

    /// Rename copies content under the destination name, then runs
    /// TOMBSTONING_OLD → tombstone src → tombstone dst → mtime → ACTIVE →
    /// VALID. A crash at or past TOMBSTONING_OLD completes both
    /// tombstones; earlier crashes leave the destination untouched.
    pub(crate) fn rename_flow(
        &mut self,
        src_slot: SlotIndex,
        src_entry: &Entry,
        dst_slot: Option<SlotIndex>,
        dst_name: &[u8],
        dst_hash: u32,
    ) -> Result<()> {
        if src_entry.has_capacity_mask() {
            return Err(MmrofsError::SizeUnavailable);
        }
        let src_data_size = src_entry.data_size();
        let new_total = guarded_total(&[dst_name.len() as u64, u64::from(src_data_size)])?;
        let new_offset = self.alloc_data_extent(align_up_4k(new_total))?;

        #[allow(clippy::cast_possible_truncation)] // guarded_total keeps new_total below 2^32
        let exact_size = new_total as u32;
        let new_slot = self.create_entry(&NewEntrySpec {
            name_len: dst_name.len() as u16,
            name_hash: dst_hash,
            offset: new_offset,
            size: exact_size,
            mtime: MTIME_UNSET,
            ctime: src_entry.ctime,
            old_entry: src_slot.to_entry_ref(),
            dst_entry: dst_slot.map_or(ENTRY_NONE, SlotIndex::to_entry_ref),
        })?;

        let result = self.program(new_offset, dst_name).and_then(|()| {
            self.copy_data(
                src_entry.offset + u32::from(src_entry.name_len),
                new_offset + dst_name.len() as u32,
                u64::from(src_data_size),
            )
        });
        if let Err(err) = result {
            self.rollback_new(new_slot);
            return Err(err);
        }

        self.write_state(new_slot, EntryState::TombstoningOld)?;
        self.write_state(src_slot, EntryState::Tombstone)?;
        if let Some(dst) = dst_slot {
            self.write_state(dst, EntryState::Tombstone)?;
        }
        let now = self.now();
        self.write_mtime_field(new_slot, now)?;
        self.write_state(new_slot, EntryState::Active)?;
        self.write_state(new_slot, EntryState::Valid)?;
        debug!(
            target: "mmrofs::txn",
            event = "renamed",
            src = src_slot.0,
            dst = new_slot.0
        );
        Ok(())
    }

    /// One-shot create with the total size known up front: the exact size
    /// word goes to flash at allocation time, no capacity mask involved.
    pub(crate) fn create_known_size(&mut self, name: &[u8], hash: u32, data: &[u8]) -> Result<()> {
        let existing = self.lookup(name, hash)?;
        if let Some((slot, _)) = existing {
            if self.slot_has_other_handles(slot, None) {
                return Err(MmrofsError::Busy);
            }
        }

        let total = guarded_total(&[name.len() as u64, data.len() as u64])?;
        let offset = self.alloc_data_extent(align_up_4k(total))?;
        let now = self.now();
        let (old_entry, old_slot, ctime) = match &existing {
            Some((slot, entry)) => (slot.to_entry_ref(), Some(*slot), entry.ctime),
            None => (ENTRY_NONE, None, now),
        };

        #[allow(clippy::cast_possible_truncation)] // guarded_total keeps total below 2^32
        let exact_size = total as u32;
        let slot = self.create_entry(&NewEntrySpec {
            name_len: name.len() as u16,
            name_hash: hash,
            offset,
            size: exact_size,
            mtime: MTIME_UNSET,
            ctime,
            old_entry,
            dst_entry: ENTRY_NONE,
        })?;

        let mut result = self.program(offset, name);
        if result.is_ok() && !data.is_empty() {
            result = self.program(offset + name.len() as u32, data);
        }
        if let Err(err) = result {
            self.rollback_new(slot);
            return Err(err);
        }

        match old_slot {
            Some(old) => self.tombstone_old_flow(slot, old, None)?,
            None => self.write_state(slot, EntryState::Active)?,
        }
        self.write_mtime_field(slot, now)?;
        self.write_state(slot, EntryState::Valid)?;
        debug!(
            target: "mmrofs::txn",
            event = "created",
            slot = slot.0,
            size = exact_size
        );
        Ok(())
    }
}
