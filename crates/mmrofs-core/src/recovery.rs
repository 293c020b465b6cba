//! Boot-time recovery: the idempotent scan that returns every in-flight
//! transition to a terminal state before the first read or write.
//!
//! Recovery never propagates per-slot trouble; it tombstones and logs.
//! The single fatal condition is a header region that cannot be read at
//! all, which aborts the mount.

use crate::fs::Inner;
use mmrofs_error::Result;
use mmrofs_ondisk::{Entry, EntryState, slot_is_blank};
use mmrofs_types::{HEADER_REGION_SIZE, MTIME_UNSET, SlotIndex};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Counters from one recovery pass. A clean boot reports all-zero repair
/// counts; a second pass directly after a first is always all-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub scanned: u32,
    /// FREE slots with stray programmed bytes, downgraded to ERASED.
    pub dirty_free_downgraded: u32,
    /// ALLOCATING/PENDING_DATA leftovers tombstoned.
    pub incomplete_tombstoned: u32,
    /// TOMBSTONING_OLD transitions driven to completion.
    pub tombstoning_completed: u32,
    /// Entries that failed field validation.
    pub invalid_tombstoned: u32,
    /// Capacity masks resolved to exact sizes.
    pub sizes_finalized: u32,
    /// Torn size words rewritten from the inferred content end.
    pub sizes_repaired: u32,
    /// Unwritten mtimes stamped in place.
    pub mtimes_set: u32,
    /// Possibly-torn mtimes fixed via a copy through a new slot.
    pub mtime_reallocations: u32,
    /// State bytes matching none of the nine patterns, downgraded.
    pub unknown_states_downgraded: u32,
    /// Live entries after the pass.
    pub live_entries: u32,
}

impl Inner {
    /// Full recovery pass over the entry table.
    pub(crate) fn run_recovery(&mut self) -> Result<RecoveryReport> {
        self.probe_header()?;

        let mut report = RecoveryReport::default();
        for index in 0..self.max_entries {
            let slot = SlotIndex(index);
            report.scanned += 1;
            if let Err(err) = self.recover_slot(slot, &mut report) {
                error!(
                    target: "mmrofs::recovery",
                    event = "slot_recovery_failed",
                    slot = slot.0,
                    error = %err
                );
            }
        }

        for index in 0..self.max_entries {
            if self.read_entry(SlotIndex(index))?.is_live() {
                report.live_entries += 1;
            }
        }
        info!(
            target: "mmrofs::recovery",
            event = "recovery_done",
            live = report.live_entries,
            incomplete = report.incomplete_tombstoned,
            completed = report.tombstoning_completed,
            size_repairs = report.sizes_repaired,
            mtime_reallocations = report.mtime_reallocations
        );
        Ok(report)
    }

    /// Prove the header region readable. Failure here aborts the mount.
    fn probe_header(&mut self) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = (|| {
            let mut offset = 0_u32;
            while offset < HEADER_REGION_SIZE {
                self.dev.read(offset, &mut scratch)?;
                offset += u32::try_from(scratch.len()).expect("scratch is one erase block");
            }
            Ok(())
        })();
        self.scratch = scratch;
        result
    }

    fn recover_slot(&mut self, slot: SlotIndex, report: &mut RecoveryReport) -> Result<()> {
        let raw = self.read_raw_entry(slot)?;
        let entry = Entry::decode(&raw);

        match EntryState::from_byte(entry.state) {
            Some(EntryState::Free) => {
                if !slot_is_blank(&raw) {
                    warn!(
                        target: "mmrofs::recovery",
                        event = "dirty_free_downgraded",
                        slot = slot.0
                    );
                    self.write_state(slot, EntryState::Erased)?;
                    report.dirty_free_downgraded += 1;
                }
            }

            Some(EntryState::Allocating | EntryState::PendingData) => {
                warn!(
                    target: "mmrofs::recovery",
                    event = "incomplete_entry_tombstoned",
                    slot = slot.0,
                    state = entry.state
                );
                self.write_state(slot, EntryState::Tombstone)?;
                report.incomplete_tombstoned += 1;
            }

            Some(EntryState::TombstoningOld) => {
                if entry.validate(self.partition_size, self.max_entries).is_err() {
                    self.write_state(slot, EntryState::Tombstone)?;
                    report.invalid_tombstoned += 1;
                    return Ok(());
                }
                info!(
                    target: "mmrofs::recovery",
                    event = "completing_tombstoning_old",
                    slot = slot.0
                );
                if let Some(old) = entry.old_slot(self.max_entries) {
                    if self.read_entry(old)?.is_live() {
                        self.write_state(old, EntryState::Tombstone)?;
                    }
                }
                if let Some(dst) = entry.dst_slot(self.max_entries) {
                    if self.read_entry(dst)?.is_live() {
                        self.write_state(dst, EntryState::Tombstone)?;
                    }
                }
                self.write_state(slot, EntryState::Active)?;
                report.tombstoning_completed += 1;
                let entry = self.read_entry(slot)?;
                self.recover_active(slot, entry, report)?;
            }

            Some(EntryState::Active) => {
                if entry.validate(self.partition_size, self.max_entries).is_err() {
                    self.write_state(slot, EntryState::Tombstone)?;
                    report.invalid_tombstoned += 1;
                    return Ok(());
                }
                self.recover_active(slot, entry, report)?;
            }

            Some(EntryState::Valid) => {
                if entry.validate(self.partition_size, self.max_entries).is_err() {
                    warn!(
                        target: "mmrofs::recovery",
                        event = "invalid_valid_tombstoned",
                        slot = slot.0
                    );
                    self.write_state(slot, EntryState::Tombstone)?;
                    report.invalid_tombstoned += 1;
                }
            }

            Some(EntryState::Tombstone | EntryState::BadBlock | EntryState::Erased) => {}

            None => {
                warn!(
                    target: "mmrofs::recovery",
                    event = "unknown_state_downgraded",
                    slot = slot.0,
                    state = entry.state
                );
                self.write_state(slot, EntryState::Erased)?;
                report.unknown_states_downgraded += 1;
            }
        }
        Ok(())
    }

    /// Size and mtime recovery for a validated ACTIVE entry, promoting to
    /// VALID when the result is trustworthy.
    fn recover_active(
        &mut self,
        slot: SlotIndex,
        mut entry: Entry,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let inferred = self.infer_size(&entry)?;

        if entry.has_capacity_mask() {
            if inferred != entry.size {
                self.write_size_field(slot, inferred)?;
                entry.size = inferred;
                report.sizes_finalized += 1;
            }
        } else if inferred < entry.size && entry.size - inferred > 2 {
            // Likely torn size word. Content legitimately ending in three
            // or more 0xFF bytes is truncated here; accepted trade-off.
            warn!(
                target: "mmrofs::recovery",
                event = "size_repaired",
                slot = slot.0,
                stored = entry.size,
                inferred = inferred
            );
            self.write_size_field(slot, inferred)?;
            entry.size = inferred;
            report.sizes_repaired += 1;
        }

        if entry.mtime == MTIME_UNSET {
            // Never programmed: safe to stamp in place.
            let now = self.now();
            self.write_mtime_field(slot, now)?;
            self.write_state(slot, EntryState::Valid)?;
            report.mtimes_set += 1;
            return Ok(());
        }

        // The word could be correct or torn, and a torn word cannot be
        // repaired in place (the true time may need bits it has already
        // cleared). Copy the metadata through a new slot aliasing the same
        // data offset.
        let Some(new_slot) = mmrofs_alloc::alloc_slot(
            self.dev.as_ref(),
            self.max_entries,
            &mut self.next_free_entry,
        )?
        else {
            warn!(
                target: "mmrofs::recovery",
                event = "mtime_reallocation_skipped",
                slot = slot.0,
                reason = "no free slots"
            );
            return Ok(());
        };

        let now = self.now();
        let replacement = Entry {
            state: EntryState::Allocating as u8,
            name_len: entry.name_len,
            name_hash: entry.name_hash,
            offset: entry.offset,
            size: entry.size,
            mtime: now,
            ctime: entry.ctime,
            old_entry: slot.to_entry_ref(),
            dst_entry: mmrofs_types::ENTRY_NONE,
        };
        self.write_state(new_slot, EntryState::Allocating)?;
        self.write_entry_tail(new_slot, &replacement)?;
        self.write_state(new_slot, EntryState::PendingData)?;
        self.write_state(new_slot, EntryState::TombstoningOld)?;
        self.write_state(slot, EntryState::Tombstone)?;
        self.write_state(new_slot, EntryState::Active)?;
        // The mtime was written by this boot; trust it.
        self.write_state(new_slot, EntryState::Valid)?;
        info!(
            target: "mmrofs::recovery",
            event = "mtime_reallocated",
            from = slot.0,
            to = new_slot.0
        );
        report.mtime_reallocations += 1;
        Ok(())
    }

    /// Scan the entry's footprint backwards for the last programmed byte.
    /// Returns the inferred on-flash size, never below `name_len`.
    fn infer_size(&mut self, entry: &Entry) -> Result<u32> {
        let floor = u64::from(entry.offset) + u64::from(entry.name_len);
        let mut pos = u64::from(entry.offset) + entry.alloc_footprint();
        let mut buf = [0_u8; 64];

        while pos > floor {
            let chunk_start = pos.saturating_sub(buf.len() as u64).max(floor);
            let chunk = usize::try_from(pos - chunk_start).expect("chunk bounded by buffer");
            let chunk_start32 = u32::try_from(chunk_start).expect("validated footprint fits u32");
            self.data_read(chunk_start32, &mut buf[..chunk])?;
            if let Some(rel) = buf[..chunk].iter().rposition(|b| *b != 0xFF) {
                let last_non_ff = chunk_start + rel as u64;
                let inferred = last_non_ff - u64::from(entry.offset) + 1;
                return Ok(u32::try_from(inferred).expect("inferred within footprint"));
            }
            pos = chunk_start;
        }
        Ok(u32::from(entry.name_len))
    }
}
