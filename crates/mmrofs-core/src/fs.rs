//! Mount surface, handle tables, and the POSIX-shaped operations.

use crate::clock::Clock;
use crate::dir::{DirEntry, DirFd, DirSlot, MAX_DIR_HANDLES};
use crate::handle::{Fd, FileHandle, HandleKind, OpenMode};
use crate::recovery::RecoveryReport;
use mmrofs_error::{MmrofsError, Result};
use mmrofs_flash::{NorFlash, SlidingWindow};
use mmrofs_ondisk::{Entry, EntryState, FIELD_MTIME, FIELD_SIZE};
use mmrofs_types::{
    CLOCK_PLAUSIBLE_MIN, DATA_REGION_START, ENTRY_SIZE, ERASE_BLOCK_SIZE, MAX_ENTRIES,
    MAX_FILENAME_LEN, MAX_PARTITION_SIZE, MIN_PARTITION_SIZE, MTIME_UNSET, SlotIndex, fnv1a32,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Mount-time configuration. The partition itself and the clock are passed
/// as capabilities; any VFS mount prefix is the adapter's business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Size of the file-descriptor table, allocated once at mount.
    pub max_open_files: usize,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self { max_open_files: 8 }
    }
}

/// `stat`/`fstat` result. Files are always regular and read-only to
/// external observers; mutation goes through the transaction flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// A mounted filesystem. The only way to reach the core; there are no
/// process-wide singletons.
pub struct Mmrofs {
    inner: Mutex<Inner>,
}

pub(crate) struct Inner {
    pub(crate) dev: Arc<dyn NorFlash>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) partition_size: u64,
    pub(crate) max_entries: u16,
    pub(crate) next_free_entry: u16,
    pub(crate) fds: Vec<Option<FileHandle>>,
    pub(crate) dirs: [DirSlot; MAX_DIR_HANDLES],
    pub(crate) window: SlidingWindow,
    pub(crate) scratch: Vec<u8>,
}

// ── Low-level flash access ──────────────────────────────────────────────────

impl Inner {
    pub(crate) fn now(&self) -> u32 {
        self.clock.now_unix()
    }

    pub(crate) fn read_raw_entry(&self, slot: SlotIndex) -> Result<[u8; ENTRY_SIZE]> {
        let mut raw = [0_u8; ENTRY_SIZE];
        self.dev.read(slot.flash_offset(), &mut raw)?;
        Ok(raw)
    }

    pub(crate) fn read_entry(&self, slot: SlotIndex) -> Result<Entry> {
        Ok(Entry::decode(&self.read_raw_entry(slot)?))
    }

    /// Program with window hygiene: any touch of the data region drops the
    /// cached read span, even on a failed (possibly torn) program.
    pub(crate) fn program(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let result = self.dev.program(offset, bytes);
        if u64::from(offset) + bytes.len() as u64 > u64::from(DATA_REGION_START) {
            self.window.invalidate();
        }
        result
    }

    pub(crate) fn write_state(&mut self, slot: SlotIndex, state: EntryState) -> Result<()> {
        self.program(slot.flash_offset(), &[state as u8])
    }

    pub(crate) fn write_entry_tail(&mut self, slot: SlotIndex, entry: &Entry) -> Result<()> {
        let image = entry.encode();
        self.program(slot.flash_offset() + 1, &image[1..])
    }

    pub(crate) fn write_size_field(&mut self, slot: SlotIndex, size: u32) -> Result<()> {
        self.program(slot.flash_offset() + FIELD_SIZE, &size.to_le_bytes())
    }

    pub(crate) fn write_mtime_field(&mut self, slot: SlotIndex, mtime: u32) -> Result<()> {
        self.program(slot.flash_offset() + FIELD_MTIME, &mtime.to_le_bytes())
    }

    pub(crate) fn data_read(&mut self, offset: u32, out: &mut [u8]) -> Result<()> {
        let Inner { dev, window, .. } = self;
        window.read(dev.as_ref(), offset, out)
    }

    /// Chunked copy within the data region through the single scratch
    /// buffer.
    pub(crate) fn copy_data(&mut self, src: u32, dst: u32, len: u64) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = (|| {
            let mut copied = 0_u64;
            while copied < len {
                let chunk = usize::try_from((len - copied).min(scratch.len() as u64))
                    .map_err(|_| MmrofsError::InvalidArgument("copy chunk overflow"))?;
                let src_pos = u32::try_from(u64::from(src) + copied)
                    .map_err(|_| MmrofsError::InvalidArgument("copy source overflow"))?;
                let dst_pos = u32::try_from(u64::from(dst) + copied)
                    .map_err(|_| MmrofsError::InvalidArgument("copy target overflow"))?;
                self.data_read(src_pos, &mut scratch[..chunk])?;
                self.program(dst_pos, &scratch[..chunk])?;
                copied += chunk as u64;
            }
            Ok(())
        })();
        self.scratch = scratch;
        result
    }
}

// ── Lookup and handle bookkeeping ───────────────────────────────────────────

impl Inner {
    /// Linear scan for a live entry with this exact filename.
    ///
    /// Hash and length prefilter first; candidates must validate before
    /// their data offset is dereferenced for the final name compare, and a
    /// candidate that fails validation is tombstoned on the spot.
    pub(crate) fn lookup(&mut self, name: &[u8], hash: u32) -> Result<Option<(SlotIndex, Entry)>> {
        for index in 0..self.max_entries {
            let slot = SlotIndex(index);
            let entry = self.read_entry(slot)?;
            if !entry.is_live()
                || entry.name_hash != hash
                || usize::from(entry.name_len) != name.len()
            {
                continue;
            }
            if let Err(fault) = entry.validate(self.partition_size, self.max_entries) {
                warn!(
                    target: "mmrofs::fs",
                    event = "lookup_tombstoned_invalid",
                    slot = slot.0,
                    fault = %fault
                );
                self.write_state(slot, EntryState::Tombstone)?;
                continue;
            }
            let mut stored = [0_u8; MAX_FILENAME_LEN];
            let stored = &mut stored[..name.len()];
            self.data_read(entry.offset, stored)?;
            if stored == name {
                return Ok(Some((slot, entry)));
            }
        }
        Ok(None)
    }

    pub(crate) fn fd_ref(&self, fd: Fd) -> Result<&FileHandle> {
        self.fds
            .get(fd.0)
            .and_then(Option::as_ref)
            .ok_or(MmrofsError::BadHandle)
    }

    pub(crate) fn fd_mut(&mut self, fd: Fd) -> Result<&mut FileHandle> {
        self.fds
            .get_mut(fd.0)
            .and_then(Option::as_mut)
            .ok_or(MmrofsError::BadHandle)
    }

    /// Whether any handle other than `exclude` pins `slot`. Live entries
    /// must not tombstone while a handle still resolves to their data.
    pub(crate) fn slot_has_other_handles(&self, slot: SlotIndex, exclude: Option<Fd>) -> bool {
        self.fds.iter().enumerate().any(|(index, handle)| {
            if exclude == Some(Fd(index)) {
                return false;
            }
            handle
                .as_ref()
                .is_some_and(|h| h.referenced_slot() == Some(slot))
        })
    }

    pub(crate) fn patch_handles(&mut self, from: SlotIndex, to: SlotIndex) {
        for handle in self.fds.iter_mut().flatten() {
            handle.retarget_slot(from, to);
        }
    }
}

// ── Clock bootstrap ─────────────────────────────────────────────────────────

impl Inner {
    /// Seed an implausible host clock from the newest live timestamp.
    fn bootstrap_clock(&mut self) -> Result<()> {
        if self.clock.now_unix() >= CLOCK_PLAUSIBLE_MIN {
            return Ok(());
        }
        let mut newest = 0_u32;
        for index in 0..self.max_entries {
            let entry = self.read_entry(SlotIndex(index))?;
            if !entry.is_live() {
                continue;
            }
            if entry.mtime != MTIME_UNSET {
                newest = newest.max(entry.mtime);
            }
            newest = newest.max(entry.ctime);
        }
        if newest > 0 {
            info!(
                target: "mmrofs::fs",
                event = "clock_bootstrap",
                seeded_to = newest
            );
            self.clock.set_unix(newest);
        }
        Ok(())
    }
}

// ── Path helpers ────────────────────────────────────────────────────────────

fn normalize_path(path: &str) -> Result<&[u8]> {
    let name = path.strip_prefix('/').unwrap_or(path).as_bytes();
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(MmrofsError::InvalidArgument("filename length outside 1..=255"));
    }
    Ok(name)
}

// ── Public operations ───────────────────────────────────────────────────────

impl Mmrofs {
    /// Mount the partition: validate geometry, bootstrap the clock, run
    /// recovery, and rebuild the free-slot hint. Header unreadability is
    /// the only fatal condition; everything recovery meets is repaired in
    /// place.
    pub fn mount(
        dev: Arc<dyn NorFlash>,
        config: MountConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, RecoveryReport)> {
        let partition_size = dev.size();
        if partition_size < MIN_PARTITION_SIZE {
            return Err(MmrofsError::Format(format!(
                "partition of {partition_size} bytes is below the {MIN_PARTITION_SIZE}-byte minimum"
            )));
        }
        if partition_size > MAX_PARTITION_SIZE {
            return Err(MmrofsError::Format(format!(
                "partition of {partition_size} bytes exceeds the 4 GiB maximum"
            )));
        }
        if partition_size % u64::from(ERASE_BLOCK_SIZE) != 0 {
            return Err(MmrofsError::Format(format!(
                "partition of {partition_size} bytes is not a multiple of the 4 KiB erase block"
            )));
        }
        if config.max_open_files == 0 {
            return Err(MmrofsError::InvalidArgument("max_open_files must be >= 1"));
        }

        let mut inner = Inner {
            dev,
            clock,
            partition_size,
            max_entries: MAX_ENTRIES,
            next_free_entry: 0,
            fds: (0..config.max_open_files).map(|_| None).collect(),
            dirs: [DirSlot::default(); MAX_DIR_HANDLES],
            window: SlidingWindow::new(),
            scratch: vec![0_u8; ERASE_BLOCK_SIZE as usize],
        };

        inner.bootstrap_clock()?;
        let report = inner.run_recovery()?;
        inner.next_free_entry =
            mmrofs_alloc::rebuild_next_free(inner.dev.as_ref(), inner.max_entries)?;

        info!(
            target: "mmrofs::fs",
            event = "mounted",
            partition_size = partition_size,
            live_entries = report.live_entries,
            next_free_entry = inner.next_free_entry
        );
        Ok((
            Self {
                inner: Mutex::new(inner),
            },
            report,
        ))
    }

    /// Open a path. Write modes resolve against the current live entry;
    /// the first `write` on the returned handle chooses the flow.
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<Fd> {
        let name = normalize_path(path)?;
        let hash = fnv1a32(name);
        let mut inner = self.inner.lock();

        let existing = inner.lookup(name, hash)?;

        let kind = match (mode, existing) {
            (OpenMode::ReadOnly, None) => return Err(MmrofsError::NotFound(path.to_owned())),
            (OpenMode::ReadOnly, Some((slot, entry))) => {
                if entry.has_capacity_mask() {
                    return Err(MmrofsError::SizeUnavailable);
                }
                HandleKind::Read {
                    slot,
                    flash_offset: entry.offset,
                    data_size: entry.data_size(),
                }
            }
            (_, Some((slot, entry))) => {
                if inner.slot_has_other_handles(slot, None) {
                    return Err(MmrofsError::Busy);
                }
                HandleKind::PendingUpdate {
                    old_slot: slot,
                    old_offset: entry.offset,
                    old_data_size: (!entry.has_capacity_mask()).then(|| entry.data_size()),
                    old_ctime: entry.ctime,
                }
            }
            (_, None) => {
                if !mode.can_create() {
                    return Err(MmrofsError::NotFound(path.to_owned()));
                }
                HandleKind::PendingNew
            }
        };

        let index = inner
            .fds
            .iter()
            .position(Option::is_none)
            .ok_or(MmrofsError::NoFreeHandle)?;
        inner.fds[index] = Some(FileHandle {
            name: name.to_vec(),
            hash,
            mode,
            cursor: 0,
            kind,
        });
        Ok(Fd(index))
    }

    /// One-shot create with the size known up front: no capacity mask is
    /// ever on flash for this entry. Replaces an existing live file.
    pub fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        let name = normalize_path(path)?;
        let hash = fnv1a32(name);
        let mut inner = self.inner.lock();
        inner.create_known_size(name, hash, data)
    }

    /// Append `data` through a writable handle. The core never produces
    /// partial writes: on error nothing changed from the caller's view
    /// beyond a possibly tombstoned in-flight entry.
    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let handle = inner.fd_ref(fd)?;
        if !handle.mode.is_writable() {
            return Err(MmrofsError::ReadOnly);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let name = handle.name.clone();
        let hash = handle.hash;
        let kind = handle.kind.clone();

        match kind {
            HandleKind::Read { .. } => return Err(MmrofsError::ReadOnly),
            HandleKind::PendingNew => inner.first_write_new(fd, &name, hash, data)?,
            HandleKind::PendingUpdate {
                old_slot,
                old_offset,
                old_data_size,
                old_ctime,
            } => {
                let old_data_size = old_data_size.ok_or(MmrofsError::SizeUnavailable)?;
                inner.first_write_update(
                    fd,
                    &name,
                    hash,
                    old_slot,
                    old_offset,
                    old_data_size,
                    old_ctime,
                    data,
                )?;
            }
            HandleKind::Committed {
                slot,
                flash_offset,
                data_size,
            } => inner.subsequent_write(fd, &name, hash, slot, flash_offset, data_size, data)?,
        }
        Ok(data.len())
    }

    /// Read from the handle cursor. Returns 0 at end of file and for
    /// write handles that have not committed yet.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let handle = inner.fd_ref(fd)?;
        let (flash_offset, data_size, cursor, name_len) = match handle.kind {
            HandleKind::Read {
                flash_offset,
                data_size,
                ..
            }
            | HandleKind::Committed {
                flash_offset,
                data_size,
                ..
            } => (flash_offset, data_size, handle.cursor, handle.name.len()),
            HandleKind::PendingNew | HandleKind::PendingUpdate { .. } => return Ok(0),
        };

        if cursor >= data_size {
            return Ok(0);
        }
        let avail = (data_size - cursor) as usize;
        let take = buf.len().min(avail);
        let pos = u32::try_from(u64::from(flash_offset) + name_len as u64 + u64::from(cursor))
            .map_err(|_| MmrofsError::InvalidArgument("read position overflow"))?;
        inner.data_read(pos, &mut buf[..take])?;
        let handle = inner.fd_mut(fd)?;
        handle.cursor += u32::try_from(take).expect("take bounded by u32 data_size");
        Ok(take)
    }

    /// Move the read cursor. Write-only handles are not seekable.
    pub fn seek(&self, fd: Fd, pos: SeekFrom) -> Result<u32> {
        let mut inner = self.inner.lock();
        let handle = inner.fd_ref(fd)?;
        if handle.mode.is_write_only() {
            return Err(MmrofsError::NotSeekable);
        }
        let data_size = match handle.kind {
            HandleKind::Read { data_size, .. } | HandleKind::Committed { data_size, .. } => {
                data_size
            }
            HandleKind::PendingNew | HandleKind::PendingUpdate { .. } => 0,
        };
        let target = match pos {
            SeekFrom::Start(offset) => i64::try_from(offset)
                .map_err(|_| MmrofsError::InvalidArgument("seek offset overflow"))?,
            SeekFrom::Current(delta) => i64::from(handle.cursor) + delta,
            SeekFrom::End(delta) => i64::from(data_size) + delta,
        };
        if target < 0 || target > i64::from(data_size) {
            return Err(MmrofsError::InvalidArgument("seek outside file bounds"));
        }
        let target = u32::try_from(target).expect("bounded by u32 data_size");
        inner.fd_mut(fd)?.cursor = target;
        Ok(target)
    }

    /// Close a handle. A committed write handle finalizes here: mtime,
    /// then the exact size over the capacity mask, then VALID.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let mut inner = self.inner.lock();
        let handle = inner
            .fds
            .get_mut(fd.0)
            .and_then(Option::take)
            .ok_or(MmrofsError::BadHandle)?;

        if handle.mode.is_writable() {
            if let HandleKind::Committed {
                slot, data_size, ..
            } = handle.kind
            {
                let exact = u32::try_from(handle.name.len() as u64 + u64::from(data_size))
                    .map_err(|_| MmrofsError::InvalidArgument("file size overflow"))?;
                let now = inner.now();
                inner.write_mtime_field(slot, now)?;
                inner.write_size_field(slot, exact)?;
                inner.write_state(slot, EntryState::Valid)?;
                debug!(
                    target: "mmrofs::fs",
                    event = "finalized",
                    slot = slot.0,
                    size = exact
                );
            }
        }
        Ok(())
    }

    /// Remove a live file: a single TOMBSTONE program over its state byte.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let name = normalize_path(path)?;
        let hash = fnv1a32(name);
        let mut inner = self.inner.lock();
        let (slot, _) = inner
            .lookup(name, hash)?
            .ok_or_else(|| MmrofsError::NotFound(path.to_owned()))?;
        if inner.slot_has_other_handles(slot, None) {
            return Err(MmrofsError::Busy);
        }
        inner.write_state(slot, EntryState::Tombstone)?;
        debug!(target: "mmrofs::fs", event = "unlinked", slot = slot.0);
        Ok(())
    }

    /// Rename always copies: the filename is part of the data region, so
    /// the content moves to a fresh extent under a new entry whose
    /// `old_entry`/`dst_entry` references make the double tombstone
    /// crash-deterministic.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src_name = normalize_path(src)?;
        let dst_name = normalize_path(dst)?;
        let src_hash = fnv1a32(src_name);
        let dst_hash = fnv1a32(dst_name);
        let mut inner = self.inner.lock();

        let (src_slot, src_entry) = inner
            .lookup(src_name, src_hash)?
            .ok_or_else(|| MmrofsError::NotFound(src.to_owned()))?;
        let dst_existing = inner.lookup(dst_name, dst_hash)?.map(|(slot, _)| slot);

        if inner.slot_has_other_handles(src_slot, None) {
            return Err(MmrofsError::Busy);
        }
        if let Some(dst_slot) = dst_existing {
            if inner.slot_has_other_handles(dst_slot, None) {
                return Err(MmrofsError::Busy);
            }
        }
        inner.rename_flow(src_slot, &src_entry, dst_existing, dst_name, dst_hash)
    }

    /// Metadata by path.
    pub fn stat(&self, path: &str) -> Result<FileMetadata> {
        let name = normalize_path(path)?;
        let hash = fnv1a32(name);
        let mut inner = self.inner.lock();
        let (_, entry) = inner
            .lookup(name, hash)?
            .ok_or_else(|| MmrofsError::NotFound(path.to_owned()))?;
        Ok(metadata_of(&entry))
    }

    /// Metadata by handle. Uncommitted write handles report the running
    /// byte counter they have accepted so far.
    pub fn fstat(&self, fd: Fd) -> Result<FileMetadata> {
        let inner = self.inner.lock();
        let handle = inner.fd_ref(fd)?;
        match handle.kind {
            HandleKind::Read { slot, .. } | HandleKind::Committed { slot, .. } => {
                let entry = inner.read_entry(slot)?;
                Ok(metadata_of(&entry))
            }
            HandleKind::PendingNew | HandleKind::PendingUpdate { .. } => Ok(FileMetadata {
                size: 0,
                mtime: 0,
                ctime: 0,
            }),
        }
    }

    /// Open a directory handle over the flat namespace.
    pub fn opendir(&self) -> Result<DirFd> {
        let mut inner = self.inner.lock();
        for (index, dir) in inner.dirs.iter_mut().enumerate() {
            if !dir.in_use {
                dir.in_use = true;
                dir.scan_index = 0;
                return Ok(DirFd(index));
            }
        }
        Err(MmrofsError::NoFreeHandle)
    }

    /// Next live entry in slot order, or `None` at the end of the table.
    pub fn readdir(&self, dir: DirFd) -> Result<Option<DirEntry>> {
        let mut inner = self.inner.lock();
        let slot_state = inner
            .dirs
            .get(dir.0)
            .filter(|d| d.in_use)
            .copied()
            .ok_or(MmrofsError::BadHandle)?;

        let mut index = slot_state.scan_index;
        while index < inner.max_entries {
            let slot = SlotIndex(index);
            index += 1;
            let entry = inner.read_entry(slot)?;
            if !entry.is_live()
                || entry
                    .validate(inner.partition_size, inner.max_entries)
                    .is_err()
            {
                continue;
            }
            let mut name = vec![0_u8; usize::from(entry.name_len)];
            inner.data_read(entry.offset, &mut name)?;
            inner.dirs[dir.0].scan_index = index;
            let meta = metadata_of(&entry);
            return Ok(Some(DirEntry {
                name: String::from_utf8_lossy(&name).into_owned(),
                slot,
                size: meta.size,
                mtime: meta.mtime,
                ctime: meta.ctime,
            }));
        }
        inner.dirs[dir.0].scan_index = index;
        Ok(None)
    }

    pub fn closedir(&self, dir: DirFd) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.dirs.get_mut(dir.0).ok_or(MmrofsError::BadHandle)?;
        if !slot.in_use {
            return Err(MmrofsError::BadHandle);
        }
        slot.in_use = false;
        Ok(())
    }

    /// Forward-compact the data region. Returns the number of entries
    /// relocated to lower offsets.
    pub fn defragment_data(&self) -> Result<usize> {
        self.inner.lock().defragment_data()
    }

    /// Reclaim dead header pages and consolidate live entries so whole
    /// pages can be erased back to FREE. Returns whether any page was
    /// reclaimed. Runs automatically when the table is exhausted.
    pub fn compact_entries(&self) -> Result<bool> {
        self.inner.lock().compact_entry_table()
    }
}

fn metadata_of(entry: &Entry) -> FileMetadata {
    FileMetadata {
        // A capacity mask carries no exact size yet; report 0 rather than
        // the mask arithmetic.
        size: if entry.has_capacity_mask() {
            0
        } else {
            entry.data_size()
        },
        mtime: if entry.mtime == MTIME_UNSET {
            0
        } else {
            entry.mtime
        },
        ctime: entry.ctime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_single_leading_slash() {
        assert_eq!(normalize_path("/demo.txt").unwrap(), b"demo.txt");
        assert_eq!(normalize_path("demo.txt").unwrap(), b"demo.txt");
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("").is_err());
        let long = "x".repeat(256);
        assert!(normalize_path(&long).is_err());
        let max = "x".repeat(255);
        assert_eq!(normalize_path(&max).unwrap().len(), 255);
    }
}
