#![forbid(unsafe_code)]
//! Flash device abstraction for MMROFS.
//!
//! Provides the `NorFlash` trait with SPI NOR semantics (programs only
//! clear bits, erases restore 4 KiB blocks to 0xFF), a RAM-backed
//! implementation with power-cut fault injection for crash-recovery tests,
//! a file-backed implementation for persistent images, and the sliding
//! 64 KiB read window used for data-region reads.

use mmrofs_error::{MmrofsError, Result};
use mmrofs_types::{ERASE_BLOCK_SIZE, READ_WINDOW_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Device trait ────────────────────────────────────────────────────────────

/// Byte-addressed NOR flash partition.
///
/// `program` may only clear bits (1→0) relative to the current contents;
/// the state machine above this trait is built entirely on that asymmetry.
pub trait NorFlash: Send + Sync {
    /// Partition length in bytes.
    fn size(&self) -> u64;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Program `bytes` at `offset`. Bit-clearing only.
    fn program(&self, offset: u32, bytes: &[u8]) -> Result<()>;

    /// Erase the 4 KiB block at `offset` (must be block-aligned) to 0xFF.
    fn erase_4k(&self, offset: u32) -> Result<()>;
}

/// Erase every 4 KiB block covering `[offset, offset + len)`.
///
/// `offset` must be block-aligned.
pub fn erase_range(dev: &dyn NorFlash, offset: u32, len: u64) -> Result<()> {
    if u64::from(offset) % u64::from(ERASE_BLOCK_SIZE) != 0 {
        return Err(MmrofsError::InvalidArgument("erase offset unaligned"));
    }
    let blocks = mmrofs_types::align_up_4k(len) / u64::from(ERASE_BLOCK_SIZE);
    for i in 0..blocks {
        let block = u64::from(offset) + i * u64::from(ERASE_BLOCK_SIZE);
        let block = u32::try_from(block)
            .map_err(|_| MmrofsError::InvalidArgument("erase range beyond u32 offsets"))?;
        dev.erase_4k(block)?;
    }
    Ok(())
}

/// Whether `[offset, offset + len)` reads entirely as 0xFF.
pub fn range_is_erased(dev: &dyn NorFlash, offset: u32, len: u64) -> Result<bool> {
    let mut buf = [0_u8; 64];
    let mut pos = u64::from(offset);
    let end = pos + len;
    while pos < end {
        let chunk = usize::try_from((end - pos).min(buf.len() as u64))
            .map_err(|_| MmrofsError::InvalidArgument("chunk length overflow"))?;
        let pos32 = u32::try_from(pos)
            .map_err(|_| MmrofsError::InvalidArgument("read beyond u32 offsets"))?;
        dev.read(pos32, &mut buf[..chunk])?;
        if buf[..chunk].iter().any(|b| *b != 0xFF) {
            return Ok(false);
        }
        pos += chunk as u64;
    }
    Ok(true)
}

fn check_bounds(size: u64, offset: u32, len: usize, what: &'static str) -> Result<()> {
    let end = u64::from(offset)
        .checked_add(len as u64)
        .ok_or(MmrofsError::InvalidArgument("range overflows u64"))?;
    if end > size {
        return Err(MmrofsError::Format(format!(
            "{what} out of bounds: offset={offset} len={len} partition={size}"
        )));
    }
    Ok(())
}

fn power_cut_error() -> MmrofsError {
    MmrofsError::Io(io::Error::other("injected power cut"))
}

// ── RAM-backed device with fault injection ──────────────────────────────────

#[derive(Debug)]
struct RamState {
    mem: Vec<u8>,
    /// Programs allowed before the injected power cut. `None` disarms.
    programs_remaining: Option<u64>,
    /// Bytes of the failing program to apply before cutting.
    partial_bytes: usize,
    programs: u64,
    erases: u64,
    bit_raise_attempts: u64,
}

/// In-memory NOR flash for tests.
///
/// Programs apply `old & new` (hardware cannot raise bits) and count any
/// attempt to set a cleared bit, so tests can assert the state machine
/// never relies on 0→1 transitions. `fail_after_programs` arms a power
/// cut after N successful programs; the cut program is either dropped
/// entirely or applied for its first `partial` bytes.
#[derive(Debug)]
pub struct RamNorFlash {
    state: Mutex<RamState>,
}

impl RamNorFlash {
    #[must_use]
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RamState {
                mem: vec![0xFF; size],
                programs_remaining: None,
                partial_bytes: 0,
                programs: 0,
                erases: 0,
                bit_raise_attempts: 0,
            }),
        })
    }

    /// Arm a power cut: the next `n` programs succeed, later ones fail
    /// without touching the array.
    pub fn fail_after_programs(&self, n: u64) {
        let mut state = self.state.lock();
        state.programs_remaining = Some(n);
        state.partial_bytes = 0;
    }

    /// Arm a torn program: `n` programs succeed, the next applies only its
    /// first `partial` bytes and then fails.
    pub fn fail_after_programs_partial(&self, n: u64, partial: usize) {
        let mut state = self.state.lock();
        state.programs_remaining = Some(n);
        state.partial_bytes = partial;
    }

    pub fn clear_fault(&self) {
        let mut state = self.state.lock();
        state.programs_remaining = None;
        state.partial_bytes = 0;
    }

    #[must_use]
    pub fn program_count(&self) -> u64 {
        self.state.lock().programs
    }

    #[must_use]
    pub fn erase_count(&self) -> u64 {
        self.state.lock().erases
    }

    /// Total state-changing device operations (programs + erases).
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        let state = self.state.lock();
        state.programs + state.erases
    }

    /// Programs that tried to raise at least one bit. Always zero for a
    /// correct write sequence.
    #[must_use]
    pub fn bit_raise_attempts(&self) -> u64 {
        self.state.lock().bit_raise_attempts
    }

    /// Copy of the full array, for structural assertions in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().mem.clone()
    }
}

impl NorFlash for RamNorFlash {
    fn size(&self) -> u64 {
        self.state.lock().mem.len() as u64
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        check_bounds(state.mem.len() as u64, offset, buf.len(), "read")?;
        let start = offset as usize;
        buf.copy_from_slice(&state.mem[start..start + buf.len()]);
        Ok(())
    }

    fn program(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        check_bounds(state.mem.len() as u64, offset, bytes.len(), "program")?;

        let applied = match state.programs_remaining {
            Some(0) => {
                let partial = state.partial_bytes.min(bytes.len());
                state.partial_bytes = 0;
                state.programs_remaining = Some(0);
                if partial == 0 {
                    return Err(power_cut_error());
                }
                partial
            }
            Some(ref mut n) => {
                *n -= 1;
                bytes.len()
            }
            None => bytes.len(),
        };

        let start = offset as usize;
        let mut raised = false;
        for (i, byte) in bytes[..applied].iter().enumerate() {
            let old = state.mem[start + i];
            if byte & !old != 0 {
                raised = true;
            }
            state.mem[start + i] = old & byte;
        }
        if raised {
            state.bit_raise_attempts += 1;
        }
        state.programs += 1;

        if applied < bytes.len() {
            return Err(power_cut_error());
        }
        Ok(())
    }

    fn erase_4k(&self, offset: u32) -> Result<()> {
        if offset % ERASE_BLOCK_SIZE != 0 {
            return Err(MmrofsError::InvalidArgument("erase offset unaligned"));
        }
        let mut state = self.state.lock();
        check_bounds(
            state.mem.len() as u64,
            offset,
            ERASE_BLOCK_SIZE as usize,
            "erase",
        )?;
        let start = offset as usize;
        state.mem[start..start + ERASE_BLOCK_SIZE as usize].fill(0xFF);
        state.erases += 1;
        Ok(())
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// NOR flash emulated over a partition image file.
///
/// `program` performs a read-modify-write that ANDs the new bytes over the
/// current contents, so the image obeys the same 1→0 asymmetry as hardware.
#[derive(Debug, Clone)]
pub struct FileNorFlash {
    file: Arc<File>,
    len: u64,
}

impl FileNorFlash {
    /// Open an existing partition image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create a fresh image of `size` bytes, fully erased.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let blank = vec![0xFF_u8; ERASE_BLOCK_SIZE as usize];
        let mut pos = 0_u64;
        while pos < size {
            let chunk = (size - pos).min(blank.len() as u64);
            let chunk = usize::try_from(chunk)
                .map_err(|_| MmrofsError::InvalidArgument("image chunk overflow"))?;
            file.write_all_at(&blank[..chunk], pos)?;
            pos += chunk as u64;
        }
        file.sync_all()?;
        Ok(Self {
            file: Arc::new(file),
            len: size,
        })
    }
}

impl NorFlash for FileNorFlash {
    fn size(&self) -> u64 {
        self.len
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len, offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, u64::from(offset))?;
        Ok(())
    }

    fn program(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        check_bounds(self.len, offset, bytes.len(), "program")?;
        let mut current = vec![0_u8; bytes.len()];
        self.file.read_exact_at(&mut current, u64::from(offset))?;
        for (cur, new) in current.iter_mut().zip(bytes) {
            *cur &= new;
        }
        self.file.write_all_at(&current, u64::from(offset))?;
        Ok(())
    }

    fn erase_4k(&self, offset: u32) -> Result<()> {
        if offset % ERASE_BLOCK_SIZE != 0 {
            return Err(MmrofsError::InvalidArgument("erase offset unaligned"));
        }
        check_bounds(self.len, offset, ERASE_BLOCK_SIZE as usize, "erase")?;
        let blank = [0xFF_u8; ERASE_BLOCK_SIZE as usize];
        self.file.write_all_at(&blank, u64::from(offset))?;
        Ok(())
    }
}

// ── Sliding read window ─────────────────────────────────────────────────────

/// 64 KiB sliding window over the data region.
///
/// Serves repeated small reads of live (immutable) file data from one
/// buffered span. Must be invalidated after any program or erase that
/// touches the data region.
#[derive(Debug)]
pub struct SlidingWindow {
    buf: Box<[u8]>,
    start: u32,
    len: usize,
    valid: bool,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindow {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0_u8; READ_WINDOW_SIZE as usize].into_boxed_slice(),
            start: 0,
            len: 0,
            valid: false,
        }
    }

    /// Drop the cached span. Required after data-region mutation.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    fn remap(&mut self, dev: &dyn NorFlash, offset: u32) -> Result<()> {
        let start = offset & !(READ_WINDOW_SIZE - 1);
        let span = (dev.size() - u64::from(start)).min(u64::from(READ_WINDOW_SIZE));
        let span =
            usize::try_from(span).map_err(|_| MmrofsError::InvalidArgument("window overflow"))?;
        trace!(
            target: "mmrofs::flash",
            event = "window_remap",
            start = start,
            span = span
        );
        dev.read(start, &mut self.buf[..span])?;
        self.start = start;
        self.len = span;
        self.valid = true;
        Ok(())
    }

    /// Read `out.len()` bytes at `offset`, remapping across window
    /// boundaries as needed.
    pub fn read(&mut self, dev: &dyn NorFlash, offset: u32, out: &mut [u8]) -> Result<()> {
        let mut pos = offset;
        let mut filled = 0_usize;
        while filled < out.len() {
            let in_window = self.valid
                && pos >= self.start
                && u64::from(pos) < u64::from(self.start) + self.len as u64;
            if !in_window {
                self.remap(dev, pos)?;
            }
            let window_off = (pos - self.start) as usize;
            let avail = self.len - window_off;
            let take = avail.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&self.buf[window_off..window_off + take]);
            filled += take;
            pos = u32::try_from(u64::from(pos) + take as u64)
                .map_err(|_| MmrofsError::InvalidArgument("read beyond u32 offsets"))?;
        }
        Ok(())
    }
}
