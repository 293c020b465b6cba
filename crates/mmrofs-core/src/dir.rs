//! Directory handles over the flat namespace.

use mmrofs_types::SlotIndex;
use serde::{Deserialize, Serialize};

/// Fixed directory-handle pool size.
pub const MAX_DIR_HANDLES: usize = 2;

/// Opaque directory descriptor returned by `opendir`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirFd(pub(crate) usize);

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirSlot {
    pub in_use: bool,
    pub scan_index: u16,
}

/// One `readdir` result. Entries come back in slot order; an entry whose
/// mtime was never finalized reports `mtime == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub slot: SlotIndex,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
}
