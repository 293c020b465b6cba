//! File-handle table types.

use mmrofs_types::SlotIndex;
use serde::{Deserialize, Serialize};

/// Opaque file descriptor returned by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub(crate) usize);

/// Open modes. Creation applies only when the path does not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    ReadOnly,
    /// Write-only; creates the file when absent.
    WriteCreate,
    /// Read-write; creates the file when absent.
    ReadWriteCreate,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }

    #[must_use]
    pub fn can_create(self) -> bool {
        matches!(self, Self::WriteCreate | Self::ReadWriteCreate)
    }

    #[must_use]
    pub fn is_write_only(self) -> bool {
        matches!(self, Self::WriteCreate)
    }
}

/// Where a handle stands in the write lifecycle.
#[derive(Debug, Clone)]
pub(crate) enum HandleKind {
    /// Resolved read handle over an immutable live entry.
    Read {
        slot: SlotIndex,
        flash_offset: u32,
        data_size: u32,
    },
    /// Writable handle for a path with no live entry yet. The first write
    /// picks the flow.
    PendingNew,
    /// Writable handle over an existing live entry. `old_data_size` is
    /// `None` when the entry still carries a capacity mask; writes then
    /// fail until another handle closes or recovery runs.
    PendingUpdate {
        old_slot: SlotIndex,
        old_offset: u32,
        old_data_size: Option<u32>,
        old_ctime: u32,
    },
    /// The first write committed an entry; `data_size` counts bytes
    /// written through this handle (plus any prior content).
    Committed {
        slot: SlotIndex,
        flash_offset: u32,
        data_size: u32,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct FileHandle {
    pub name: Vec<u8>,
    pub hash: u32,
    pub mode: OpenMode,
    pub cursor: u32,
    pub kind: HandleKind,
}

impl FileHandle {
    /// Entry slot this handle pins, if any.
    pub fn referenced_slot(&self) -> Option<SlotIndex> {
        match self.kind {
            HandleKind::Read { slot, .. } | HandleKind::Committed { slot, .. } => Some(slot),
            HandleKind::PendingUpdate { old_slot, .. } => Some(old_slot),
            HandleKind::PendingNew => None,
        }
    }

    /// Redirect a pinned slot after entry-table compaction.
    pub fn retarget_slot(&mut self, from: SlotIndex, to: SlotIndex) {
        match &mut self.kind {
            HandleKind::Read { slot, .. } | HandleKind::Committed { slot, .. } => {
                if *slot == from {
                    *slot = to;
                }
            }
            HandleKind::PendingUpdate { old_slot, .. } => {
                if *old_slot == from {
                    *old_slot = to;
                }
            }
            HandleKind::PendingNew => {}
        }
    }
}
