#![forbid(unsafe_code)]
//! On-flash entry codec and validation for MMROFS.
//!
//! An entry is 32 bytes, little-endian. The state byte at offset 0 is the
//! commit point of every transition; successive lifecycle states differ
//! only by clearing bits, so a state write can never be half-new and
//! half-old in a way that resurrects an earlier state.

use mmrofs_types::{
    DATA_REGION_START, ENTRY_NONE, ENTRY_SIZE, ERASE_BLOCK_SIZE, MAX_FILENAME_LEN, SlotIndex,
    footprint, is_capacity_mask,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Field byte offsets within a 32-byte entry ───────────────────────────────

pub const FIELD_STATE: u32 = 0;
pub const FIELD_NAME_LEN: u32 = 2;
pub const FIELD_NAME_HASH: u32 = 4;
pub const FIELD_OFFSET: u32 = 8;
pub const FIELD_SIZE: u32 = 12;
pub const FIELD_MTIME: u32 = 16;
pub const FIELD_CTIME: u32 = 20;
pub const FIELD_OLD_ENTRY: u32 = 24;
pub const FIELD_DST_ENTRY: u32 = 28;

// ── Lifecycle state byte ────────────────────────────────────────────────────

/// Entry lifecycle states. Each transition strictly clears bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryState {
    Free = 0xFF,
    Allocating = 0x7F,
    PendingData = 0x3F,
    TombstoningOld = 0x1F,
    Active = 0x0F,
    Valid = 0x07,
    Tombstone = 0x03,
    BadBlock = 0x01,
    Erased = 0x00,
}

impl EntryState {
    /// Decode a state byte; `None` for a torn or foreign value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0xFF => Some(Self::Free),
            0x7F => Some(Self::Allocating),
            0x3F => Some(Self::PendingData),
            0x1F => Some(Self::TombstoningOld),
            0x0F => Some(Self::Active),
            0x07 => Some(Self::Valid),
            0x03 => Some(Self::Tombstone),
            0x01 => Some(Self::BadBlock),
            0x00 => Some(Self::Erased),
            _ => None,
        }
    }

    /// ACTIVE or VALID: the entry is visible to readers.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Valid)
    }
}

/// Whether a raw state byte belongs to a live entry.
#[must_use]
pub fn state_byte_is_live(byte: u8) -> bool {
    EntryState::from_byte(byte).is_some_and(EntryState::is_live)
}

// ── Entry ───────────────────────────────────────────────────────────────────

/// Decoded 32-byte entry.
///
/// `state` is kept raw: recovery must be able to observe torn state bytes
/// that decode to no lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub state: u8,
    pub name_len: u16,
    pub name_hash: u32,
    pub offset: u32,
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub old_entry: u32,
    pub dst_entry: u32,
}

impl Entry {
    /// Decode from the on-flash layout. The reserved byte at offset 1 is
    /// ignored.
    #[must_use]
    pub fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        let le_u16 = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let le_u32 = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        Self {
            state: raw[FIELD_STATE as usize],
            name_len: le_u16(FIELD_NAME_LEN as usize),
            name_hash: le_u32(FIELD_NAME_HASH as usize),
            offset: le_u32(FIELD_OFFSET as usize),
            size: le_u32(FIELD_SIZE as usize),
            mtime: le_u32(FIELD_MTIME as usize),
            ctime: le_u32(FIELD_CTIME as usize),
            old_entry: le_u32(FIELD_OLD_ENTRY as usize),
            dst_entry: le_u32(FIELD_DST_ENTRY as usize),
        }
    }

    /// Encode to the on-flash layout. The reserved byte is written 0x00.
    #[must_use]
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0_u8; ENTRY_SIZE];
        raw[FIELD_STATE as usize] = self.state;
        raw[1] = 0x00;
        raw[FIELD_NAME_LEN as usize..][..2].copy_from_slice(&self.name_len.to_le_bytes());
        raw[FIELD_NAME_HASH as usize..][..4].copy_from_slice(&self.name_hash.to_le_bytes());
        raw[FIELD_OFFSET as usize..][..4].copy_from_slice(&self.offset.to_le_bytes());
        raw[FIELD_SIZE as usize..][..4].copy_from_slice(&self.size.to_le_bytes());
        raw[FIELD_MTIME as usize..][..4].copy_from_slice(&self.mtime.to_le_bytes());
        raw[FIELD_CTIME as usize..][..4].copy_from_slice(&self.ctime.to_le_bytes());
        raw[FIELD_OLD_ENTRY as usize..][..4].copy_from_slice(&self.old_entry.to_le_bytes());
        raw[FIELD_DST_ENTRY as usize..][..4].copy_from_slice(&self.dst_entry.to_le_bytes());
        raw
    }

    /// Decoded lifecycle state, if the byte is one of the nine patterns.
    #[must_use]
    pub fn lifecycle(&self) -> Option<EntryState> {
        EntryState::from_byte(self.state)
    }

    /// ACTIVE or VALID.
    #[must_use]
    pub fn is_live(&self) -> bool {
        state_byte_is_live(self.state)
    }

    /// Whether the size word is an unfinalized streaming capacity mask.
    #[must_use]
    pub fn has_capacity_mask(&self) -> bool {
        is_capacity_mask(self.size)
    }

    /// 4 KiB-aligned bytes reserved by this entry in the data region.
    #[must_use]
    pub fn alloc_footprint(&self) -> u64 {
        footprint(self.size)
    }

    /// Exclusive end of this entry's footprint.
    #[must_use]
    pub fn footprint_end(&self) -> u64 {
        u64::from(self.offset) + self.alloc_footprint()
    }

    /// File data bytes (on-flash size minus the stored filename).
    ///
    /// Only meaningful when the size word is exact.
    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.size.saturating_sub(u32::from(self.name_len))
    }

    /// Slot reference stored in `old_entry`, if present and in range.
    #[must_use]
    pub fn old_slot(&self, max_entries: u16) -> Option<SlotIndex> {
        SlotIndex::from_entry_ref(self.old_entry, max_entries)
    }

    /// Slot reference stored in `dst_entry`, if present and in range.
    #[must_use]
    pub fn dst_slot(&self, max_entries: u16) -> Option<SlotIndex> {
        SlotIndex::from_entry_ref(self.dst_entry, max_entries)
    }

    /// Field validation. Any reader that matched a hash must pass this
    /// before dereferencing `offset`: a single flipped bit could otherwise
    /// redirect reads past the partition end.
    pub fn validate(&self, partition_size: u64, max_entries: u16) -> Result<(), EntryFault> {
        if self.name_len == 0 || usize::from(self.name_len) > MAX_FILENAME_LEN {
            return Err(EntryFault::NameLen(self.name_len));
        }
        if self.size < u32::from(self.name_len) {
            return Err(EntryFault::SizeBelowName {
                size: self.size,
                name_len: self.name_len,
            });
        }
        if self.offset < DATA_REGION_START {
            return Err(EntryFault::OffsetInHeader(self.offset));
        }
        if self.offset % ERASE_BLOCK_SIZE != 0 {
            return Err(EntryFault::OffsetUnaligned(self.offset));
        }
        if self.footprint_end() > partition_size {
            return Err(EntryFault::FootprintOutOfBounds {
                offset: self.offset,
                footprint: self.alloc_footprint(),
            });
        }
        if self.old_entry != ENTRY_NONE && self.old_entry >= u32::from(max_entries) {
            return Err(EntryFault::SlotRefOutOfRange("old_entry"));
        }
        if self.dst_entry != ENTRY_NONE && self.dst_entry >= u32::from(max_entries) {
            return Err(EntryFault::SlotRefOutOfRange("dst_entry"));
        }
        Ok(())
    }
}

/// Why an entry failed validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryFault {
    #[error("name_len {0} outside 1..=255")]
    NameLen(u16),
    #[error("size {size} smaller than name_len {name_len}")]
    SizeBelowName { size: u32, name_len: u16 },
    #[error("data offset {0:#x} inside header region")]
    OffsetInHeader(u32),
    #[error("data offset {0:#x} not 4 KiB-aligned")]
    OffsetUnaligned(u32),
    #[error("footprint {footprint} at {offset:#x} exceeds partition")]
    FootprintOutOfBounds { offset: u32, footprint: u64 },
    #[error("{0} references a slot beyond the entry table")]
    SlotRefOutOfRange(&'static str),
}

/// Whether a raw slot is virgin erased (usable as FREE).
#[must_use]
pub fn slot_is_blank(raw: &[u8; ENTRY_SIZE]) -> bool {
    raw.iter().all(|b| *b == 0xFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entry {
        Entry {
            state: EntryState::Valid as u8,
            name_len: 8,
            name_hash: 0xDEAD_BEEF,
            offset: 0x2_0000,
            size: 8 + 11,
            mtime: 1_700_000_000,
            ctime: 1_699_999_000,
            old_entry: ENTRY_NONE,
            dst_entry: ENTRY_NONE,
        }
    }

    #[test]
    fn states_only_clear_bits_along_the_lifecycle() {
        let chain = [
            EntryState::Free,
            EntryState::Allocating,
            EntryState::PendingData,
            EntryState::TombstoningOld,
            EntryState::Active,
            EntryState::Valid,
            EntryState::Tombstone,
            EntryState::BadBlock,
            EntryState::Erased,
        ];
        for pair in chain.windows(2) {
            let (prev, next) = (pair[0] as u8, pair[1] as u8);
            assert_eq!(prev & next, next, "{prev:#04x} -> {next:#04x} raises bits");
        }
    }

    #[test]
    fn state_byte_round_trip() {
        for byte in [0xFF, 0x7F, 0x3F, 0x1F, 0x0F, 0x07, 0x03, 0x01, 0x00] {
            assert_eq!(EntryState::from_byte(byte).unwrap() as u8, byte);
        }
        assert_eq!(EntryState::from_byte(0x5F), None);
        assert!(state_byte_is_live(0x0F));
        assert!(state_byte_is_live(0x07));
        assert!(!state_byte_is_live(0x03));
        assert!(!state_byte_is_live(0x5F));
    }

    #[test]
    fn codec_round_trip_preserves_fields() {
        let entry = sample();
        let decoded = Entry::decode(&entry.encode());
        assert_eq!(decoded, entry);
        // Reserved byte programs as 0x00.
        assert_eq!(entry.encode()[1], 0x00);
    }

    #[test]
    fn blank_slot_detection() {
        assert!(slot_is_blank(&[0xFF; ENTRY_SIZE]));
        let mut raw = [0xFF; ENTRY_SIZE];
        raw[17] = 0xFE;
        assert!(!slot_is_blank(&raw));
    }

    #[test]
    fn validation_accepts_sane_entry() {
        assert_eq!(sample().validate(1 << 22, 2048), Ok(()));
    }

    #[test]
    fn validation_rejects_each_fault() {
        let partition = 1_u64 << 22;

        let mut e = sample();
        e.name_len = 0;
        assert!(matches!(e.validate(partition, 2048), Err(EntryFault::NameLen(0))));

        let mut e = sample();
        e.name_len = 256;
        assert!(e.validate(partition, 2048).is_err());

        let mut e = sample();
        e.size = 3;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::SizeBelowName { .. })
        ));

        let mut e = sample();
        e.offset = 0x8000;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::OffsetInHeader(_))
        ));

        let mut e = sample();
        e.offset = 0x2_0001;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::OffsetUnaligned(_))
        ));

        let mut e = sample();
        e.offset = (partition as u32) - 4096;
        e.size = 2 * 4096;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::FootprintOutOfBounds { .. })
        ));

        let mut e = sample();
        e.old_entry = 2048;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::SlotRefOutOfRange("old_entry"))
        ));

        let mut e = sample();
        e.dst_entry = 5000;
        assert!(matches!(
            e.validate(partition, 2048),
            Err(EntryFault::SlotRefOutOfRange("dst_entry"))
        ));
    }

    #[test]
    fn capacity_mask_footprint() {
        let mut e = sample();
        e.size = (2 << 12) | 0xFFF;
        assert!(e.has_capacity_mask());
        assert_eq!(e.alloc_footprint(), 3 * 4096);

        e.size = 4500 + 7;
        assert!(!e.has_capacity_mask());
        assert_eq!(e.alloc_footprint(), 8192);
    }
}
