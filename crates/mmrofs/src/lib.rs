#![forbid(unsafe_code)]
//! MMROFS public API facade.
//!
//! Re-exports the core handle, the flash device capabilities, and the
//! error type through one stable interface. This is the crate downstream
//! consumers (VFS adapters, tooling, tests) depend on.

pub use mmrofs_core::*;
pub use mmrofs_error::{MmrofsError, Result};
pub use mmrofs_flash::{FileNorFlash, NorFlash, RamNorFlash};
pub use mmrofs_types::{DATA_REGION_START, ERASE_BLOCK_SIZE, MAX_ENTRIES, MAX_FILENAME_LEN};
