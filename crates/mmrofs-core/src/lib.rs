#![forbid(unsafe_code)]
//! Transactional flat-namespace file store for SPI NOR flash.
//!
//! Every mutating operation is a sequence of flash programs ordered so that
//! any prefix of the sequence leaves the partition in a state the boot-time
//! recovery pass can classify and finish. There are no checksums and no
//! generation numbers; durability rests entirely on the monotone 1→0 state
//! byte transitions of the 32-byte entry table.
//!
//! `Mmrofs::mount` is the only way in; the returned handle owns the
//! partition exclusively.

mod clock;
mod defrag;
mod dir;
mod fs;
mod handle;
mod recovery;
mod txn;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dir::{DirEntry, DirFd, MAX_DIR_HANDLES};
pub use fs::{FileMetadata, Mmrofs, MountConfig};
pub use handle::{Fd, OpenMode};
pub use recovery::RecoveryReport;
