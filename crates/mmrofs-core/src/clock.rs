//! Wall-clock source and the mount-time bootstrap.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Second-resolution wall clock.
///
/// `set_unix` exists for the mount-time bootstrap: when the host clock is
/// implausible, it is seeded from the newest timestamp found in live
/// entries so that subsequent ctime/mtime writes stay non-decreasing
/// across crashes.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u32;
    fn set_unix(&self, secs: u32);
}

/// Host-backed clock. `set_unix` installs an offset over the host time
/// rather than touching the host itself.
#[derive(Debug, Default)]
pub struct SystemClock {
    adjust: Mutex<i64>,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn host_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}

impl Clock for SystemClock {
    fn now_unix(&self) -> u32 {
        let secs = Self::host_secs() + *self.adjust.lock();
        u32::try_from(secs.max(0)).unwrap_or(u32::MAX)
    }

    fn set_unix(&self, secs: u32) {
        *self.adjust.lock() = i64::from(secs) - Self::host_secs();
    }
}

/// Externally driven clock for hosts that feed their own time, and for
/// deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU32,
}

impl ManualClock {
    #[must_use]
    pub fn new(secs: u32) -> Self {
        Self {
            secs: AtomicU32::new(secs),
        }
    }

    pub fn advance(&self, delta: u32) {
        self.secs.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> u32 {
        self.secs.load(Ordering::Relaxed)
    }

    fn set_unix(&self, secs: u32) {
        self.secs.store(secs, Ordering::Relaxed);
    }
}
