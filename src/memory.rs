//! # Memory Probes
//!
//! A memory-limited stream samples resident memory after every page and stops
//! prefetching while usage is above its limit. The sample comes from a
//! [`MemoryProbe`] so the decision can be driven by a fake in tests.
//!
//! The limit is soft: a page that is already in flight is always delivered,
//! and sampling is advisory (process-wide, read-only, possibly stale).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::{Pid, System};

/// Source of the current resident set size.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of this process in bytes, or `None` if unavailable.
    fn rss_bytes(&self) -> Option<u64>;

    /// Resident memory rounded down to megabytes.
    fn rss_mb(&self) -> Option<u64> {
        self.rss_bytes().map(|b| b / (1024 * 1024))
    }
}

// =============================================================================
// Process Memory (sysinfo)
// =============================================================================

/// Reads this process's RSS through `sysinfo`.
pub struct ProcessMemory {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            pid: Pid::from(std::process::id() as usize),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn rss_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock();
        if !system.refresh_process(self.pid) {
            return None;
        }
        system.process(self.pid).map(|p| p.memory())
    }
}

// =============================================================================
// Fixed Memory
// =============================================================================

/// A probe that reports whatever value it was last given.
///
/// Handy for tests and for callers that track memory by other means.
#[derive(Debug, Default)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn from_mb(mb: u64) -> Self {
        Self {
            bytes: AtomicU64::new(mb * 1024 * 1024),
        }
    }

    pub fn set_mb(&self, mb: u64) {
        self.bytes.store(mb * 1024 * 1024, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn rss_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }
}
