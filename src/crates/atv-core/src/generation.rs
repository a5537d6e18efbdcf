//! Monotonic generation numbers for device links.
//!
//! Every time the gateway installs a new connection (initial connect or a
//! successful reconnection) it stamps the link with a fresh generation.
//! Lifecycle callbacks carry the generation of the link that registered
//! them, so a late `connection-lost` from a connection that has already been
//! replaced can be recognised and dropped instead of tearing down the new one.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU64`: callbacks may be registered from the
//! gateway task while a reconnection task is running elsewhere, and neither
//! side needs a lock to draw a number.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing generation counter.
///
/// Generations start at 1 so that 0 is never a valid link generation.
///
/// # Examples
///
/// ```rust
/// use atv_core::GenerationCounter;
///
/// let counter = GenerationCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct GenerationCounter {
    inner: AtomicU64,
}

impl GenerationCounter {
    /// Creates a new counter; the first call to [`next`](Self::next) returns 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next generation and atomically increments the counter.
    ///
    /// Uses `Relaxed` ordering: uniqueness is all that matters, not ordering
    /// relative to other memory operations.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}
