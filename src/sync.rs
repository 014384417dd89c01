//! Sharing wrapper for the single-owner allocator engines.

use spin::{Mutex, MutexGuard};

/// A spin-mutex wrapper giving one allocator instance to many owners.
///
/// The engines themselves are strictly single-owner (`&mut self`
/// everywhere); this is the layering piece for callers that need to reach
/// one heap from several places, e.g. a kernel installing a
/// [`ListHeap`](crate::ListHeap) behind a global.
pub struct Locked<A> {
    inner: Mutex<A>,
}

impl<A> Locked<A> {
    /// Wrap an allocator.
    pub const fn new(inner: A) -> Self {
        Locked {
            inner: Mutex::new(inner),
        }
    }

    /// Acquire the allocator, spinning until it is available.
    pub fn lock(&self) -> MutexGuard<'_, A> {
        self.inner.lock()
    }
}
