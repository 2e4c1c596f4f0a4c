//! Byte accounting for pre-extracted payloads.
//!
//! The budget is advisory: it never refuses an allocation, it only tells the
//! pre-extractor when to start writing entries to disk instead of keeping
//! them in memory. Dropping a large slot asks whoever registered a reclaim
//! hook to free what else it can.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Called with the size of a large release.
pub type ReclaimHook = Arc<dyn Fn(u64) + Send + Sync>;

struct Counter {
    capacity: u64,
    large_release: u64,
    used: AtomicU64,
    reclaim: RwLock<Option<ReclaimHook>>,
}

impl Counter {
    fn release(&self, size: u64) {
        let before = self.used.fetch_sub(size, Ordering::AcqRel);
        if size < self.large_release {
            return;
        }
        tracing::debug!(size, used = before - size, "released large memory slot");
        // Cloned out so the hook can touch the budget (or set a new hook).
        let hook = self.reclaim.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook(size);
        }
    }
}

/// Shared, process-wide memory budget.
#[derive(Clone)]
pub struct MemoryBudget {
    inner: Arc<Counter>,
}

impl MemoryBudget {
    /// A budget whose reclaim threshold is a third of `capacity`.
    pub fn new(capacity: u64) -> Self {
        Self::with_large_release(capacity, (capacity / 3).max(1))
    }

    /// Releases of at least `large_release` bytes fire the reclaim hook.
    pub fn with_large_release(capacity: u64, large_release: u64) -> Self {
        Self {
            inner: Arc::new(Counter {
                capacity,
                large_release,
                used: AtomicU64::new(0),
                reclaim: RwLock::new(None),
            }),
        }
    }

    /// Account for `size` bytes until the returned slot is dropped.
    pub fn acquire(&self, size: u64) -> MemorySlot {
        let used = self.inner.used.fetch_add(size, Ordering::AcqRel) + size;
        tracing::trace!(size, used, capacity = self.inner.capacity, "memory slot acquired");
        MemorySlot { counter: Arc::clone(&self.inner), size }
    }

    /// Install the hook run after a large slot is released. Replaces any
    /// previous one.
    pub fn set_reclaim(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.inner.reclaim.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    pub fn clear_reclaim(&self) {
        *self.inner.reclaim.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    pub fn large_release(&self) -> u64 {
        self.inner.large_release
    }

    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Once full, new payloads should go to disk.
    pub fn is_full(&self) -> bool {
        self.used() >= self.inner.capacity
    }

    /// Would holding `size` more bytes go over capacity?
    pub fn would_exceed(&self, size: u64) -> bool {
        self.used().saturating_add(size) > self.inner.capacity
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("capacity", &self.inner.capacity)
            .field("large_release", &self.inner.large_release)
            .field("used", &self.used())
            .finish()
    }
}

/// A sized claim on a [`MemoryBudget`], returned to it on drop.
pub struct MemorySlot {
    counter: Arc<Counter>,
    size: u64,
}

impl MemorySlot {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for MemorySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySlot").field("size", &self.size).finish()
    }
}

impl Drop for MemorySlot {
    fn drop(&mut self) {
        self.counter.release(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_slots_are_returned_on_drop() {
        let budget = MemoryBudget::new(100);
        let a = budget.acquire(40);
        let b = budget.acquire(50);
        assert_eq!(budget.used(), 90);
        assert!(!budget.is_full());
        assert!(budget.would_exceed(11));
        drop(a);
        assert_eq!(budget.used(), 50);
        drop(b);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_full_budget() {
        let budget = MemoryBudget::new(10);
        let _slot = budget.acquire(25);
        // Never refuses, only reports.
        assert!(budget.is_full());
        assert_eq!(budget.used(), 25);
    }

    #[test]
    fn test_clones_share_counter() {
        let budget = MemoryBudget::new(10);
        let other = budget.clone();
        let _slot = other.acquire(3);
        assert_eq!(budget.used(), 3);
    }

    #[test]
    fn test_large_release_fires_reclaim() {
        let budget = MemoryBudget::with_large_release(100, 30);
        let released = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&released);
        let observer = budget.clone();
        budget.set_reclaim(move |size| seen.lock().unwrap().push((size, observer.used())));

        drop(budget.acquire(10));
        assert!(released.lock().unwrap().is_empty());

        let _kept = budget.acquire(5);
        drop(budget.acquire(30));
        // The hook runs after the bytes are back in the budget.
        assert_eq!(*released.lock().unwrap(), [(30, 5)]);

        budget.clear_reclaim();
        drop(budget.acquire(50));
        assert_eq!(released.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_default_threshold() {
        let budget = MemoryBudget::new(90);
        assert_eq!(budget.large_release(), 30);
        assert_eq!(MemoryBudget::new(1).large_release(), 1);
    }
}
