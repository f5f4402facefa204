//! Debug-only reentrancy guard.
//!
//! Tracks which thread currently holds the map's mutex so that a nested
//! attempt to lock it from the same thread panics instead of deadlocking.
//! In release builds, this compiles to a zero-cost no-op.

#[cfg(not(debug_assertions))]
use core::marker::PhantomData;
#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};

/// Per-instance reentrancy tracker. Call `check()` before acquiring the
/// protected lock and hold the guard returned by `enter()` while it is held.
#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl DebugReentrancy {
    /// Create a new reentrancy tracker. Const so the owning map can be const-constructed.
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(0),
        }
    }

    /// In debug builds, panics if the calling thread is already inside.
    #[inline]
    pub(crate) fn check(&self) {
        #[cfg(debug_assertions)]
        assert!(
            self.owner.load(Ordering::Relaxed) != thread_token(),
            "reentrancy detected: nested entry into locked section"
        );
    }

    /// Mark the calling thread as the holder until the guard is dropped.
    #[inline]
    pub(crate) fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            let prev = self.owner.swap(thread_token(), Ordering::Relaxed);
            debug_assert_eq!(prev, 0, "locked section entered twice");
            return ReentrancyGuard { owner: self };
        }

        #[cfg(not(debug_assertions))]
        {
            return ReentrancyGuard { _z: PhantomData };
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// Nonzero identifier of the calling thread: the address of a thread-local.
#[cfg(debug_assertions)]
fn thread_token() -> usize {
    thread_local!(static TOKEN: u8 = const { 0 });
    TOKEN.with(|t| t as *const u8 as usize)
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.owner.owner.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::DebugReentrancy;

    #[test]
    fn enter_and_exit_is_ok() {
        let r = DebugReentrancy::new();
        r.check();
        let g = r.enter();
        drop(g);
        // Leaving the section allows entering again.
        r.check();
        let _g = r.enter();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_in_debug() {
        let r = DebugReentrancy::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _g1 = r.enter();
            // Checking again from the same thread should panic in debug builds
            r.check();
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }

    #[cfg(debug_assertions)]
    #[test]
    fn other_threads_are_not_reentrant() {
        let r = DebugReentrancy::new();
        let _g = r.enter();
        std::thread::scope(|s| {
            s.spawn(|| r.check());
        });
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn reentrancy_noop_in_release() {
        let r = DebugReentrancy::new();
        let _g1 = r.enter();
        r.check();
    }
}
