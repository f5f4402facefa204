//! Entry: the per-key atomic cell shared between the snapshot and the dirty map.
//!
//! A cell is a single tagged atomic pointer with three states:
//! - present: non-null, points at the current value;
//! - deleted: null, untagged; the cell is still reachable from the dirty map;
//! - expunged: null, tagged; the cell was left out of the dirty map when it
//!   was re-seeded. Only the map's lock may move a cell in or out of this
//!   state, and fast-path writers refuse to touch it.
//!
//! Replaced values are retired through the epoch collector, so a reference
//! obtained under a `Guard` stays valid until that guard is dropped, even if
//! the cell is overwritten or freed in the meantime.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

const EXPUNGED: usize = 1;

/// Heap slot for a value. Aligned so the pointer has a spare tag bit.
#[repr(align(2))]
struct Payload<V>(V);

pub(crate) struct Entry<V> {
    p: Atomic<Payload<V>>,
}

/// Result of a load-or-store attempt on a cell that accepted it.
pub(crate) enum LoadOrStore<'g, V> {
    /// A value was already present; the unused candidate is handed back so
    /// the caller decides where it is dropped.
    Loaded(&'g V, V),
    Stored(&'g V),
}

/// Schedule `p` for destruction once no pinned thread can observe it and
/// return a reference to its value that lives as long as `guard`.
///
/// Safety: `p` must already be unreachable from the cell it was loaded from.
unsafe fn retire<'g, V>(p: Shared<'g, Payload<V>>, guard: &'g Guard) -> Option<&'g V> {
    let value = p.as_ref().map(|p| &p.0);
    if value.is_some() {
        guard.defer_destroy(p);
    }
    value
}

impl<V> Entry<V> {
    pub(crate) fn new(value: V) -> Self {
        Self {
            p: Atomic::new(Payload(value)),
        }
    }

    /// A cell in the deleted state, filled by the caller before anyone else
    /// can reach it.
    pub(crate) fn empty() -> Self {
        Self { p: Atomic::null() }
    }

    /// Current value, `None` when deleted or expunged.
    #[inline]
    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let p = self.p.load(Ordering::Acquire, guard);
        unsafe { p.as_ref() }.map(|p| &p.0)
    }

    /// Swap in `value` unless the cell is expunged, in which case the value
    /// is handed back. Returns the previous value, if there was one.
    pub(crate) fn try_swap<'g>(&self, value: V, guard: &'g Guard) -> Result<Option<&'g V>, V> {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        let mut new = Owned::new(Payload(value));
        loop {
            if cur.tag() == EXPUNGED {
                return Err(new.into_box().0);
            }
            match self
                .p
                .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return Ok(unsafe { retire(cur, guard) }),
                Err(e) => {
                    cur = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Unconditional swap. The caller holds the map lock and has ensured the
    /// cell is not expunged.
    pub(crate) fn swap_locked<'g>(&self, value: V, guard: &'g Guard) -> Option<&'g V> {
        let prev = self
            .p
            .swap(Owned::new(Payload(value)), Ordering::AcqRel, guard);
        debug_assert_ne!(prev.tag(), EXPUNGED, "swap into an expunged cell");
        unsafe { retire(prev, guard) }
    }

    /// Load the present value, or install `value` if the cell is deleted.
    /// An expunged cell rejects the attempt and hands `value` back.
    pub(crate) fn try_load_or_store<'g>(
        &self,
        value: V,
        guard: &'g Guard,
    ) -> Result<LoadOrStore<'g, V>, V> {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        if cur.tag() == EXPUNGED {
            return Err(value);
        }
        if let Some(p) = unsafe { cur.as_ref() } {
            return Ok(LoadOrStore::Loaded(&p.0, value));
        }
        let mut new = Owned::new(Payload(value));
        loop {
            match self
                .p
                .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(stored) => return Ok(LoadOrStore::Stored(unsafe { &stored.deref().0 })),
                Err(e) => {
                    cur = e.current;
                    new = e.new;
                    if cur.tag() == EXPUNGED {
                        return Err(new.into_box().0);
                    }
                    if let Some(p) = unsafe { cur.as_ref() } {
                        return Ok(LoadOrStore::Loaded(&p.0, new.into_box().0));
                    }
                }
            }
        }
    }

    /// Load-or-store on a cell the caller, holding the map lock, has ensured
    /// is not expunged.
    pub(crate) fn load_or_store_locked<'g>(
        &self,
        value: V,
        guard: &'g Guard,
    ) -> LoadOrStore<'g, V> {
        debug_assert!(!self.is_expunged(guard), "load_or_store into an expunged cell");
        let mut cur = self.p.load(Ordering::Acquire, guard);
        let mut new = Owned::new(Payload(value));
        loop {
            if let Some(p) = unsafe { cur.as_ref() } {
                return LoadOrStore::Loaded(&p.0, new.into_box().0);
            }
            match self
                .p
                .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(stored) => return LoadOrStore::Stored(unsafe { &stored.deref().0 }),
                Err(e) => {
                    cur = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Mark the cell deleted, returning the value it held. Deleted and
    /// expunged cells are left untouched.
    pub(crate) fn delete<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        loop {
            if cur.is_null() {
                return None;
            }
            match self.p.compare_exchange(
                cur,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return unsafe { retire(cur, guard) },
                Err(e) => cur = e.current,
            }
        }
    }

    /// Replace the value with `new` if it currently equals `old`.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        match unsafe { cur.as_ref() } {
            Some(p) if p.0 == *old => {}
            _ => return false,
        }
        let mut new = Owned::new(Payload(new));
        loop {
            match self
                .p
                .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    unsafe { retire(cur, guard) };
                    return true;
                }
                Err(e) => {
                    cur = e.current;
                    new = e.new;
                    match unsafe { cur.as_ref() } {
                        Some(p) if p.0 == *old => {}
                        _ => return false,
                    }
                }
            }
        }
    }

    /// Delete the value if it currently equals `old`.
    pub(crate) fn try_compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        loop {
            match unsafe { cur.as_ref() } {
                Some(p) if p.0 == *old => {}
                _ => return false,
            }
            match self.p.compare_exchange(
                cur,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { retire(cur, guard) };
                    return true;
                }
                Err(e) => cur = e.current,
            }
        }
    }

    /// Move an expunged cell back to deleted. Returns true if it was
    /// expunged, meaning the caller must re-insert it into the dirty map.
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.p
            .compare_exchange(
                Shared::null().with_tag(EXPUNGED),
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    /// Move a deleted cell to expunged. Returns true if the cell ends up
    /// expunged and must be left out of the dirty map being seeded.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut cur = self.p.load(Ordering::Acquire, guard);
        while cur.is_null() {
            if cur.tag() == EXPUNGED {
                return true;
            }
            match self.p.compare_exchange(
                cur,
                Shared::null().with_tag(EXPUNGED),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => cur = e.current,
            }
        }
        false
    }

    pub(crate) fn is_expunged(&self, guard: &Guard) -> bool {
        self.p.load(Ordering::Acquire, guard).tag() == EXPUNGED
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        // Readers may still hold a reference taken under their own guard.
        let guard = &epoch::pin();
        let p = self.p.swap(Shared::null(), Ordering::Acquire, guard);
        unsafe { retire(p, guard) };
    }
}
