//! SyncMap: two-tier read-mostly map with a lock-free snapshot and a
//! mutex-guarded dirty map.

use crate::entry::{Entry, LoadOrStore};
use crate::reentrancy::{DebugReentrancy, ReentrancyGuard};
use core::fmt;
use core::hash::BuildHasher;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::sync::atomic::Ordering;
use std::sync::Arc;

type Cells<V, S> = HashMap<Arc<str>, Arc<Entry<V>>, S>;

/// Published, immutable key set. Cells inside it remain mutable.
struct Snapshot<V, S> {
    cells: Cells<V, S>,
}

/// State guarded by the map's mutex.
struct Dirty<V, S> {
    // None until the first write.
    cells: Option<Cells<V, S>>,
    misses: usize,
    // Set when `cells` holds a key the snapshot lacks.
    amended: bool,
}

/// Mutex guard paired with the reentrancy guard. Fields drop in order, so
/// the reentrancy mark is cleared before the mutex is released.
struct Locked<'a, V, S> {
    _entered: ReentrancyGuard<'a>,
    dirty: MutexGuard<'a, Dirty<V, S>>,
}

impl<'a, V, S> core::ops::Deref for Locked<'a, V, S> {
    type Target = Dirty<V, S>;
    fn deref(&self) -> &Dirty<V, S> {
        &self.dirty
    }
}

impl<'a, V, S> core::ops::DerefMut for Locked<'a, V, S> {
    fn deref_mut(&mut self) -> &mut Dirty<V, S> {
        &mut self.dirty
    }
}

/// A concurrent map from string keys to `V`, tuned for read-mostly use.
///
/// Reads of keys present in the published snapshot never lock. Writes to
/// those keys update their cell atomically without locking either. New keys
/// land in a mutex-guarded dirty map, which is promoted to become the next
/// snapshot once enough lookups have had to fall back to it.
///
/// Values handed back to callers are clones; `range` lends references for the
/// duration of its callback. No user code (`Clone`, `Drop`, `PartialEq`,
/// callbacks) runs while the internal mutex is held, so any of these may call
/// back into the same map.
pub struct SyncMap<V, S = RandomState> {
    snapshot: Atomic<Snapshot<V, S>>,
    dirty: Mutex<Dirty<V, S>>,
    hasher: S,
    reentrancy: DebugReentrancy,
}

impl<V> SyncMap<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<V, S> SyncMap<V, S> {
    /// Create an empty map. Nothing is allocated until the first write, and
    /// with a const-constructible hasher the map can live in a `static`.
    pub const fn with_hasher(hasher: S) -> Self {
        Self {
            snapshot: Atomic::null(),
            dirty: parking_lot::const_mutex(Dirty {
                cells: None,
                misses: 0,
                amended: false,
            }),
            hasher,
            reentrancy: DebugReentrancy::new(),
        }
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<V, S> SyncMap<V, S>
where
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn lock(&self) -> Locked<'_, V, S> {
        self.reentrancy.check();
        let dirty = self.dirty.lock();
        Locked {
            _entered: self.reentrancy.enter(),
            dirty,
        }
    }

    fn snapshot_cell<'g>(
        &self,
        key: &str,
        guard: &'g Guard,
    ) -> Option<(&'g Arc<str>, &'g Arc<Entry<V>>)> {
        let snapshot = unsafe { self.snapshot.load(Ordering::Acquire, guard).as_ref() }?;
        snapshot.cells.get_key_value(key)
    }

    /// Look `key` up in the dirty map, counting the lookup as a miss.
    fn dirty_cell(
        &self,
        dirty: &mut Dirty<V, S>,
        key: &str,
        guard: &Guard,
    ) -> Option<Arc<Entry<V>>> {
        let cell = dirty.cells.as_ref().and_then(|cells| cells.get(key)).cloned();
        self.miss_locked(dirty, guard);
        cell
    }

    /// Find the cell for `key` on the locked path: the snapshot first (it may
    /// have been promoted since the caller looked), then the dirty map.
    fn locked_cell(&self, key: &str, guard: &Guard) -> Option<Arc<Entry<V>>> {
        let mut locked = self.lock();
        match self.snapshot_cell(key, guard) {
            Some((_, cell)) => Some(Arc::clone(cell)),
            None => self.dirty_cell(&mut locked, key, guard),
        }
    }

    /// Insert `cell` under `key`, creating the dirty map on first use.
    fn insert_dirty(&self, dirty: &mut Dirty<V, S>, key: Arc<str>, cell: Arc<Entry<V>>) {
        let cells = dirty
            .cells
            .get_or_insert_with(|| HashMap::with_hasher(self.hasher.clone()));
        let prev = cells.insert(key, cell);
        debug_assert!(prev.is_none(), "two cells for one key");
        dirty.amended = true;
    }

    /// Make the snapshot cell of `key` usable by locked writers. An expunged
    /// cell is revived and put back into the dirty map.
    fn unexpunge_locked(
        &self,
        dirty: &mut Dirty<V, S>,
        key: &Arc<str>,
        cell: &Arc<Entry<V>>,
        guard: &Guard,
    ) {
        if cell.unexpunge_locked(guard) {
            self.insert_dirty(dirty, Arc::clone(key), Arc::clone(cell));
        }
    }

    fn miss_locked(&self, dirty: &mut Dirty<V, S>, guard: &Guard) {
        dirty.misses += 1;
        let len = dirty.cells.as_ref().map_or(0, HashMap::len);
        if dirty.misses < len {
            return;
        }
        self.promote_locked(dirty, guard, false);
    }

    /// Publish the dirty map as the new snapshot and re-seed a fresh dirty
    /// map with the cells that are not deleted.
    fn promote_locked(&self, dirty: &mut Dirty<V, S>, guard: &Guard, forced: bool) {
        let misses = core::mem::replace(&mut dirty.misses, 0);
        dirty.amended = false;
        let Some(cells) = dirty.cells.take() else {
            return;
        };

        let mut seeded = HashMap::with_capacity_and_hasher(cells.len(), self.hasher.clone());
        for (key, cell) in cells.iter() {
            if !cell.try_expunge_locked(guard) {
                seeded.insert(Arc::clone(key), Arc::clone(cell));
            }
        }
        log::trace!(
            "promoting {} keys ({} live) after {} misses{}",
            cells.len(),
            seeded.len(),
            misses,
            if forced { ", forced" } else { "" }
        );

        let old = self
            .snapshot
            .swap(Owned::new(Snapshot { cells }), Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
        dirty.cells = Some(seeded);
    }

    /// Shared lookup for `load` and `contains_key`.
    fn load_ref<'g>(&self, key: &str, guard: &'g Guard) -> Option<&'g V> {
        if let Some((_, cell)) = self.snapshot_cell(key, guard) {
            return cell.load(guard);
        }
        let cell = self.locked_cell(key, guard)?;
        cell.load(guard)
    }

    /// Returns a clone of the value stored for `key`, if any.
    pub fn load(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.load_ref(key, guard).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let guard = &epoch::pin();
        self.load_ref(key, guard).is_some()
    }

    fn swap_ref<'g>(&self, key: &str, value: V, guard: &'g Guard) -> Option<&'g V> {
        let value = match self.snapshot_cell(key, guard) {
            Some((_, cell)) => match cell.try_swap(value, guard) {
                Ok(prev) => return prev,
                Err(value) => value,
            },
            None => value,
        };

        let mut locked = self.lock();
        if let Some((k, cell)) = self.snapshot_cell(key, guard) {
            self.unexpunge_locked(&mut locked, k, cell, guard);
            return cell.swap_locked(value, guard);
        }
        if let Some(cell) = locked.cells.as_ref().and_then(|cells| cells.get(key)) {
            return cell.swap_locked(value, guard);
        }
        self.insert_dirty(&mut locked, Arc::from(key), Arc::new(Entry::new(value)));
        self.miss_locked(&mut locked, guard);
        None
    }

    /// Sets the value for `key`.
    pub fn store(&self, key: &str, value: V) {
        let guard = &epoch::pin();
        self.swap_ref(key, value, guard);
    }

    /// Sets the value for `key` and returns the previous one, if any.
    pub fn swap(&self, key: &str, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.swap_ref(key, value, guard).cloned()
    }

    fn load_or_store_ref<'g>(
        &self,
        key: &str,
        value: V,
        guard: &'g Guard,
    ) -> LoadOrStore<'g, V> {
        let value = match self.snapshot_cell(key, guard) {
            Some((_, cell)) => match cell.try_load_or_store(value, guard) {
                Ok(outcome) => return outcome,
                Err(value) => value,
            },
            None => value,
        };

        let mut locked = self.lock();
        if let Some((k, cell)) = self.snapshot_cell(key, guard) {
            self.unexpunge_locked(&mut locked, k, cell, guard);
            return cell.load_or_store_locked(value, guard);
        }
        let outcome = match locked.cells.as_ref().and_then(|cells| cells.get(key)) {
            Some(cell) => cell.load_or_store_locked(value, guard),
            // Only a key absent everywhere gets a fresh cell.
            None => {
                let cell = Arc::new(Entry::empty());
                let outcome = cell.load_or_store_locked(value, guard);
                self.insert_dirty(&mut locked, Arc::from(key), cell);
                outcome
            }
        };
        self.miss_locked(&mut locked, guard);
        outcome
    }

    /// Returns the existing value for `key` if present. Otherwise stores
    /// `value` and returns it. The flag is true if the value was loaded.
    pub fn load_or_store(&self, key: &str, value: V) -> (V, bool)
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        match self.load_or_store_ref(key, value, guard) {
            LoadOrStore::Loaded(v, _unused) => (v.clone(), true),
            LoadOrStore::Stored(v) => (v.clone(), false),
        }
    }

    /// Like `load_or_store`, but builds the value only when `key` is absent.
    /// `f` runs without any lock held and may lose a race with a concurrent
    /// writer, in which case its value is dropped and the winner's returned.
    pub fn load_or_store_with<F>(&self, key: &str, f: F) -> (V, bool)
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        {
            let guard = &epoch::pin();
            if let Some(v) = self.load_ref(key, guard) {
                return (v.clone(), true);
            }
        }
        self.load_or_store(key, f())
    }

    fn delete_ref<'g>(&self, key: &str, guard: &'g Guard) -> Option<&'g V> {
        if let Some((_, cell)) = self.snapshot_cell(key, guard) {
            return cell.delete(guard);
        }
        let cell = self.locked_cell(key, guard)?;
        cell.delete(guard)
    }

    /// Removes `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) {
        let guard = &epoch::pin();
        self.delete_ref(key, guard);
    }

    /// Removes `key` and returns the value it held, if any.
    pub fn load_and_delete(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.delete_ref(key, guard).cloned()
    }

    /// Replaces the value for `key` with `new` if it currently equals `old`.
    pub fn compare_and_swap(&self, key: &str, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        if let Some((_, cell)) = self.snapshot_cell(key, guard) {
            return cell.try_compare_and_swap(old, new, guard);
        }
        match self.locked_cell(key, guard) {
            Some(cell) => cell.try_compare_and_swap(old, new, guard),
            None => false,
        }
    }

    /// Deletes `key` if its value currently equals `old`.
    pub fn compare_and_delete(&self, key: &str, old: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = &epoch::pin();
        if let Some((_, cell)) = self.snapshot_cell(key, guard) {
            return cell.try_compare_and_delete(old, guard);
        }
        match self.locked_cell(key, guard) {
            Some(cell) => cell.try_compare_and_delete(old, guard),
            None => false,
        }
    }

    /// Calls `visit` for each live key and value until it returns false.
    ///
    /// Pending new keys are promoted first, so every key stored before the
    /// call is visited. No lock is held while `visit` runs; it may call any
    /// method on this map, including `range`. Keys written concurrently may
    /// or may not be visited, and a value may reflect any write made during
    /// the call. Each key is visited at most once.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        let guard = &epoch::pin();
        {
            let mut locked = self.lock();
            if locked.amended {
                self.promote_locked(&mut locked, guard, true);
            }
        }
        let snapshot = self.snapshot.load(Ordering::Acquire, guard);
        let Some(snapshot) = (unsafe { snapshot.as_ref() }) else {
            return;
        };
        for (key, cell) in snapshot.cells.iter() {
            if let Some(value) = cell.load(guard) {
                if !visit(key.as_ref(), value) {
                    break;
                }
            }
        }
    }

    /// Number of live keys. Walks the whole map.
    pub fn len(&self) -> usize {
        let mut n = 0;
        self.range(|_, _| {
            n += 1;
            true
        });
        n
    }

    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.range(|_, _| {
            empty = false;
            false
        });
        empty
    }

    /// Deletes every key. Readers already holding the previous snapshot keep
    /// seeing it until they look again.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let cells = {
            let mut locked = self.lock();
            let old = self.snapshot.swap(Shared::null(), Ordering::AcqRel, guard);
            if !old.is_null() {
                unsafe { guard.defer_destroy(old) };
            }
            locked.misses = 0;
            locked.amended = false;
            locked.cells.take()
        };
        // Dropped outside the lock.
        drop(cells);
    }
}

impl<V, S> Drop for SyncMap<V, S> {
    fn drop(&mut self) {
        // `&mut self` rules out concurrent readers of the snapshot.
        let guard = unsafe { epoch::unprotected() };
        let snapshot = self.snapshot.swap(Shared::null(), Ordering::Acquire, guard);
        if !snapshot.is_null() {
            drop(unsafe { snapshot.into_owned() });
        }
    }
}

impl<V, S> Default for SyncMap<V, S>
where
    V: Send + Sync + 'static,
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<V, S> fmt::Debug for SyncMap<V, S>
where
    V: fmt::Debug + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        self.range(|k, v| {
            m.entry(&k, v);
            true
        });
        m.finish()
    }
}

impl<K, V, S> Extend<(K, V)> for SyncMap<V, S>
where
    K: AsRef<str>,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.store(k.as_ref(), v);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for SyncMap<V, S>
where
    K: AsRef<str>,
    V: Send + Sync + 'static,
    S: BuildHasher + Clone + Default + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut m = Self::default();
        m.extend(iter);
        m
    }
}
