//! read-mostly-map: a concurrent map from string keys to values, built for
//! workloads that mostly read a stable key set and write occasionally.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let many threads share a mutable string-keyed map without
//!   serializing every read behind one mutex.
//! - Layers:
//!   - Entry<V>: per-key cell holding a tagged atomic pointer to the
//!     current value; present, deleted or expunged. Values are retired
//!     through the epoch collector, never freed under a reader.
//!   - Snapshot: an immutable key -> cell table published through one
//!     atomic pointer; readers pick it up without locking.
//!   - Dirty map: key -> cell table behind a mutex holding keys the
//!     snapshot lacks, plus a miss counter.
//!   - SyncMap<V, S>: public API; every operation tries the snapshot
//!     first and falls back to the dirty map under the lock.
//!
//! Constraints
//! - One cell per key: when a key is in both tables, both hold the same
//!   `Arc<Entry>`. A new cell is only allocated for a key absent from both.
//! - Deletion marks the cell empty in place; the table entry stays until
//!   the dirty map is next re-seeded.
//! - The dirty map, once created, holds every snapshot key except expunged
//!   ones. Writers revive an expunged cell only under the lock, re-inserting
//!   it into the dirty map first.
//! - A never-written map allocates nothing and behaves as empty.
//!
//! Promotion
//! - Each lock-path lookup counts as a miss. When misses reach the dirty
//!   map's size, the dirty map becomes the snapshot in a single pointer swap
//!   and a fresh dirty map is seeded from its live cells. The O(n) rebuild is
//!   paid at most once per n fallbacks.
//! - `range` promotes first whenever the dirty map holds keys the snapshot
//!   lacks, so iteration never touches the lock.
//!
//! Reentrancy policy
//! - The lock is never held across user code: `Clone`, `Drop` and
//!   `PartialEq` of values and `range` callbacks all run after it is
//!   released, so they may call back into the same map. Only the hasher
//!   runs under the lock.
//! - A debug-only reentrancy guard around the lock turns an accidental
//!   nested acquisition into a panic instead of a deadlock.
//!
//! Notes and non-goals
//! - No key ordering, no capacity bound, keys are strings only.
//! - No error type: absence is reported through `Option` and `bool`.

mod entry;
mod reentrancy;
mod sync_map;

// Public surface
pub use sync_map::SyncMap;
