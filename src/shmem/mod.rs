//! # Cross-Process Synchronization
//!
//! Reader/writer access to a store is arbitrated by a lock table in a POSIX
//! shared-memory object, separate from the store file itself. The table
//! holds:
//!
//! - `global` — serializes enumeration and user write transactions against
//!   all point operations (point ops hold it shared, enumerate holds it
//!   exclusive)
//! - `shards[N]` — one lock per hash shard; point reads take theirs shared,
//!   point writes exclusive
//! - `wo` — the session lock enforcing "at most one write-exclusive opener";
//!   read-only and read-write openers hold it shared for their whole
//!   session, the write-only opener promotes to exclusive
//!
//! Lock ordering for a point operation is shard lock first, then `global`
//! shared. The write-only session lock is only touched at open and close.
//!
//! See `rwlock` for the lock itself and `region` for bootstrap, crash
//! recovery and the per-process region registry.

mod region;
mod rwlock;

pub use region::{Locks, MutexRegion};
pub use rwlock::{ExclusiveGuard, SharedGuard, ShmRwLock};
