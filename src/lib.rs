//! # mmstore - Memory-Mapped Multi-Process Key-Value Store
//!
//! mmstore is a persistent, string-keyed associative store backed by a
//! single memory-mapped file. Many processes read it concurrently; one
//! process at a time may own it for writing. This implementation
//! prioritizes:
//!
//! - **Zero-copy reads**: `get` returns a view into the mapping, no
//!   intermediate buffers
//! - **Cross-process correctness**: lock state lives in shared memory,
//!   offsets (never pointers) live in the file
//! - **Predictable growth**: the file grows in place, only under the
//!   exclusive writer, and shrinks to fit on close
//!
//! ## Quick Start
//!
//! ```ignore
//! use mmstore::{Mode, OpenOptions};
//!
//! let store = OpenOptions::new("/tmp/cache")
//!     .mode(Mode::WriteOnly)
//!     .open()?;
//!
//! store.set("greeting", "hello")?;
//! store.set("pi", 3.14159)?;
//!
//! let value = store.get("greeting")?.unwrap();
//! assert_eq!(value.as_str()?, "hello");
//!
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Store façade (open/CRUD)         │
//! ├──────────────────┬──────────────────────┤
//! │ Sharded hash     │  Write transactions  │
//! │ index (64 way)   │  and cursors         │
//! ├──────────────────┴──────────────────────┤
//! │   Mapped heap (allocator + registry)    │
//! ├─────────────────────────────────────────┤
//! │  Segment file (mmap)  │ Shared-mutex    │
//! │                       │ region (shm)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Two kernel objects per store: the segment file holding every entry, and
//! a POSIX shared-memory object holding the lock table (global lock, one
//! lock per shard, and the write-only session lock).
//!
//! ## Access Modes
//!
//! | mode | mapping | write-only lock | may grow file |
//! |------|---------|-----------------|---------------|
//! | `ro` | read-only | shared        | no            |
//! | `rw` | read-write | shared       | no            |
//! | `wo` | read-write | exclusive    | yes           |
//!
//! A second `wo` opener anywhere on the host fails with `BusyWriteOnly`
//! within a bounded wait; a `wo` opener finding readers fails with `Busy`.
//!
//! ## Consistency
//!
//! Point operations on one key are linearizable (serialized by that key's
//! shard lock). Writes to different shards interleave freely. `keys()` is
//! a full linearization point. Cursor iteration sees each shard as of the
//! moment it is visited, not one instant for the whole store.
//!
//! ## Crash Recovery
//!
//! A process dying inside a critical section leaves its lock abandoned;
//! the next opener's bounded trial lock detects this and re-initializes
//! the lock table in place. The segment itself is validated on open
//! (magic, checksum, size, table presence) and refused as `Corrupt` on
//! mismatch.
//!
//! ## Module Overview
//!
//! - [`store`]: façade — open/close, CRUD, enumerate, cursors, transactions
//! - [`heap`]: mapped segment, in-segment allocator, named-object registry
//! - [`shmem`]: inter-process lock table and its bootstrap
//! - [`index`]: stable key hashing and the 64 shard tables
//! - [`cell`]: tagged value cells and their views
//! - [`reserved`]: method-name filter for binding layers
//! - [`error`]: typed error kinds carried in `eyre` reports

#[macro_use]
mod macros;

pub mod cell;
pub mod config;
pub mod error;
pub mod heap;
pub mod index;
pub mod reserved;
pub mod shmem;
pub mod store;

pub use cell::{OwnedValue, Value};
pub use error::StoreError;
pub use reserved::is_reserved;
pub use store::{Mode, OpenOptions, Store, StoreIter, ValueRef, WriteTxn};
