//! # mmstore Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SHARD_COUNT (64)
//!       │
//!       ├─> shard selection: hash & (SHARD_COUNT - 1)
//!       │     SHARD_COUNT must stay a power of two, and it is baked into the
//!       │     on-disk shard directory. Changing it is a file format change.
//!       │
//!       └─> Locks in the shared-mutex region: one lock per shard plus the
//!           global and write-only locks (SHARD_COUNT + 2 lock words).
//!
//! SEGMENT_HEADER_SIZE (128 bytes)
//!       │
//!       ├─> REGISTRY_OFFSET (the named-object registry starts right after
//!       │     the header)
//!       │
//!       └─> DATA_OFFSET (derived: header + registry; first allocatable byte)
//!
//! MIN_FILE_SIZE (10 KiB)
//!       │
//!       └─> Must hold the header, the registry, the version cell, the shard
//!           directory and 64 minimum-size bucket arrays. 64 shards at
//!           MIN_SHARD_BUCKETS buckets of 32 bytes is 16 KiB of buckets on
//!           its own, so fresh stores are created at least one growth step
//!           above this floor; the floor only bounds what open will accept.
//!
//! MAX_LOAD_NUM / MAX_LOAD_DEN (7/8)
//!       │
//!       └─> Shard tables rehash when (len + tombstones) exceeds this
//!           fraction of capacity. Open addressing requires < 1.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `SHARD_COUNT.is_power_of_two()` (shard selection uses a mask)
//! 2. `DATA_OFFSET == SEGMENT_HEADER_SIZE + REGISTRY_CAPACITY * REGISTRY_ENTRY_SIZE`
//! 3. `MIN_SHARD_BUCKETS.is_power_of_two()` (probe sequence uses a mask)
//!
//! These are enforced by compile-time assertions at the bottom of this file.

/// Number of independent sub-tables (and per-shard locks) in the hash index.
///
/// A key's stable hash modulo this fanout selects its shard. The value is
/// part of the file format: the `"properties"` object is a directory of
/// exactly this many shard headers.
pub const SHARD_COUNT: usize = 64;

/// Default initial segment size when `initial_size_kib` is 0: 5 MiB.
pub const DEFAULT_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Default maximum segment size when `max_size_kib` is 0: 5000 MiB.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5000 * 1024 * 1024;

/// Smallest segment the store will create or open.
///
/// Must hold the segment header, the registry and the version cell with room
/// left over for the shard directory.
pub const MIN_FILE_SIZE: u64 = 10 * 1024;

/// Default total bucket count when `initial_bucket_count` is 0.
///
/// Divided across shards at create time.
pub const DEFAULT_BUCKET_COUNT: u32 = 1024;

/// Minimum bucket-array capacity of a single shard. Power of two.
pub const MIN_SHARD_BUCKETS: u32 = 8;

/// Shard tables rehash when occupancy exceeds MAX_LOAD_NUM/MAX_LOAD_DEN.
pub const MAX_LOAD_NUM: u64 = 7;
pub const MAX_LOAD_DEN: u64 = 8;

/// Bounded wait applied to the write-only lock at open and to the trial
/// lock during shared-mutex bootstrap. Timing out the trial lock triggers
/// in-place re-initialization of the lock region.
pub const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Size of the segment header at offset 0.
pub const SEGMENT_HEADER_SIZE: usize = 128;

/// Named-object registry geometry. 16 slots of 32 bytes each, directly
/// after the header. The store itself uses two slots ("version" and
/// "properties").
pub const REGISTRY_OFFSET: u64 = SEGMENT_HEADER_SIZE as u64;
pub const REGISTRY_CAPACITY: usize = 16;
pub const REGISTRY_NAME_LEN: usize = 24;
pub const REGISTRY_ENTRY_SIZE: usize = 32;

/// First allocatable offset in the segment.
pub const DATA_OFFSET: u64 =
    REGISTRY_OFFSET + (REGISTRY_CAPACITY * REGISTRY_ENTRY_SIZE) as u64;

/// All heap allocations are rounded up to this alignment.
pub const ALLOC_ALIGN: u64 = 8;

/// File format version stamped into the `"version"` named object.
/// Version 0 (a file predating the version cell) is also accepted on open.
pub const FILE_FORMAT_VERSION: u32 = 1;

/// Suggested base address for mapping the shared-mutex region, for callers
/// on platforms where default shared-memory placement differs between
/// processes. A tunable, not a contract: mmstore's lock words hold no
/// internal pointers, so pinning is never required for correctness.
pub const DEFAULT_MAP_BASE_ADDR: usize = 0x4000_0000_0000;

const _: () = assert!(SHARD_COUNT.is_power_of_two());
const _: () = assert!(MIN_SHARD_BUCKETS.is_power_of_two());
const _: () = assert!(
    DATA_OFFSET as usize
        == SEGMENT_HEADER_SIZE + REGISTRY_CAPACITY * REGISTRY_ENTRY_SIZE
);
const _: () = assert!(MIN_FILE_SIZE > DATA_OFFSET);
