//! # Mapped Heap
//!
//! This module implements the file-backed heap that holds every byte of a
//! store: a single memory-mapped segment with an in-segment allocator and a
//! small named-object registry. The hash index (`crate::index`) and the value
//! cells (`crate::cell`) live entirely inside this segment.
//!
//! ## Segment Layout
//!
//! ```text
//! offset 0      +--------------------------+
//!               | header region (128 B)    |  magic, layout version, crc,
//!               |                          |  segment size, allocator
//!               |                          |  lock + state
//! offset 128    +--------------------------+
//!               | Registry (16 x 32 B)     |  name -> offset slots
//! offset 640    +--------------------------+
//!               |                          |
//!               | data area                |  8-byte aligned allocations,
//!               | (grows toward the end)   |  each preceded by a 16-byte
//!               |                          |  block header
//!               +--------------------------+
//! ```
//!
//! ## Offsets, Not Pointers
//!
//! Every reference stored inside the segment is a byte offset from the start
//! of the mapping, never a raw pointer. Different processes map the same file
//! at different addresses; offsets resolve correctly in all of them.
//!
//! ## Concurrency Model
//!
//! Readers take `&self` and receive slices borrowed from the mapping;
//! writers also take `&self` but require the caller to hold the exclusive
//! shard (or global) lock from `crate::shmem` covering the bytes they
//! touch. The one piece of state shared *across* shards — the allocator's
//! bookkeeping — is guarded by a lock word inside the segment header
//! itself, taken by `alloc`/`free` internally, so writers in different
//! shards allocate safely without any wider lock. Growing the file requires
//! `&mut self`, so the borrow checker guarantees no outstanding slices when
//! the mapping is replaced, and the store façade additionally guarantees the
//! write-only lock is held exclusively (no other process is mapped at all).
//!
//! ## Growth And Shrink
//!
//! `grow` flushes, extends the file with `set_len`, and remaps; all offsets
//! remain valid because the segment only ever extends. `shrink_to_fit` is a
//! static operation on a closed (unmapped) file: it truncates to the
//! allocator's high-water mark and restamps the header.

mod alloc;
mod registry;
mod segment;

pub use segment::{MappedHeap, SegmentHeader, LAYOUT_VERSION, SEGMENT_MAGIC};

pub(crate) use alloc::BLOCK_HEADER_SIZE;
