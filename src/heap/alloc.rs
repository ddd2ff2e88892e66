//! In-segment allocator.
//!
//! A first-fit free list threaded through the data area, with a bump pointer
//! for virgin space. Every allocation is preceded by a 16-byte block header
//! recording its size; freeing pushes the block onto the list head. There is
//! no coalescing: dropped space is reclaimed either by reuse or by
//! `shrink_to_fit` once the store is closed.
//!
//! All allocator state (high-water mark, list head, free-byte count) lives
//! in the segment header, so it is shared by every process mapping the file
//! and survives reopen. Writers in *different* shards allocate concurrently,
//! so allocator mutation is serialized by the in-file allocator lock — the
//! shard locks only protect the tables, not this shared state.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{ALLOC_ALIGN, DATA_OFFSET};
use crate::error::StoreError;

use super::segment::{align_up, AllocState, MappedHeap};

pub(crate) const BLOCK_HEADER_SIZE: u64 = 16;

/// A free block keeps at least one extra allocation's worth of slack before
/// it is split, so the remainder stays usable.
const MIN_SPLIT: u64 = 32;

/// Precedes every allocation. `next` is meaningful only while the block sits
/// on the free list.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlockHeader {
    size: U64,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() as u64 == BLOCK_HEADER_SIZE);

impl BlockHeader {
    fn new(size: u64, next: u64) -> Self {
        Self {
            size: U64::new(size),
            next: U64::new(next),
        }
    }

    crate::zerocopy_accessors! {
        size: u64,
        next: u64,
    }
}

impl MappedHeap {
    /// Allocates `size` bytes inside the segment, returning the payload
    /// offset. Fails with [`StoreError::OutOfSpace`] when neither the free
    /// list nor the bump region can satisfy the request; the store façade
    /// reacts to that kind by growing the file and retrying.
    pub fn alloc(&self, size: u64) -> Result<u64> {
        // Checked before touching the lock word: it lives in the mapping,
        // and a read-only mapping cannot even spin on it.
        ensure!(!self.is_readonly(), StoreError::ReadOnly);
        let need = align_up(size.max(1), ALLOC_ALIGN) + BLOCK_HEADER_SIZE;

        let _alloc_lock = self.lock_allocator();
        let mut state = self.alloc_state()?;

        // First fit over the free list.
        let mut prev = 0u64;
        let mut cur = state.free_head();
        while cur != 0 {
            let block: BlockHeader = self.read_obj(cur)?;
            if block.size() >= need {
                let taken = if block.size() - need >= MIN_SPLIT {
                    // Split: the remainder keeps the list position.
                    let rem_off = cur + need;
                    let rem = BlockHeader::new(block.size() - need, block.next());
                    self.write_obj(rem_off, &rem)?;
                    self.relink(&mut state, prev, rem_off)?;
                    need
                } else {
                    self.relink(&mut state, prev, block.next())?;
                    block.size()
                };
                state.set_free_bytes(state.free_bytes() - taken);
                self.write_obj(cur, &BlockHeader::new(taken, 0))?;
                self.write_alloc_state(&state)?;
                return Ok(cur + BLOCK_HEADER_SIZE);
            }
            prev = cur;
            cur = block.next();
        }

        // Bump allocation from virgin space.
        let off = align_up(state.alloc_high(), ALLOC_ALIGN);
        let end = off.checked_add(need).ok_or_else(|| {
            eyre::Report::new(StoreError::corrupt(self.path(), "allocation overflow"))
        })?;
        if end > self.size() {
            return Err(StoreError::OutOfSpace {
                needed: need,
                free: free_memory_of(&state, self.size()),
            }
            .into());
        }

        state.set_alloc_high(end);
        self.write_obj(off, &BlockHeader::new(need, 0))?;
        self.write_alloc_state(&state)?;
        Ok(off + BLOCK_HEADER_SIZE)
    }

    /// Allocates and zero-fills. Fresh file pages are already zeroed, but a
    /// recycled free-list block is not.
    pub fn alloc_zeroed(&self, size: u64) -> Result<u64> {
        let off = self.alloc(size)?;
        self.zero(off, size)?;
        Ok(off)
    }

    /// Returns the payload at `payload_off` to the free list.
    pub fn free(&self, payload_off: u64) -> Result<()> {
        ensure!(!self.is_readonly(), StoreError::ReadOnly);
        ensure!(
            payload_off >= DATA_OFFSET + BLOCK_HEADER_SIZE,
            StoreError::corrupt(self.path(), format!("free of bad offset {}", payload_off))
        );
        let block_off = payload_off - BLOCK_HEADER_SIZE;

        let _alloc_lock = self.lock_allocator();
        let mut state = self.alloc_state()?;

        let mut block: BlockHeader = self.read_obj(block_off)?;
        ensure!(
            block.size() >= BLOCK_HEADER_SIZE && block_off + block.size() <= state.alloc_high(),
            StoreError::corrupt(self.path(), format!("free of bad block at {}", block_off))
        );

        block.set_next(state.free_head());
        self.write_obj(block_off, &block)?;
        state.set_free_head(block_off);
        state.set_free_bytes(state.free_bytes() + block.size());
        self.write_alloc_state(&state)
    }

    /// Bytes still allocatable: untouched bump space plus the free list.
    pub fn free_memory(&self) -> Result<u64> {
        Ok(free_memory_of(&self.alloc_state()?, self.size()))
    }

    fn relink(&self, state: &mut AllocState, prev: u64, next: u64) -> Result<()> {
        if prev == 0 {
            state.set_free_head(next);
            Ok(())
        } else {
            let mut prev_block: BlockHeader = self.read_obj(prev)?;
            prev_block.set_next(next);
            self.write_obj(prev, &prev_block)
        }
    }
}

fn free_memory_of(state: &AllocState, segment_size: u64) -> u64 {
    segment_size - state.alloc_high() + state.free_bytes()
}
