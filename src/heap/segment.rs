//! File-backed segment with zero-copy access.
//!
//! `MappedHeap` wraps a memory-mapped file and exposes bounds-checked reads
//! and writes by offset. It is the lowest layer of the store; everything
//! above it (allocator, registry, shard tables, cells) speaks in offsets
//! into this mapping.
//!
//! ## Header Geometry
//!
//! The first 128 bytes are the segment header, split into independently
//! written pieces so their writers never clobber each other:
//!
//! ```text
//! offset  0   SegmentHeader  magic, layout version, crc, segment size
//!             (rewritten only at create/grow/shrink, when the writer is
//!              exclusive by construction)
//! offset 32   allocator lock word (always accessed atomically)
//! offset 40   AllocState     bump high-water, free-list head, free bytes
//!             (rewritten by alloc/free under the allocator lock)
//! offset 64   reserved
//! ```
//!
//! ## Safety Considerations
//!
//! The mapping is `MAP_SHARED`: other processes observe writes directly.
//! Mutation through `&self` is sound only while the caller holds the
//! exclusive inter-process lock covering the touched region, which is the
//! store façade's job. Remapping (during `grow`) requires `&mut self`, so
//! the compiler ensures no slice borrowed from the old mapping survives it.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapRaw};
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DATA_OFFSET, MIN_FILE_SIZE, SEGMENT_HEADER_SIZE};
use crate::error::StoreError;

/// Identifies an mmstore segment file. Sixteen bytes, NUL padded.
pub const SEGMENT_MAGIC: &[u8; 16] = b"mmstore segmnt\x00\x00";

/// Version of the segment layout itself (header + registry + allocator).
/// Distinct from the `"version"` named object, which tracks the cell format.
pub const LAYOUT_VERSION: u32 = 1;

pub(crate) const ALLOC_LOCK_OFFSET: u64 = 32;
pub(crate) const ALLOC_STATE_OFFSET: u64 = 40;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Segment identity at offset 0. Rewritten only while the writer is
/// exclusive: at create (pre-publication), grow (write-only opener holds
/// the file alone) and shrink (file unmapped everywhere).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SegmentHeader {
    magic: [u8; 16],
    layout_version: U32,
    crc: U32,
    segment_size: U64,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == 32);

/// Allocator bookkeeping at offset 40, guarded by the in-file allocator
/// lock word.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AllocState {
    alloc_high: U64,
    free_head: U64,
    free_bytes: U64,
}

const _: () = assert!(std::mem::size_of::<AllocState>() == 24);
const _: () =
    assert!((ALLOC_STATE_OFFSET as usize + std::mem::size_of::<AllocState>()) <= SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    fn new(segment_size: u64) -> Self {
        Self {
            magic: *SEGMENT_MAGIC,
            layout_version: U32::new(LAYOUT_VERSION),
            crc: U32::new(checksum(segment_size)),
            segment_size: U64::new(segment_size),
        }
    }

    crate::zerocopy_getters! {
        segment_size: u64,
        layout_version: u32,
    }

    /// Restamps `segment_size` and the checksum that covers it.
    pub fn stamp_size(&mut self, segment_size: u64) {
        self.segment_size = U64::new(segment_size);
        self.crc = U32::new(checksum(segment_size));
    }

    fn validate(&self, path: &Path, file_size: u64) -> Result<()> {
        ensure!(
            &self.magic == SEGMENT_MAGIC,
            StoreError::corrupt(path, "bad segment magic")
        );
        ensure!(
            self.layout_version() == LAYOUT_VERSION,
            StoreError::corrupt(
                path,
                format!("unsupported segment layout {}", self.layout_version())
            )
        );
        ensure!(
            self.crc.get() == checksum(self.segment_size()),
            StoreError::corrupt(path, "segment header checksum mismatch")
        );
        ensure!(
            self.segment_size() == file_size,
            StoreError::corrupt(path, "segment size does not match file size")
        );
        Ok(())
    }
}

impl AllocState {
    fn new() -> Self {
        Self {
            alloc_high: U64::new(DATA_OFFSET),
            free_head: U64::new(0),
            free_bytes: U64::new(0),
        }
    }

    crate::zerocopy_accessors! {
        alloc_high: u64,
        free_head: u64,
        free_bytes: u64,
    }

    fn validate(&self, path: &Path, segment_size: u64) -> Result<()> {
        ensure!(
            self.alloc_high() >= DATA_OFFSET && self.alloc_high() <= segment_size,
            StoreError::corrupt(path, "allocator high-water mark out of range")
        );
        Ok(())
    }
}

/// Checksum over the fields that define the segment's identity: magic,
/// layout version and size. Allocator bookkeeping churns on every write and
/// is deliberately not covered.
fn checksum(segment_size: u64) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(SEGMENT_MAGIC);
    digest.update(&LAYOUT_VERSION.to_le_bytes());
    digest.update(&segment_size.to_le_bytes());
    digest.finalize()
}

#[derive(Debug)]
enum Mapping {
    ReadWrite(MmapRaw),
    ReadOnly(Mmap),
}

impl Mapping {
    fn ptr(&self) -> *const u8 {
        match self {
            Mapping::ReadWrite(m) => m.as_ptr() as *const u8,
            Mapping::ReadOnly(m) => m.as_ptr(),
        }
    }
}

#[derive(Debug)]
pub struct MappedHeap {
    file: File,
    mapping: Mapping,
    len: u64,
    path: PathBuf,
    readonly: bool,
}

impl MappedHeap {
    /// Creates a fresh segment file of `initial_size` bytes and maps it.
    ///
    /// The file must not exist; the store façade serializes creators through
    /// the global lock before calling this.
    pub fn create<P: AsRef<Path>>(path: P, initial_size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_size >= MIN_FILE_SIZE,
            "initial segment size {} below minimum {}",
            initial_size,
            MIN_FILE_SIZE
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        file.set_len(initial_size)
            .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), initial_size))?;

        let mmap = MmapRaw::map_raw(&file)
            .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;

        let heap = Self {
            file,
            mapping: Mapping::ReadWrite(mmap),
            len: initial_size,
            path: path.to_path_buf(),
            readonly: false,
        };

        heap.write_obj(0, &SegmentHeader::new(initial_size))?;
        heap.write_obj(ALLOC_STATE_OFFSET, &AllocState::new())?;

        debug!(path = %heap.path.display(), size = initial_size, "created segment");
        Ok(heap)
    }

    /// Maps an existing segment read-write and validates its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), false)
    }

    /// Maps an existing segment read-only and validates its header.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, readonly: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size >= MIN_FILE_SIZE,
            StoreError::corrupt(path, "file smaller than the minimum segment")
        );

        let mapping = if readonly {
            // SAFETY: Mmap::map is unsafe because the file could be modified
            // externally while mapped. This is safe for the store's access
            // pattern because:
            // 1. Writers never truncate while readers are open (growth is
            //    restricted to the write-only opener, which excludes readers)
            // 2. Concurrent in-place writes are fenced by the shared-mutex
            //    region; readers only dereference under a shard lock
            // 3. All access goes through bytes()/read_obj(), which bounds-check
            let mmap = unsafe {
                Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
            };
            Mapping::ReadOnly(mmap)
        } else {
            let mmap = MmapRaw::map_raw(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?;
            Mapping::ReadWrite(mmap)
        };

        let heap = Self {
            file,
            mapping,
            len: file_size,
            path: path.to_path_buf(),
            readonly,
        };

        let header = heap.header()?;
        header.validate(path, file_size)?;
        heap.alloc_state()?.validate(path, header.segment_size())?;

        debug!(path = %path.display(), size = file_size, readonly, "opened segment");
        Ok(heap)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Current segment (and file) size in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn header(&self) -> Result<SegmentHeader> {
        self.read_obj(0)
    }

    pub(crate) fn alloc_state(&self) -> Result<AllocState> {
        self.read_obj(ALLOC_STATE_OFFSET)
    }

    pub(crate) fn write_alloc_state(&self, state: &AllocState) -> Result<()> {
        self.write_obj(ALLOC_STATE_OFFSET, state)
    }

    /// The in-file allocator lock word. Placed in the header page, which is
    /// mapped for the segment's whole lifetime.
    fn alloc_lock_word(&self) -> &AtomicU32 {
        // SAFETY: ALLOC_LOCK_OFFSET is 4-aligned, within the mapping (the
        // file is never below MIN_FILE_SIZE), and only ever accessed through
        // atomic operations by every process mapping this file.
        unsafe { &*(self.mapping.ptr().add(ALLOC_LOCK_OFFSET as usize) as *const AtomicU32) }
    }

    /// Serializes allocator-state mutation across all shards and processes.
    /// Writers in different shards contend here and nowhere else.
    pub(crate) fn lock_allocator(&self) -> AllocLockGuard<'_> {
        let word = self.alloc_lock_word();
        let mut spins = 0u32;
        while word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < 100 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            spins = spins.saturating_add(1);
        }
        AllocLockGuard { word }
    }

    /// Forces the allocator lock open. Called at open time, under the
    /// global lock held exclusively: no writer can legitimately be
    /// mid-allocation then, so a set bit can only be a crashed holder's.
    pub(crate) fn clear_alloc_lock(&self) {
        if !self.readonly {
            self.alloc_lock_word().store(0, Ordering::Release);
        }
    }

    /// Borrows `len` bytes of the mapping starting at `off`.
    pub fn bytes(&self, off: u64, len: u64) -> Result<&[u8]> {
        let end = off
            .checked_add(len)
            .ok_or_else(|| eyre::Report::new(StoreError::corrupt(&self.path, "offset overflow")))?;
        ensure!(
            end <= self.len,
            StoreError::corrupt(
                &self.path,
                format!("offset range {}..{} exceeds segment size {}", off, end, self.len)
            )
        );

        // SAFETY: the range was bounds-checked against the mapping length,
        // and the returned slice borrows &self, so it cannot outlive a remap
        // (grow takes &mut self). Concurrent writers to this range are
        // excluded by the caller's shard lock.
        Ok(unsafe { std::slice::from_raw_parts(self.mapping.ptr().add(off as usize), len as usize) })
    }

    /// Reads a copy of `T` from `off`. Tolerates unaligned offsets.
    pub fn read_obj<T: FromBytes>(&self, off: u64) -> Result<T> {
        let bytes = self.bytes(off, std::mem::size_of::<T>() as u64)?;
        T::read_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("failed to decode object at offset {}: {:?}", off, e))
    }

    /// Writes raw bytes at `off`.
    ///
    /// The caller must hold the exclusive lock covering this region; the
    /// shared-mutex layer, not the borrow checker, is what makes concurrent
    /// use of `&self` here race-free across processes.
    pub fn write_bytes(&self, off: u64, data: &[u8]) -> Result<()> {
        if self.readonly {
            bail!(StoreError::ReadOnly);
        }
        let end = off
            .checked_add(data.len() as u64)
            .ok_or_else(|| eyre::Report::new(StoreError::corrupt(&self.path, "offset overflow")))?;
        ensure!(
            end <= self.len,
            StoreError::corrupt(
                &self.path,
                format!("write {}..{} exceeds segment size {}", off, end, self.len)
            )
        );

        // SAFETY: bounds-checked above; the mapping is read-write (checked
        // above); exclusion from concurrent access to this range is provided
        // by the inter-process lock the caller holds.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapping.ptr().add(off as usize) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    /// Writes `T` at `off` via its byte representation.
    pub fn write_obj<T: IntoBytes + Immutable + ?Sized>(&self, off: u64, val: &T) -> Result<()> {
        self.write_bytes(off, val.as_bytes())
    }

    /// Zero-fills `len` bytes at `off`.
    pub fn zero(&self, off: u64, len: u64) -> Result<()> {
        if self.readonly {
            bail!(StoreError::ReadOnly);
        }
        let end = off
            .checked_add(len)
            .ok_or_else(|| eyre::Report::new(StoreError::corrupt(&self.path, "offset overflow")))?;
        ensure!(
            end <= self.len,
            StoreError::corrupt(
                &self.path,
                format!("zero {}..{} exceeds segment size {}", off, end, self.len)
            )
        );

        // SAFETY: same argument as write_bytes.
        unsafe {
            std::ptr::write_bytes(self.mapping.ptr().add(off as usize) as *mut u8, 0, len as usize);
        }
        Ok(())
    }

    /// Raw pointer to `off`, for guard-tied value views. The pointee stays
    /// valid for as long as the mapping does.
    pub(crate) fn ptr_at(&self, off: u64, len: u64) -> Result<*const u8> {
        self.bytes(off, len).map(|s| s.as_ptr())
    }

    /// Flushes dirty pages back to the file with `msync`.
    pub fn flush(&self) -> Result<()> {
        match &self.mapping {
            Mapping::ReadWrite(m) => m
                .flush()
                .wrap_err_with(|| format!("failed to flush '{}'", self.path.display())),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }

    /// Extends the file to `new_size` and remaps.
    ///
    /// Requires `&mut self`: the compiler guarantees no slice into the old
    /// mapping survives. The façade only calls this for the write-only
    /// opener, whose exclusive WO lock guarantees no other process has the
    /// file mapped at all.
    pub fn grow(&mut self, new_size: u64) -> Result<()> {
        ensure!(!self.readonly, StoreError::GrowRequiresWriteOnly);
        if new_size <= self.len {
            return Ok(());
        }

        match &self.mapping {
            Mapping::ReadWrite(m) => m
                .flush()
                .wrap_err("failed to flush mapping before grow")?,
            Mapping::ReadOnly(_) => bail!(StoreError::GrowRequiresWriteOnly),
        }

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.path.display(), new_size))?;

        let mmap = MmapRaw::map_raw(&self.file)
            .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?;
        self.mapping = Mapping::ReadWrite(mmap);

        let old = self.len;
        self.len = new_size;

        let mut header = self.header()?;
        header.stamp_size(new_size);
        self.write_obj(0, &header)?;

        debug!(path = %self.path.display(), from = old, to = new_size, "grew segment");
        Ok(())
    }

    /// Truncates a *closed* segment file down to its allocator high-water
    /// mark and restamps the header. Must not be called while any process
    /// has the file mapped.
    pub fn shrink_to_fit<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}' for shrink", path.display()))?;

        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact_at(&mut buf, 0)
            .wrap_err_with(|| format!("failed to read header of '{}'", path.display()))?;
        let mut header = SegmentHeader::read_from_bytes(&buf[..std::mem::size_of::<SegmentHeader>()])
            .map_err(|e| eyre::eyre!("failed to decode header of '{}': {:?}", path.display(), e))?;
        let state_range =
            ALLOC_STATE_OFFSET as usize..ALLOC_STATE_OFFSET as usize + std::mem::size_of::<AllocState>();
        let state = AllocState::read_from_bytes(&buf[state_range])
            .map_err(|e| eyre::eyre!("failed to decode allocator state of '{}': {:?}", path.display(), e))?;

        let file_size = file.metadata()?.len();
        header.validate(path, file_size)?;
        state.validate(path, header.segment_size())?;

        let new_size = align_up(state.alloc_high(), 4096).max(MIN_FILE_SIZE);
        if new_size >= header.segment_size() {
            return Ok(());
        }

        header.stamp_size(new_size);
        file.write_all_at(header.as_bytes(), 0)
            .wrap_err_with(|| format!("failed to restamp header of '{}'", path.display()))?;
        file.set_len(new_size)
            .wrap_err_with(|| format!("failed to truncate '{}' to {} bytes", path.display(), new_size))?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync '{}' after shrink", path.display()))?;

        debug!(path = %path.display(), from = file_size, to = new_size, "shrank segment");
        Ok(())
    }
}

/// Releases the in-file allocator lock on drop.
pub(crate) struct AllocLockGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for AllocLockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_stamps_a_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let heap = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();

        let header = heap.header().unwrap();
        assert_eq!(header.segment_size(), MIN_FILE_SIZE);
        assert_eq!(header.layout_version(), LAYOUT_VERSION);
        assert_eq!(heap.alloc_state().unwrap().alloc_high(), DATA_OFFSET);
    }

    #[test]
    fn reopen_roundtrips_written_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        {
            let heap = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();
            heap.write_bytes(DATA_OFFSET, b"hello segment").unwrap();
            heap.flush().unwrap();
        }

        let heap = MappedHeap::open(&path).unwrap();
        assert_eq!(heap.bytes(DATA_OFFSET, 13).unwrap(), b"hello segment");
    }

    #[test]
    fn open_rejects_truncated_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        {
            let _ = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();
        }
        // Extend the tail without updating the header.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(MIN_FILE_SIZE * 2).unwrap();

        let err = MappedHeap::open(&path).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(StoreError::Corrupt(..))
        ));
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        std::fs::write(&path, vec![0xa5u8; MIN_FILE_SIZE as usize]).unwrap();

        let err = MappedHeap::open(&path).unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(StoreError::Corrupt(..))
        ));
    }

    #[test]
    fn grow_preserves_contents_and_restamps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut heap = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();
        heap.write_bytes(DATA_OFFSET, b"survivor").unwrap();

        heap.grow(MIN_FILE_SIZE * 4).unwrap();

        assert_eq!(heap.size(), MIN_FILE_SIZE * 4);
        assert_eq!(heap.header().unwrap().segment_size(), MIN_FILE_SIZE * 4);
        assert_eq!(heap.bytes(DATA_OFFSET, 8).unwrap(), b"survivor");
    }

    #[test]
    fn read_only_mapping_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        {
            let _ = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();
        }

        let heap = MappedHeap::open_read_only(&path).unwrap();
        let err = heap.write_bytes(DATA_OFFSET, b"nope").unwrap_err();
        assert!(matches!(
            crate::error::kind(&err),
            Some(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn allocator_lock_excludes_and_releases() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE).unwrap();

        let guard = heap.lock_allocator();
        drop(guard);
        // Released: a second acquisition must not block.
        let _again = heap.lock_allocator();
    }

    #[test]
    fn clear_alloc_lock_recovers_a_stuck_word() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE).unwrap();

        let guard = heap.lock_allocator();
        std::mem::forget(guard);
        heap.clear_alloc_lock();
        let _recovered = heap.lock_allocator();
    }

    #[test]
    fn shrink_to_fit_truncates_to_high_water() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        {
            let heap = MappedHeap::create(&path, MIN_FILE_SIZE * 16).unwrap();
            heap.alloc(100).unwrap();
            heap.flush().unwrap();
        }

        MappedHeap::shrink_to_fit(&path).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert!(len < MIN_FILE_SIZE * 16);
        // Still a valid segment afterwards.
        let heap = MappedHeap::open(&path).unwrap();
        assert_eq!(heap.header().unwrap().segment_size(), len);
    }
}
