//! # Store Façade
//!
//! `Store` ties the pieces together: the mapped heap holding the bytes, the
//! shared-mutex region arbitrating access across processes, and the sharded
//! hash index locating entries. One `Store` is one open handle on one file;
//! any number of processes may hold read handles while a single write-only
//! handle exists anywhere.
//!
//! ## Operation → Lock Mapping
//!
//! | operation      | shard lock | global lock |
//! |----------------|------------|-------------|
//! | `get`          | shared     | shared      |
//! | `set`/`delete` | exclusive  | shared      |
//! | `keys`         | —          | exclusive   |
//! | `iter` (per shard) | shared | shared      |
//! | `write_lock`   | —          | exclusive (held by the handle) |
//!
//! In-process, every operation additionally holds a read lock on the
//! mapping itself so growth (which remaps) is exclusive with all of them.
//!
//! ## Growth
//!
//! When the allocator reports `OutOfSpace` during `set`, the write-only
//! opener grows the file by `max(2 × size, 2 × value length)` up to the
//! configured ceiling and retries; other modes fail, because growing while
//! another process has the old, shorter mapping would hand them a file they
//! cannot see the end of. The write-only session lock is exactly the proof
//! that no such process exists.

mod close;
mod iter;
mod options;
mod txn;

pub use iter::StoreIter;
pub use options::{Mode, OpenOptions};
pub use txn::WriteTxn;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;
use zerocopy::little_endian::U32;

use crate::cell::{self, OwnedValue, RawValue, Value};
use crate::config::{
    DEFAULT_BUCKET_COUNT, DEFAULT_FILE_SIZE, DEFAULT_MAX_FILE_SIZE, FILE_FORMAT_VERSION,
    LOCK_TIMEOUT, MIN_FILE_SIZE, MIN_SHARD_BUCKETS, SHARD_COUNT,
};
use crate::error::{self, StoreError};
use crate::heap::{MappedHeap, BLOCK_HEADER_SIZE};
use crate::index::{hash_key, shard_of, ShardDirectory, BUCKET_SIZE};
use crate::shmem::{MutexRegion, SharedGuard};

/// An open handle on a persistent, memory-mapped, string-keyed store.
///
/// Cheap operations (`get`, `set`, `delete`) take per-shard locks; whole-
/// store operations (`keys`, [`Store::write_lock`]) take the global lock.
/// The handle is `Send + Sync`; clones are not needed — share it behind an
/// `Arc` like any other connection object.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    mode: Mode,
    max_size: u64,
    region: Arc<MutexRegion>,
    heap: RwLock<Option<MappedHeap>>,
    directory: ShardDirectory,
    version: u32,
}

impl Store {
    /// Opens `path` read-write with default sizing. See [`OpenOptions`] for
    /// the full set of knobs.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        OpenOptions::new(path).open()
    }

    pub(crate) fn open_with(opts: OpenOptions) -> Result<Store> {
        let path_display = opts.path.display().to_string();

        let buckets = if opts.initial_bucket_count == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            opts.initial_bucket_count
        };
        let mut initial = if opts.initial_size_kib == 0 {
            DEFAULT_FILE_SIZE
        } else {
            opts.initial_size_kib * 1024
        };
        // Don't open it too small: the empty store must fit.
        initial = initial.max(MIN_FILE_SIZE).max(min_create_size(buckets));
        let max_size = if opts.max_size_kib == 0 {
            DEFAULT_MAX_FILE_SIZE
        } else {
            opts.max_size_kib * 1024
        }
        .max(initial);

        let region = MutexRegion::open_or_create(&opts.path, opts.map_base_addr)?;
        let locks = region.locks();

        // Serialize the stat/create window so two openers cannot both
        // decide to create the file.
        let _open_guard = locks.global.lock_exclusive();

        let create = match std::fs::metadata(&opts.path) {
            Ok(meta) => {
                ensure!(meta.is_file(), StoreError::NotRegularFile(path_display.clone()));
                ensure!(meta.len() > 0, StoreError::Empty(path_display.clone()));
                false
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ensure!(
                    opts.mode != Mode::ReadOnly,
                    StoreError::NotFound(path_display.clone())
                );
                true
            }
            Err(e) => {
                return Err(eyre::Report::new(e)
                    .wrap_err(format!("failed to stat '{path_display}'")))
            }
        };

        // Session hold on the write-only lock: shared for readers and
        // writers, promoted to exclusive for the write-only opener.
        ensure!(
            locks.wo.acquire_shared_for(LOCK_TIMEOUT),
            StoreError::BusyWriteOnly(path_display.clone())
        );
        if opts.mode == Mode::WriteOnly && !locks.wo.try_promote_shared_for(LOCK_TIMEOUT) {
            locks.wo.release_shared();
            bail!(StoreError::Busy(path_display));
        }

        match Self::materialize(&opts, create, initial, buckets) {
            Ok((heap, directory, version)) => {
                debug!(path = %path_display, mode = %opts.mode, created = create, "opened store");
                Ok(Store {
                    path: opts.path,
                    mode: opts.mode,
                    max_size,
                    region: Arc::clone(&region),
                    heap: RwLock::new(Some(heap)),
                    directory,
                    version,
                })
            }
            Err(e) => {
                // The session hold must not leak past a failed open.
                if opts.mode == Mode::WriteOnly {
                    locks.wo.release_exclusive();
                } else {
                    locks.wo.release_shared();
                }
                Err(e)
            }
        }
    }

    fn materialize(
        opts: &OpenOptions,
        create: bool,
        initial: u64,
        buckets: u32,
    ) -> Result<(MappedHeap, ShardDirectory, u32)> {
        let path_display = opts.path.display().to_string();

        if create {
            let heap = MappedHeap::create(&opts.path, initial)?;
            let (version_off, _) = heap.find_or_construct("version", 4)?;
            heap.write_obj(version_off, &U32::new(FILE_FORMAT_VERSION))?;
            let (props_off, _) = heap.find_or_construct("properties", ShardDirectory::SIZE)?;
            let directory = ShardDirectory::at(props_off);
            directory.init(&heap, buckets)?;
            heap.flush()?;
            return Ok((heap, directory, FILE_FORMAT_VERSION));
        }

        let heap = match opts.mode {
            Mode::ReadOnly => MappedHeap::open_read_only(&opts.path)?,
            Mode::ReadWrite | Mode::WriteOnly => MappedHeap::open(&opts.path)?,
        };

        // We hold the global lock exclusively, so no writer is legitimately
        // mid-allocation; a set allocator-lock word is a crashed holder's.
        heap.clear_alloc_lock();

        let props_off = heap
            .find_named("properties")?
            .ok_or_else(|| StoreError::corrupt(&opts.path, "missing properties table"))?;

        let version = match heap.find_named("version")? {
            Some(off) => heap.read_obj::<U32>(off)?.get(),
            // Predates the version cell; compatible with version 1.
            None => 0,
        };
        ensure!(
            version == FILE_FORMAT_VERSION || version == 0,
            StoreError::VersionMismatch {
                path: path_display,
                found: version,
                expected: FILE_FORMAT_VERSION,
            }
        );

        Ok((heap, ShardDirectory::at(props_off), version))
    }

    /// Path this handle was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.heap.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Version stamped in the file's `"version"` cell.
    pub fn file_format_version(&self) -> u32 {
        self.version
    }

    /// Unlinks the shared-mutex region for `path`. Idempotent; running
    /// processes keep their mapping until they close.
    pub fn remove_shared_mutex<P: AsRef<Path>>(path: P) -> Result<()> {
        MutexRegion::remove(path.as_ref())
    }

    /// Looks up `key`, returning a zero-copy view valid for as long as the
    /// returned guard lives. The guard holds the shard and global locks
    /// shared; drop it promptly.
    pub fn get(&self, key: &str) -> Result<Option<ValueRef<'_>>> {
        self.get_inner(key, true)
    }

    /// Inserts or overwrites `key`. Overwriting may change the value's
    /// type. Grows the file when needed (write-only handles only).
    pub fn set<'v>(&self, key: &str, value: impl Into<Value<'v>>) -> Result<()> {
        self.set_inner(key, value.into(), true)
    }

    /// Removes `key`. Removing a missing key is a no-op success.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.delete_inner(key, true)
    }

    /// Binding-layer convenience: `None` deletes the key, for host
    /// languages where an `undefined`/`null` assignment means delete.
    pub fn set_or_delete<'v>(&self, key: &str, value: Option<Value<'v>>) -> Result<()> {
        match value {
            Some(v) => self.set_inner(key, v, true),
            None => self.delete_inner(key, true),
        }
    }

    /// All keys, in shard order, as of one instant: the global lock is held
    /// exclusively, so no write anywhere in the store overlaps the scan.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.keys_inner(true)
    }

    pub(crate) fn get_inner(&self, key: &str, with_locks: bool) -> Result<Option<ValueRef<'_>>> {
        let heap_guard = self.heap.read();
        let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;

        let hash = hash_key(key.as_bytes());
        let shard = shard_of(hash);

        let locks = self.region.locks();
        let shm_guards = with_locks.then(|| {
            (
                locks.shard(shard).lock_shared(),
                locks.global.lock_shared(),
            )
        });

        let Some(cell) = self.directory.shard(shard).get(heap, key, hash)? else {
            return Ok(None);
        };
        let raw = cell.raw(heap)?;

        Ok(Some(ValueRef {
            raw,
            _heap: heap_guard,
            _shm: shm_guards,
        }))
    }

    pub(crate) fn set_inner(&self, key: &str, value: Value<'_>, with_locks: bool) -> Result<()> {
        ensure!(self.mode != Mode::ReadOnly, StoreError::ReadOnly);

        let hash = hash_key(key.as_bytes());
        let shard = shard_of(hash);

        loop {
            {
                let heap_guard = self.heap.read();
                let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;

                let locks = self.region.locks();
                let _shm_guards = with_locks.then(|| {
                    (
                        locks.shard(shard).lock_exclusive(),
                        locks.global.lock_shared(),
                    )
                });

                match self.directory.shard(shard).insert(heap, key, hash, value) {
                    Ok(()) => return Ok(()),
                    Err(e) if matches!(error::kind(&e), Some(StoreError::OutOfSpace { .. })) => {
                        // Fall through to grow with all locks released.
                    }
                    Err(e) => {
                        return Err(e).wrap_err_with(|| format!("failed to set key '{key}'"))
                    }
                }
            }
            self.grow_for(&value)?;
        }
    }

    pub(crate) fn delete_inner(&self, key: &str, with_locks: bool) -> Result<()> {
        ensure!(self.mode != Mode::ReadOnly, StoreError::ReadOnly);

        let heap_guard = self.heap.read();
        let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;

        let hash = hash_key(key.as_bytes());
        let shard = shard_of(hash);

        let locks = self.region.locks();
        let _shm_guards = with_locks.then(|| {
            (
                locks.shard(shard).lock_exclusive(),
                locks.global.lock_shared(),
            )
        });

        self.directory.shard(shard).remove(heap, key, hash)?;
        Ok(())
    }

    pub(crate) fn keys_inner(&self, with_locks: bool) -> Result<Vec<String>> {
        let heap_guard = self.heap.read();
        let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;

        let _global = with_locks.then(|| self.region.locks().global.lock_exclusive());

        let mut out = Vec::new();
        for idx in 0..SHARD_COUNT {
            self.directory.shard(idx).push_keys(heap, &mut out)?;
        }
        Ok(out)
    }

    /// Copies one shard's entries under its shared lock. Used by the
    /// cursor; each shard is seen as of the moment it is visited.
    pub(crate) fn snapshot_shard(&self, idx: usize) -> Result<Vec<(String, OwnedValue)>> {
        let heap_guard = self.heap.read();
        let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;

        let locks = self.region.locks();
        let _shard = locks.shard(idx).lock_shared();
        let _global = locks.global.lock_shared();

        self.directory.shard(idx).entries(heap)
    }

    /// Grows the segment for a value that did not fit.
    ///
    /// Only the write-only opener may resize: its exclusive session lock
    /// proves no other process has the (shorter) file mapped.
    fn grow_for(&self, value: &Value<'_>) -> Result<()> {
        ensure!(
            self.mode == Mode::WriteOnly,
            StoreError::GrowRequiresWriteOnly
        );

        let mut heap_guard = self.heap.write();
        let heap = heap_guard.as_mut().ok_or(StoreError::Closed)?;

        let current = heap.size();
        ensure!(current < self.max_size, StoreError::FileTooLarge);

        let delta = (2 * current).max(2 * cell::value_length(value));
        let new_size = current.saturating_add(delta).min(self.max_size);
        heap.grow(new_size)
    }

    /// Runs a statistics read under the global lock held exclusively, which
    /// excludes every writer (they all hold it shared) so header fields are
    /// never read mid-update. Do not call while holding a [`ValueRef`] from
    /// the same thread — the view holds the global lock shared.
    fn with_stats_lock<R>(&self, f: impl FnOnce(&MappedHeap) -> Result<R>) -> Result<R> {
        let heap_guard = self.heap.read();
        let heap = heap_guard.as_ref().ok_or(StoreError::Closed)?;
        let _global = self.region.locks().global.lock_exclusive();
        f(heap)
    }

    /// Bytes still allocatable without growing.
    pub fn free_memory(&self) -> Result<u64> {
        self.with_stats_lock(|heap| heap.free_memory())
    }

    /// Current file (and segment) size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.with_stats_lock(|heap| Ok(heap.size()))
    }

    /// Total bucket capacity across all shards.
    pub fn bucket_count(&self) -> Result<u64> {
        self.with_stats_lock(|heap| {
            let mut total = 0u64;
            for idx in 0..SHARD_COUNT {
                total += self.directory.shard(idx).capacity(heap)? as u64;
            }
            Ok(total)
        })
    }

    /// Bucket capacity the configured size ceiling could hold.
    pub fn max_bucket_count(&self) -> Result<u64> {
        self.with_stats_lock(|_| Ok(self.max_size / BUCKET_SIZE))
    }

    /// Entries divided by buckets, across the whole store.
    pub fn load_factor(&self) -> Result<f32> {
        self.with_stats_lock(|heap| {
            let mut entries = 0u64;
            let mut buckets = 0u64;
            for idx in 0..SHARD_COUNT {
                let shard = self.directory.shard(idx);
                entries += shard.len(heap)? as u64;
                buckets += shard.capacity(heap)? as u64;
            }
            Ok(entries as f32 / buckets as f32)
        })
    }

    /// Occupancy bound past which a shard rehashes.
    pub fn max_load_factor(&self) -> f32 {
        crate::config::MAX_LOAD_NUM as f32 / crate::config::MAX_LOAD_DEN as f32
    }
}

/// Heap bytes an empty store needs: header, registry, version cell, shard
/// directory and one minimum bucket array per shard, block headers
/// included, plus a page of slack. The initial size is clamped up to this
/// so creation never fails on its own bookkeeping.
fn min_create_size(total_buckets: u32) -> u64 {
    let per_shard = (total_buckets / SHARD_COUNT as u32)
        .next_power_of_two()
        .max(MIN_SHARD_BUCKETS) as u64;
    let version_cell = 8 + BLOCK_HEADER_SIZE;
    let directory = ShardDirectory::SIZE + BLOCK_HEADER_SIZE;
    let bucket_arrays = SHARD_COUNT as u64 * (per_shard * BUCKET_SIZE + BLOCK_HEADER_SIZE);
    crate::config::DATA_OFFSET + version_cell + directory + bucket_arrays + 4096
}

/// A zero-copy view of one value, valid while it is held.
///
/// Internally this keeps the shard and global locks shared and pins the
/// in-process mapping, so the bytes it points at can neither move nor be
/// overwritten. It is deliberately not `Send`: the view is meant to be
/// consumed where it was obtained, not stored.
#[derive(Debug)]
pub struct ValueRef<'a> {
    raw: RawValue,
    _heap: RwLockReadGuard<'a, Option<MappedHeap>>,
    _shm: Option<(SharedGuard<'a>, SharedGuard<'a>)>,
}

impl ValueRef<'_> {
    /// "string", "buffer" or "number".
    pub fn kind(&self) -> &'static str {
        match self.raw {
            RawValue::Str(..) => "string",
            RawValue::Bytes(..) => "buffer",
            RawValue::Num(_) => "number",
        }
    }

    /// Borrows the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        match self.raw {
            RawValue::Str(ptr, len) => {
                // SAFETY: ptr/len came from a bounds-checked offset into the
                // mapping; the guards held by self keep the mapping alive and
                // exclude writers to this shard for the view's lifetime.
                let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
                std::str::from_utf8(bytes)
                    .map_err(|_| eyre::eyre!("stored string is not valid UTF-8"))
            }
            ref other => bail!(StoreError::WrongType {
                expected: "string",
                found: kind_name(other),
            }),
        }
    }

    /// Borrows the raw bytes of a string or buffer value.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self.raw {
            RawValue::Str(ptr, len) | RawValue::Bytes(ptr, len) => {
                // SAFETY: same argument as as_str.
                Ok(unsafe { std::slice::from_raw_parts(ptr, len) })
            }
            ref other => bail!(StoreError::WrongType {
                expected: "buffer",
                found: kind_name(other),
            }),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self.raw {
            RawValue::Num(n) => Ok(n),
            ref other => bail!(StoreError::WrongType {
                expected: "number",
                found: kind_name(other),
            }),
        }
    }

    /// Deep-copies the value out of the mapping.
    pub fn to_owned(&self) -> Result<OwnedValue> {
        match self.raw {
            RawValue::Str(..) => Ok(OwnedValue::Str(self.as_str()?.to_string())),
            RawValue::Bytes(ptr, len) => {
                // SAFETY: same argument as as_str.
                Ok(OwnedValue::Bytes(
                    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec(),
                ))
            }
            RawValue::Num(n) => Ok(OwnedValue::F64(n)),
        }
    }
}

fn kind_name(raw: &RawValue) -> &'static str {
    match raw {
        RawValue::Str(..) => "string",
        RawValue::Bytes(..) => "buffer",
        RawValue::Num(_) => "number",
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.get_mut().take() {
            let _ = close::close_segment(heap, &self.region, self.mode, &self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn wo(path: &Path) -> Store {
        OpenOptions::new(path).mode(Mode::WriteOnly).open().unwrap()
    }

    #[test]
    fn version_cell_gates_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = wo(&path);
            store.set("k", "v").unwrap();
            store.close().unwrap();
        }

        // Restamp the version cell to something from the future.
        {
            let heap = MappedHeap::open(&path).unwrap();
            let off = heap.find_named("version").unwrap().unwrap();
            heap.write_obj(off, &U32::new(7)).unwrap();
            heap.flush().unwrap();
        }

        let err = OpenOptions::new(&path).open().unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(StoreError::VersionMismatch { found: 7, .. })
        ));
        Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn version_zero_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let store = wo(&path);
            store.set("k", "v").unwrap();
            store.close().unwrap();
        }
        {
            let heap = MappedHeap::open(&path).unwrap();
            let off = heap.find_named("version").unwrap().unwrap();
            heap.write_obj(off, &U32::new(0)).unwrap();
            heap.flush().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.file_format_version(), 0);
        assert_eq!(store.get("k").unwrap().unwrap().as_str().unwrap(), "v");
        store.close().unwrap();
        Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn wrong_accessor_reports_wrong_type() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = wo(&path);
        store.set("n", 1.5).unwrap();

        let value = store.get("n").unwrap().unwrap();
        let err = value.as_str().unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(StoreError::WrongType {
                expected: "string",
                found: "number",
            })
        ));
        assert_eq!(value.as_f64().unwrap(), 1.5);
        drop(value);

        store.close().unwrap();
        Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn min_create_size_covers_the_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        // The tiniest configuration must create successfully.
        let store = OpenOptions::new(&path)
            .mode(Mode::WriteOnly)
            .initial_size_kib(1)
            .max_size_kib(1)
            .initial_bucket_count(1)
            .open()
            .unwrap();
        assert!(store.free_memory().unwrap() > 0);
        store.close().unwrap();
        Store::remove_shared_mutex(&path).unwrap();
    }
}
