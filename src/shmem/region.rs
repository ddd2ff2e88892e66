//! Shared-mutex region bootstrap.
//!
//! Each store file has a companion POSIX shared-memory object holding its
//! lock table: the global lock, one lock per shard, and the write-only
//! session lock. The object's name is derived from the file's absolute path
//! with path separators replaced by `-`, which makes it unique per path and
//! discoverable by every process without coordination.
//!
//! ## Bootstrap
//!
//! The first opener creates and zero-fills the object (`ftruncate` of a
//! fresh object already yields zero pages, and the all-zero `ShmRwLock`
//! word is "unlocked", so creation needs no placement ceremony). Every
//! opener then performs a *trial lock* of the global mutex with a bounded
//! wait. Timing out means a previous holder died inside a critical section
//! and left the lock abandoned; recovery zero-fills the whole lock table in
//! place, accepting the loss of whatever partial operation the dead process
//! was performing.
//!
//! ## Lifetime
//!
//! The region is never unlinked on close — it persists until
//! [`remove`] is called explicitly. Within one process, opens of the same
//! path share a single mapping through a `Weak` registry, so lock state is
//! one word per lock no matter how many handles exist.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{LOCK_TIMEOUT, SHARD_COUNT};
use crate::error::StoreError;

use super::rwlock::ShmRwLock;

/// The lock table at the base of the region.
#[repr(C)]
#[derive(Debug)]
pub struct Locks {
    pub global: ShmRwLock,
    pub shards: [ShmRwLock; SHARD_COUNT],
    pub wo: ShmRwLock,
}

impl Locks {
    pub fn shard(&self, idx: usize) -> &ShmRwLock {
        &self.shards[idx]
    }
}

/// A mapped shared-mutex region for one store path.
#[derive(Debug)]
pub struct MutexRegion {
    base: NonNull<Locks>,
    map_len: usize,
    key: PathBuf,
}

// SAFETY: the region's only mutable state is the lock words themselves,
// which are atomics designed for cross-process concurrent access. The
// NonNull base stays valid until Drop unmaps it, and Drop runs only once
// the last Arc is gone.
unsafe impl Send for MutexRegion {}
unsafe impl Sync for MutexRegion {}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<MutexRegion>>> {
    static REGIONS: OnceLock<Mutex<HashMap<PathBuf, Weak<MutexRegion>>>> = OnceLock::new();
    REGIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Derives the shm object name from a store path: absolute path with `/`
/// and `\` replaced by `-`, under a single leading slash.
fn shm_name_for(path: &Path) -> Result<CString> {
    let abs = std::path::absolute(path)
        .wrap_err_with(|| format!("failed to absolutize '{}'", path.display()))?;
    let flat: String = abs
        .display()
        .to_string()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect();
    let name = format!("/{}", flat);
    ensure!(
        name.len() < 255,
        "derived mutex name for '{}' exceeds the shm name limit",
        path.display()
    );
    CString::new(name).wrap_err("derived mutex name contains a NUL byte")
}

impl MutexRegion {
    /// Opens (or first-creates) the region for `path` and runs the trial
    /// lock. `base_addr` optionally pins the mapping address; see
    /// `config::DEFAULT_MAP_BASE_ADDR`.
    pub fn open_or_create(path: &Path, base_addr: Option<usize>) -> Result<Arc<Self>> {
        let key = std::path::absolute(path)
            .wrap_err_with(|| format!("failed to absolutize '{}'", path.display()))?;

        let mut map = registry().lock();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            // Already live in this process; its locks are in use, so no
            // trial lock (we would only be fighting ourselves).
            return Ok(existing);
        }

        let region = Arc::new(Self::bootstrap(path, &key, base_addr)?);
        map.insert(key, Arc::downgrade(&region));
        Ok(region)
    }

    fn bootstrap(path: &Path, key: &Path, base_addr: Option<usize>) -> Result<Self> {
        let name = shm_name_for(path)?;
        let size = std::mem::size_of::<Locks>();

        // SAFETY: shm_open/ftruncate/close are plain fallible syscalls on a
        // name we own; every return value is checked below.
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
        let fd = if fd >= 0 {
            fd
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(eyre::Report::new(err)
                    .wrap_err(format!("cannot open mutex region for '{}'", path.display())));
            }

            // Not there yet: remove any half-created leftover, then create.
            // SAFETY: as above; unlink of a missing name is the expected
            // no-op here.
            unsafe { libc::shm_unlink(name.as_ptr()) };
            let fd = unsafe {
                libc::shm_open(
                    name.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                    0o600 as libc::mode_t,
                )
            };
            let fd = if fd >= 0 {
                fd
            } else if std::io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                // Another process created it between our two calls.
                let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600 as libc::mode_t) };
                ensure!(
                    fd >= 0,
                    StoreError::LockBroken
                );
                fd
            } else {
                return Err(eyre::Report::new(std::io::Error::last_os_error())
                    .wrap_err(format!("cannot create mutex region for '{}'", path.display())));
            };

            debug!(path = %path.display(), "created shared-mutex region");
            fd
        };

        // Size the object on every open, not just at creation: an opener
        // can win the race against the creator's ftruncate and must not map
        // a zero-length object. A fresh object is zero-filled by this,
        // which is exactly the all-unlocked lock table.
        // SAFETY: fd is a valid descriptor; the result is checked.
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(eyre::Report::new(err)
                .wrap_err(format!("cannot size mutex region for '{}'", path.display())));
        }

        // SAFETY: fd is valid and sized; a failed mmap returns MAP_FAILED,
        // which is checked; on success the mapping stays valid until munmap
        // in Drop. base_addr is a placement hint only (no MAP_FIXED), so a
        // bad hint degrades to kernel placement instead of clobbering
        // existing mappings.
        let base = unsafe {
            libc::mmap(
                base_addr.unwrap_or(0) as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is no longer needed once the mapping exists.
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(eyre::Report::new(std::io::Error::last_os_error())
                .wrap_err(format!("cannot map mutex region for '{}'", path.display())));
        }

        let base = NonNull::new(base as *mut Locks).ok_or_else(|| {
            eyre::eyre!("mmap returned a null mapping for '{}'", path.display())
        })?;
        let region = Self {
            base,
            map_len: size,
            key: key.to_path_buf(),
        };

        region.trial_lock(path);
        Ok(region)
    }

    /// Bounded exclusive probe of the global lock. Success proves the lock
    /// table is healthy; a timeout means an abandoned holder, repaired by
    /// zero-filling the table in place.
    fn trial_lock(&self, path: &Path) {
        let locks = self.locks();
        if locks.global.acquire_exclusive_for(LOCK_TIMEOUT) {
            locks.global.release_exclusive();
        } else {
            warn!(
                path = %path.display(),
                "global lock abandoned; re-initializing shared-mutex region"
            );
            self.reinit();
        }
    }

    /// Zero-fills the lock table, forcing every lock back to "unlocked".
    fn reinit(&self) {
        // SAFETY: base..base+map_len is our live mapping, and the all-zero
        // pattern is the valid unlocked state of every lock word.
        unsafe {
            std::ptr::write_bytes(self.base.as_ptr() as *mut u8, 0, self.map_len);
        }
    }

    pub fn locks(&self) -> &Locks {
        // SAFETY: base points at a mapping of at least size_of::<Locks>()
        // that lives as long as self.
        unsafe { self.base.as_ref() }
    }

    /// Unlinks the shm object for `path`. Idempotent; mapped regions in
    /// running processes stay functional until they close.
    pub fn remove(path: &Path) -> Result<()> {
        let name = shm_name_for(path)?;
        // SAFETY: plain syscall; ENOENT is the idempotent success case.
        let rc = unsafe { libc::shm_unlink(name.as_ptr()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(eyre::Report::new(err)
                    .wrap_err(format!("cannot remove mutex region for '{}'", path.display())));
            }
        }
        Ok(())
    }
}

impl Drop for MutexRegion {
    fn drop(&mut self) {
        // Drop the registry entry only if it still points at this region; a
        // concurrent open may already have replaced the dead Weak with a
        // fresh mapping.
        let mut map = registry().lock();
        if map.get(&self.key).is_some_and(|w| w.strong_count() == 0) {
            map.remove(&self.key);
        }
        drop(map);
        // SAFETY: base..base+map_len is the mapping created in bootstrap and
        // nothing can reference it after the last Arc is gone.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_path_shares_one_region_in_process() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let a = MutexRegion::open_or_create(&path, None).unwrap();
        let b = MutexRegion::open_or_create(&path, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        MutexRegion::remove(&path).unwrap();
    }

    #[test]
    fn distinct_paths_get_distinct_regions() {
        let dir = tempdir().unwrap();
        let p1 = dir.path().join("one");
        let p2 = dir.path().join("two");

        let a = MutexRegion::open_or_create(&p1, None).unwrap();
        let b = MutexRegion::open_or_create(&p2, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        MutexRegion::remove(&p1).unwrap();
        MutexRegion::remove(&p2).unwrap();
    }

    #[test]
    fn locks_survive_region_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let region = MutexRegion::open_or_create(&path, None).unwrap();
            region.locks().shard(3).acquire_shared();
            region.locks().shard(3).release_shared();
        }
        // Region dropped from the process registry; reopening maps the same
        // (still healthy) shm object.
        let region = MutexRegion::open_or_create(&path, None).unwrap();
        region.locks().global.acquire_exclusive();
        region.locks().global.release_exclusive();

        MutexRegion::remove(&path).unwrap();
    }

    #[test]
    fn abandoned_global_lock_is_recovered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let region = MutexRegion::open_or_create(&path, None).unwrap();
            // Simulate a crash inside a critical section: take the global
            // lock and never release it.
            region.locks().global.acquire_exclusive();
        }

        // The next opener's trial lock times out and re-initializes.
        let region = MutexRegion::open_or_create(&path, None).unwrap();
        assert!(region
            .locks()
            .global
            .acquire_exclusive_for(std::time::Duration::from_millis(100)));
        region.locks().global.release_exclusive();

        MutexRegion::remove(&path).unwrap();
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let _region = MutexRegion::open_or_create(&path, None).unwrap();
        MutexRegion::remove(&path).unwrap();
        MutexRegion::remove(&path).unwrap();
    }
}
