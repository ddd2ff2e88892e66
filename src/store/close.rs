//! Store close path.
//!
//! Closing flushes the mapping, unmaps, shrinks the file to fit (write-only
//! handles only — nobody else is mapped, so truncation is safe) and finally
//! releases the write-only session lock. The asynchronous variant runs the
//! same steps on a one-shot worker thread and delivers the outcome to a
//! callback, keeping a slow `msync` or truncate off the caller's thread.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, Result};
use tracing::debug;

use crate::error::StoreError;
use crate::heap::MappedHeap;
use crate::shmem::MutexRegion;

use super::{Mode, Store};

impl Store {
    /// Closes the handle synchronously. A second close fails with
    /// `AlreadyClosed`; every other operation afterwards fails with
    /// `Closed`.
    pub fn close(&self) -> Result<()> {
        let heap = self.heap.write().take();
        let Some(heap) = heap else {
            bail!(StoreError::AlreadyClosed);
        };
        close_segment(heap, &self.region, self.mode, &self.path)
    }

    /// Closes on a background worker thread, invoking `callback` with the
    /// outcome once the flush/shrink/unlock sequence finishes. Fails fast
    /// with `AlreadyClosed` when the handle is already closed; operations
    /// started after this call observe `Closed` immediately.
    pub fn close_async<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let heap = self.heap.write().take();
        let Some(heap) = heap else {
            bail!(StoreError::AlreadyClosed);
        };

        let region = Arc::clone(&self.region);
        let mode = self.mode;
        let path = self.path.clone();

        // The job lives in a shared slot so a failed spawn can reclaim it
        // and close inline — the session lock must be released either way.
        let job = Arc::new(parking_lot::Mutex::new(Some((heap, callback))));
        let worker_job = Arc::clone(&job);

        let spawned = std::thread::Builder::new()
            .name("mmstore-close".into())
            .spawn(move || {
                if let Some((heap, callback)) = worker_job.lock().take() {
                    callback(close_segment(heap, &region, mode, &path));
                }
            });

        if spawned.is_err() {
            if let Some((heap, callback)) = job.lock().take() {
                callback(close_segment(heap, &self.region, self.mode, &self.path));
            }
        }
        Ok(())
    }
}

/// Flush, unmap, shrink (write-only), release the session lock. The lock
/// release happens on every path: a store that failed to flush is still
/// closed, and other openers must not stay locked out.
pub(super) fn close_segment(
    heap: MappedHeap,
    region: &MutexRegion,
    mode: Mode,
    path: &Path,
) -> Result<()> {
    let result = (|| {
        heap.flush()?;
        drop(heap);
        if mode == Mode::WriteOnly {
            MappedHeap::shrink_to_fit(path)?;
        }
        Ok(())
    })();

    match mode {
        Mode::WriteOnly => region.locks().wo.release_exclusive(),
        Mode::ReadOnly | Mode::ReadWrite => region.locks().wo.release_shared(),
    }

    debug!(path = %path.display(), mode = %mode, "closed store");
    result
}

#[cfg(test)]
mod tests {
    use super::super::OpenOptions;
    use crate::error::{self, StoreError};
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn double_close_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = OpenOptions::new(&path)
            .mode(super::Mode::WriteOnly)
            .open()
            .unwrap();

        store.close().unwrap();
        let err = store.close().unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(StoreError::AlreadyClosed)
        ));

        super::Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn operations_after_close_fail_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = OpenOptions::new(&path)
            .mode(super::Mode::WriteOnly)
            .open()
            .unwrap();
        store.close().unwrap();

        let err = store.get("k").unwrap_err();
        assert!(matches!(error::kind(&err), Some(StoreError::Closed)));
        let err = store.set("k", "v").unwrap_err();
        assert!(matches!(error::kind(&err), Some(StoreError::Closed)));
        let err = store.keys().unwrap_err();
        assert!(matches!(error::kind(&err), Some(StoreError::Closed)));

        super::Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn async_close_reports_through_the_callback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = OpenOptions::new(&path)
            .mode(super::Mode::WriteOnly)
            .open()
            .unwrap();
        store.set("k", "v").unwrap();

        let (tx, rx) = mpsc::channel();
        store
            .close_async(move |outcome| tx.send(outcome.is_ok()).unwrap())
            .unwrap();

        assert!(rx.recv().unwrap());
        assert!(store.is_closed());

        // The write-only lock was released: a fresh writer can open.
        let again = OpenOptions::new(&path)
            .mode(super::Mode::WriteOnly)
            .open()
            .unwrap();
        assert_eq!(again.get("k").unwrap().unwrap().as_str().unwrap(), "v");
        again.close().unwrap();

        super::Store::remove_shared_mutex(&path).unwrap();
    }

    #[test]
    fn write_only_close_shrinks_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let store = OpenOptions::new(&path)
            .mode(super::Mode::WriteOnly)
            .initial_size_kib(10 * 1024)
            .open()
            .unwrap();
        store.set("k", "v").unwrap();
        let before = std::fs::metadata(&path).unwrap().len();
        store.close().unwrap();

        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "{after} should be below {before}");

        // And the shrunk file opens clean.
        let reopened = super::Store::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().unwrap().as_str().unwrap(), "v");
        reopened.close().unwrap();

        super::Store::remove_shared_mutex(&path).unwrap();
    }
}
