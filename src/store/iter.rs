//! Cursor iteration.
//!
//! The cursor walks the shards in order, copying one shard's entries out
//! under that shard's shared lock, then releasing it before yielding. The
//! result is consistent per shard but deliberately not atomic across the
//! whole store: shard 40 is seen as of the moment the cursor reaches it,
//! which may be after a writer touched shard 3 behind the cursor. Callers
//! that need one instant across all keys use `Store::keys` (global
//! exclusive) instead.

use crate::cell::OwnedValue;
use crate::config::SHARD_COUNT;

use super::Store;

/// A stateful cursor over all entries. Yields owned pairs; the per-shard
/// locks are only held while a shard is being copied, never across `next`.
#[derive(Debug)]
pub struct StoreIter<'a> {
    store: &'a Store,
    shard_idx: usize,
    buffer: std::vec::IntoIter<(String, OwnedValue)>,
}

impl Store {
    /// Starts a cursor at shard 0. Fails with `Closed` on a closed handle;
    /// a handle closed mid-iteration simply ends the cursor.
    pub fn iter(&self) -> eyre::Result<StoreIter<'_>> {
        eyre::ensure!(self.is_open(), crate::error::StoreError::Closed);
        Ok(StoreIter {
            store: self,
            shard_idx: 0,
            buffer: Vec::new().into_iter(),
        })
    }
}

impl Iterator for StoreIter<'_> {
    type Item = (String, OwnedValue);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.next() {
                return Some(entry);
            }
            if self.shard_idx >= SHARD_COUNT {
                return None;
            }
            let snapshot = match self.store.snapshot_shard(self.shard_idx) {
                Ok(entries) => entries,
                // Closed under us; nothing left to visit.
                Err(_) => return None,
            };
            self.shard_idx += 1;
            self.buffer = snapshot.into_iter();
        }
    }
}
