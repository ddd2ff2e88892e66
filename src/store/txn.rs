//! User write transactions.
//!
//! `write_lock` takes the global lock exclusively and hands back a
//! [`WriteTxn`]. While the handle lives, every point operation elsewhere is
//! excluded (they all need the global lock shared), so operations invoked
//! *through* the handle skip their own lock acquisitions entirely — the
//! transaction already owns something stronger. Dropping the handle
//! releases the lock on every exit path: the exclusion is carried by the
//! handle's existence and enforced by the lock itself, not by a flag that
//! every operation must remember to consult.

use eyre::Result;

use crate::cell::Value;

use super::{Store, ValueRef};

/// Exclusive write access to the whole store, scoped to this handle's
/// lifetime.
///
/// Route every access through the handle while it lives: calling the plain
/// `Store` operations from the same thread would wait on the global lock
/// this handle is holding.
#[must_use = "the global lock is released as soon as the transaction is dropped"]
#[derive(Debug)]
pub struct WriteTxn<'a> {
    store: &'a Store,
}

impl Store {
    /// Takes the global lock exclusively and returns the transaction
    /// handle. Blocks until in-flight point operations drain.
    pub fn write_lock(&self) -> Result<WriteTxn<'_>> {
        eyre::ensure!(self.is_open(), crate::error::StoreError::Closed);
        self.region.locks().global.acquire_exclusive();
        Ok(WriteTxn { store: self })
    }
}

impl<'a> WriteTxn<'a> {
    pub fn get(&self, key: &str) -> Result<Option<ValueRef<'_>>> {
        self.store.get_inner(key, false)
    }

    pub fn set<'v>(&self, key: &str, value: impl Into<Value<'v>>) -> Result<()> {
        self.store.set_inner(key, value.into(), false)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.store.delete_inner(key, false)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.store.keys_inner(false)
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        self.store.region.locks().global.release_exclusive();
    }
}
