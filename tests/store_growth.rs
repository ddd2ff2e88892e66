//! # Growth Tests
//!
//! The segment grows in place when a value does not fit, only for the
//! write-only opener, and only up to the configured ceiling. These tests
//! pin the three visible behaviors:
//!
//! 1. Growth is transparent: previously inserted keys stay readable with
//!    their prior values after any number of grow cycles
//! 2. A store capped at its initial size fails `set` with `FileTooLarge`
//! 3. Read-write handles never grow; they surface the dedicated error

use mmstore::error::{self, StoreError};
use mmstore::{Mode, OpenOptions, Store};
use tempfile::tempdir;

#[test]
fn growth_is_transparent_to_existing_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s");
    let store = OpenOptions::new(&path)
        .mode(Mode::WriteOnly)
        .initial_size_kib(1)
        .max_size_kib(512 * 1024)
        .open()
        .unwrap();

    let initial_size = store.size().unwrap();
    let payload = "x".repeat(1024);
    for i in 0..512 {
        store.set(&format!("key-{i:04}"), payload.as_str()).unwrap();
    }

    assert!(
        store.size().unwrap() > initial_size,
        "half a megabyte of values must have grown the file"
    );

    for i in 0..512 {
        let value = store.get(&format!("key-{i:04}")).unwrap().unwrap();
        assert_eq!(value.as_str().unwrap(), payload);
    }

    store.close().unwrap();
    Store::remove_shared_mutex(&path).unwrap();
}

#[test]
fn capped_store_fails_with_file_too_large() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s");
    // max below the clamped initial size pins the file at its initial
    // size: the first grow attempt must fail.
    let store = OpenOptions::new(&path)
        .mode(Mode::WriteOnly)
        .initial_size_kib(1)
        .max_size_kib(4)
        .initial_bucket_count(64)
        .open()
        .unwrap();

    let payload = "x".repeat(1024);
    let mut stored = 0usize;
    let mut capped = false;
    for i in 0..10 {
        match store.set(&format!("k{i}"), payload.as_str()) {
            Ok(()) => stored += 1,
            Err(e) => {
                assert!(matches!(
                    error::kind(&e),
                    Some(StoreError::FileTooLarge)
                ));
                capped = true;
                break;
            }
        }
    }

    assert!(capped, "ten 1 KiB values cannot fit in a capped store");
    assert!(stored >= 1, "the store starts with some free space");

    // What fit stays readable.
    for i in 0..stored {
        assert!(store.get(&format!("k{i}")).unwrap().is_some());
    }

    store.close().unwrap();
    Store::remove_shared_mutex(&path).unwrap();
}

#[test]
fn read_write_handles_cannot_grow() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s");
    {
        let store = OpenOptions::new(&path)
            .mode(Mode::WriteOnly)
            .initial_size_kib(1)
            .initial_bucket_count(64)
            .open()
            .unwrap();
        store.close().unwrap();
    }

    let store = OpenOptions::new(&path)
        .mode(Mode::ReadWrite)
        .max_size_kib(1024 * 1024)
        .open()
        .unwrap();

    // Small writes in place are fine for rw...
    store.set("small", "fits in the leftovers").unwrap();

    // ...but a value beyond the remaining free space needs a resize, which
    // rw must refuse.
    let huge = "x".repeat(4 * 1024 * 1024);
    let err = store.set("huge", huge.as_str()).unwrap_err();
    assert!(matches!(
        error::kind(&err),
        Some(StoreError::GrowRequiresWriteOnly)
    ));

    assert_eq!(
        store.get("small").unwrap().unwrap().as_str().unwrap(),
        "fits in the leftovers"
    );

    store.close().unwrap();
    Store::remove_shared_mutex(&path).unwrap();
}

#[test]
fn grown_store_reopens_cleanly() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s");
    let payload = "y".repeat(2048);
    {
        let store = OpenOptions::new(&path)
            .mode(Mode::WriteOnly)
            .initial_size_kib(1)
            .open()
            .unwrap();
        for i in 0..256 {
            store.set(&format!("grown-{i}"), payload.as_str()).unwrap();
        }
        store.close().unwrap();
    }

    // Close shrank the file to fit; the header and every entry must have
    // survived the truncate.
    let store = Store::open(&path).unwrap();
    for i in (0..256).step_by(17) {
        assert_eq!(
            store.get(&format!("grown-{i}")).unwrap().unwrap().as_str().unwrap(),
            payload
        );
    }
    store.close().unwrap();
    Store::remove_shared_mutex(&path).unwrap();
}
