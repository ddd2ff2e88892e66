//! Fuzz testing for store operations.
//!
//! Drives an arbitrary sequence of set/get/delete/enumerate operations
//! against a small capped store and cross-checks every observation against
//! an in-memory model. Exercises the shard tables (probe/rehash/tombstone
//! paths), the in-segment allocator under churn, and the grow-and-retry
//! loop including the FileTooLarge ceiling.

#![no_main]

use std::collections::HashMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use mmstore::error::{self, StoreError};
use mmstore::{Mode, OpenOptions, OwnedValue, Store};

#[derive(Debug, Arbitrary)]
enum Op {
    Set { key: u8, payload_len: u8 },
    SetNumber { key: u8, value: f64 },
    Delete { key: u8 },
    Get { key: u8 },
    Enumerate,
}

fn key_name(key: u8) -> String {
    // A small key universe keeps overwrite and delete paths hot.
    format!("key-{}", key % 32)
}

/// Equality with NaN == NaN, so arbitrary f64 inputs don't trip the model.
fn values_match(a: Option<&OwnedValue>, b: Option<&OwnedValue>) -> bool {
    match (a, b) {
        (Some(OwnedValue::F64(x)), Some(OwnedValue::F64(y))) if x.is_nan() && y.is_nan() => true,
        (a, b) => a == b,
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fuzz");
    let store = OpenOptions::new(&path)
        .mode(Mode::WriteOnly)
        .initial_size_kib(1)
        .max_size_kib(256)
        .initial_bucket_count(64)
        .open()
        .unwrap();

    let mut model: HashMap<String, OwnedValue> = HashMap::new();
    let mut full = false;

    for op in ops {
        match op {
            Op::Set { key, payload_len } => {
                let key = key_name(key);
                let payload = "p".repeat(payload_len as usize);
                match store.set(&key, payload.as_str()) {
                    Ok(()) => {
                        model.insert(key, OwnedValue::Str(payload));
                    }
                    Err(e) => {
                        assert!(
                            matches!(error::kind(&e), Some(StoreError::FileTooLarge)),
                            "unexpected set failure: {e:?}"
                        );
                        full = true;
                    }
                }
            }
            Op::SetNumber { key, value } => {
                let key = key_name(key);
                match store.set(&key, value) {
                    Ok(()) => {
                        model.insert(key, OwnedValue::F64(value));
                    }
                    Err(e) => {
                        assert!(matches!(
                            error::kind(&e),
                            Some(StoreError::FileTooLarge)
                        ));
                        full = true;
                    }
                }
            }
            Op::Delete { key } => {
                let key = key_name(key);
                store.delete(&key).unwrap();
                model.remove(&key);
            }
            Op::Get { key } => {
                let key = key_name(key);
                let found = store.get(&key).unwrap().map(|v| v.to_owned().unwrap());
                assert!(
                    values_match(found.as_ref(), model.get(&key)),
                    "mismatch on {key}: {found:?}"
                );
            }
            Op::Enumerate => {
                let mut keys = store.keys().unwrap();
                keys.sort();
                let mut expected: Vec<String> = model.keys().cloned().collect();
                expected.sort();
                assert_eq!(keys, expected);
            }
        }
    }

    // A saturated store may have refused late sets; a clean run must agree
    // with the model exactly.
    if !full {
        for (key, expected) in &model {
            let found = store.get(key).unwrap().map(|v| v.to_owned().unwrap());
            assert!(
                values_match(found.as_ref(), Some(expected)),
                "final mismatch on {key}"
            );
        }
    }

    store.close().unwrap();
    Store::remove_shared_mutex(&path).unwrap();
});
