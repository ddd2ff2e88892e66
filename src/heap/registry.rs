//! Named-object registry.
//!
//! Sixteen fixed slots directly after the segment header, mapping a short
//! name to the offset of an allocation. `find_or_construct` is idempotent:
//! the first caller allocates, later callers find. The store uses two
//! names, `"version"` and `"properties"`; the rest of the table is slack
//! for format evolution.
//!
//! Registry mutation happens only inside the open flow, which holds the
//! global lock exclusively, so slot updates never race.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{REGISTRY_CAPACITY, REGISTRY_ENTRY_SIZE, REGISTRY_NAME_LEN, REGISTRY_OFFSET};

use super::segment::MappedHeap;

/// One registry slot. `offset` 0 marks a vacant slot; names are NUL padded.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RegistryEntry {
    name: [u8; REGISTRY_NAME_LEN],
    offset: U64,
}

const _: () = assert!(std::mem::size_of::<RegistryEntry>() == REGISTRY_ENTRY_SIZE);

impl RegistryEntry {
    fn matches(&self, name: &[u8]) -> bool {
        self.offset.get() != 0
            && self.name[..name.len()] == *name
            && self.name[name.len()..].iter().all(|&b| b == 0)
    }
}

fn slot_offset(idx: usize) -> u64 {
    REGISTRY_OFFSET + (idx * REGISTRY_ENTRY_SIZE) as u64
}

impl MappedHeap {
    /// Looks up a named object, returning its payload offset.
    pub fn find_named(&self, name: &str) -> Result<Option<u64>> {
        let name = name.as_bytes();
        ensure!(
            !name.is_empty() && name.len() < REGISTRY_NAME_LEN,
            "registry name '{}' must be 1..{} bytes",
            String::from_utf8_lossy(name),
            REGISTRY_NAME_LEN
        );

        for idx in 0..REGISTRY_CAPACITY {
            let entry: RegistryEntry = self.read_obj(slot_offset(idx))?;
            if entry.matches(name) {
                return Ok(Some(entry.offset.get()));
            }
        }
        Ok(None)
    }

    /// Finds the named object or allocates `size` zeroed bytes for it.
    /// Returns the payload offset and whether this call constructed it.
    pub fn find_or_construct(&self, name: &str, size: u64) -> Result<(u64, bool)> {
        if let Some(off) = self.find_named(name)? {
            return Ok((off, false));
        }

        let name_bytes = name.as_bytes();
        let Some(vacant) = (0..REGISTRY_CAPACITY).find(|&idx| {
            self.read_obj::<RegistryEntry>(slot_offset(idx))
                .map(|e| e.offset.get() == 0)
                .unwrap_or(false)
        }) else {
            bail!("named-object registry is full ({} slots)", REGISTRY_CAPACITY);
        };

        let off = self.alloc_zeroed(size)?;

        let mut entry = RegistryEntry {
            name: [0u8; REGISTRY_NAME_LEN],
            offset: U64::new(off),
        };
        entry.name[..name_bytes.len()].copy_from_slice(name_bytes);
        self.write_obj(slot_offset(vacant), &entry)?;

        Ok((off, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_FILE_SIZE;
    use tempfile::tempdir;

    #[test]
    fn construct_then_find() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE).unwrap();

        let (off, created) = heap.find_or_construct("version", 4).unwrap();
        assert!(created);
        assert_eq!(heap.find_named("version").unwrap(), Some(off));

        let (again, created) = heap.find_or_construct("version", 4).unwrap();
        assert!(!created);
        assert_eq!(again, off);
    }

    #[test]
    fn missing_names_find_nothing() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE).unwrap();
        assert_eq!(heap.find_named("properties").unwrap(), None);
    }

    #[test]
    fn names_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let off = {
            let heap = MappedHeap::create(&path, MIN_FILE_SIZE).unwrap();
            let (off, _) = heap.find_or_construct("properties", 64).unwrap();
            heap.flush().unwrap();
            off
        };

        let heap = MappedHeap::open(&path).unwrap();
        assert_eq!(heap.find_named("properties").unwrap(), Some(off));
    }

    #[test]
    fn similar_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE).unwrap();

        let (a, _) = heap.find_or_construct("prop", 8).unwrap();
        let (b, _) = heap.find_or_construct("properties", 8).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.find_named("prop").unwrap(), Some(a));
    }
}
