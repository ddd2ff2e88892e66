//! Shard tables inside the mapped heap.
//!
//! The `"properties"` named object is a directory of 64 shard headers; each
//! header points at that shard's bucket array, a separate heap allocation.
//! Buckets are 32 bytes: the key (offset + length into the heap) and the
//! value cell inline.
//!
//! ```text
//! "properties"  +-------------------+
//!               | ShardHeader 0     | --> bucket array (capacity x 32 B)
//!               | ShardHeader 1     | --> bucket array
//!               | ...               |
//!               | ShardHeader 63    | --> bucket array
//!               +-------------------+
//! ```
//!
//! All mutation happens under the shard's exclusive lock; reads under its
//! shared lock. The table itself is lock-free code — the shared-mutex layer
//! provides the exclusion.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::cell::{CellRepr, OwnedValue, Value};
use crate::config::{
    MAX_LOAD_DEN, MAX_LOAD_NUM, MIN_SHARD_BUCKETS, SHARD_COUNT,
};
use crate::error::StoreError;
use crate::heap::MappedHeap;

use super::hash_key;

pub const SHARD_HEADER_SIZE: u64 = 32;
pub const BUCKET_SIZE: u64 = 32;

/// `key_off` sentinel values. Real keys always sit behind a block header,
/// so their offsets are far above these.
const KEY_EMPTY: u64 = 0;
const KEY_TOMBSTONE: u64 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ShardHeader {
    buckets_off: U64,
    capacity: U32,
    len: U32,
    tombstones: U32,
    reserved: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<ShardHeader>() as u64 == SHARD_HEADER_SIZE);

impl ShardHeader {
    crate::zerocopy_accessors! {
        buckets_off: u64,
        capacity: u32,
        len: u32,
        tombstones: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct Bucket {
    key_off: U64,
    key_len: U32,
    reserved: U32,
    cell: CellRepr,
}

const _: () = assert!(std::mem::size_of::<Bucket>() as u64 == BUCKET_SIZE);

impl Bucket {
    fn tombstone() -> Self {
        Self {
            key_off: U64::new(KEY_TOMBSTONE),
            key_len: U32::new(0),
            reserved: U32::new(0),
            cell: CellRepr::zeroed(),
        }
    }

    fn occupied(key_off: u64, key_len: u32, cell: CellRepr) -> Self {
        Self {
            key_off: U64::new(key_off),
            key_len: U32::new(key_len),
            reserved: U32::new(0),
            cell,
        }
    }

    fn is_entry(&self) -> bool {
        self.key_off.get() > KEY_TOMBSTONE
    }
}

/// Where a probe ended.
enum Slot {
    /// The key is present in the bucket at this offset.
    Found(u64, Bucket),
    /// The key is absent; an insert goes to the bucket at this offset.
    Vacant { off: u64, reuses_tombstone: bool },
}

/// One shard's table, addressed by the offset of its header.
#[derive(Debug, Clone, Copy)]
pub struct ShardTable {
    header_off: u64,
}

impl ShardTable {
    pub fn at(header_off: u64) -> Self {
        Self { header_off }
    }

    /// Allocates the initial bucket array. Called once per shard when the
    /// `"properties"` directory is constructed.
    pub fn init(&self, heap: &MappedHeap, capacity: u32) -> Result<()> {
        debug_assert!(capacity.is_power_of_two());
        let buckets_off = heap.alloc_zeroed(capacity as u64 * BUCKET_SIZE)?;
        let mut header = ShardHeader {
            buckets_off: U64::new(0),
            capacity: U32::new(0),
            len: U32::new(0),
            tombstones: U32::new(0),
            reserved: [0u8; 12],
        };
        header.set_buckets_off(buckets_off);
        header.set_capacity(capacity);
        heap.write_obj(self.header_off, &header)
    }

    fn header(&self, heap: &MappedHeap) -> Result<ShardHeader> {
        let header: ShardHeader = heap.read_obj(self.header_off)?;
        ensure!(
            header.capacity().is_power_of_two() && header.buckets_off() != 0,
            StoreError::corrupt(heap.path(), "malformed shard header")
        );
        Ok(header)
    }

    pub fn len(&self, heap: &MappedHeap) -> Result<u32> {
        Ok(self.header(heap)?.len())
    }

    pub fn capacity(&self, heap: &MappedHeap) -> Result<u32> {
        Ok(self.header(heap)?.capacity())
    }

    fn bucket_off(header: &ShardHeader, idx: u64) -> u64 {
        header.buckets_off() + idx * BUCKET_SIZE
    }

    fn key_matches(heap: &MappedHeap, bucket: &Bucket, key: &[u8]) -> Result<bool> {
        if bucket.key_len.get() as usize != key.len() {
            return Ok(false);
        }
        let stored = heap.bytes(bucket.key_off.get(), key.len() as u64)?;
        Ok(stored == key)
    }

    /// Linear probe from the hash's seed position to the key or the first
    /// insertable slot.
    fn probe(&self, heap: &MappedHeap, header: &ShardHeader, key: &[u8], hash: u64) -> Result<Slot> {
        let mask = header.capacity() as u64 - 1;
        let mut idx = (hash >> SHARD_COUNT.trailing_zeros()) & mask;
        let mut first_tombstone: Option<u64> = None;

        for _ in 0..=mask {
            let off = Self::bucket_off(header, idx);
            let bucket: Bucket = heap.read_obj(off)?;
            match bucket.key_off.get() {
                KEY_EMPTY => {
                    return Ok(match first_tombstone {
                        Some(t) => Slot::Vacant {
                            off: t,
                            reuses_tombstone: true,
                        },
                        None => Slot::Vacant {
                            off,
                            reuses_tombstone: false,
                        },
                    });
                }
                KEY_TOMBSTONE => {
                    first_tombstone.get_or_insert(off);
                }
                _ => {
                    if Self::key_matches(heap, &bucket, key)? {
                        return Ok(Slot::Found(off, bucket));
                    }
                }
            }
            idx = (idx + 1) & mask;
        }

        // A full pass without an empty slot: the load-factor bound keeps a
        // healthy table from ever getting here, but a tombstone must exist.
        match first_tombstone {
            Some(t) => Ok(Slot::Vacant {
                off: t,
                reuses_tombstone: true,
            }),
            None => Err(StoreError::corrupt(heap.path(), "shard table has no free slot").into()),
        }
    }

    pub fn get(&self, heap: &MappedHeap, key: &str, hash: u64) -> Result<Option<CellRepr>> {
        let header = self.header(heap)?;
        match self.probe(heap, &header, key.as_bytes(), hash)? {
            Slot::Found(_, bucket) => Ok(Some(bucket.cell)),
            Slot::Vacant { .. } => Ok(None),
        }
    }

    /// Inserts or overwrites. Overwrite frees the old payload and replaces
    /// the cell wholesale, so the value's type may change.
    pub fn insert(&self, heap: &MappedHeap, key: &str, hash: u64, value: Value<'_>) -> Result<()> {
        let mut header = self.header(heap)?;

        if occupancy_exceeded(&header) {
            let new_cap = if load_exceeded(header.len() + 1, header.capacity()) {
                header.capacity() * 2
            } else {
                // Plenty of live room; rehashing at the same size just
                // clears tombstones.
                header.capacity()
            };
            header = self.rehash(heap, &header, new_cap)?;
        }

        match self.probe(heap, &header, key.as_bytes(), hash)? {
            Slot::Found(off, bucket) => {
                let cell = CellRepr::store(heap, value)?;
                bucket.cell.free_payload(heap)?;
                let updated = Bucket::occupied(bucket.key_off.get(), bucket.key_len.get(), cell);
                heap.write_obj(off, &updated)
            }
            Slot::Vacant {
                off,
                reuses_tombstone,
            } => {
                let key_bytes = key.as_bytes();
                let key_off = heap.alloc(key_bytes.len() as u64)?;
                heap.write_bytes(key_off, key_bytes)?;

                let cell = match CellRepr::store(heap, value) {
                    Ok(cell) => cell,
                    Err(e) => {
                        // Roll back the key allocation so a failed insert
                        // leaves the table byte-identical.
                        heap.free(key_off)?;
                        return Err(e);
                    }
                };

                heap.write_obj(off, &Bucket::occupied(key_off, key_bytes.len() as u32, cell))?;
                header.set_len(header.len() + 1);
                if reuses_tombstone {
                    header.set_tombstones(header.tombstones() - 1);
                }
                heap.write_obj(self.header_off, &header)
            }
        }
    }

    /// Removes a key, freeing its bytes. Missing keys are a no-op success.
    pub fn remove(&self, heap: &MappedHeap, key: &str, hash: u64) -> Result<bool> {
        let mut header = self.header(heap)?;
        match self.probe(heap, &header, key.as_bytes(), hash)? {
            Slot::Found(off, bucket) => {
                bucket.cell.free_payload(heap)?;
                heap.free(bucket.key_off.get())?;
                heap.write_obj(off, &Bucket::tombstone())?;
                header.set_len(header.len() - 1);
                header.set_tombstones(header.tombstones() + 1);
                heap.write_obj(self.header_off, &header)?;
                Ok(true)
            }
            Slot::Vacant { .. } => Ok(false),
        }
    }

    /// Appends every key in this shard to `out`.
    pub fn push_keys(&self, heap: &MappedHeap, out: &mut Vec<String>) -> Result<()> {
        self.for_each_entry(heap, |key, _| {
            out.push(key);
            Ok(())
        })
    }

    /// Copies every entry out of this shard.
    pub fn entries(&self, heap: &MappedHeap) -> Result<Vec<(String, OwnedValue)>> {
        let mut out = Vec::with_capacity(self.len(heap)? as usize);
        self.for_each_entry(heap, |key, cell| {
            out.push((key, cell.to_owned(heap)?));
            Ok(())
        })?;
        Ok(out)
    }

    fn for_each_entry(
        &self,
        heap: &MappedHeap,
        mut f: impl FnMut(String, &CellRepr) -> Result<()>,
    ) -> Result<()> {
        let header = self.header(heap)?;
        for idx in 0..header.capacity() as u64 {
            let bucket: Bucket = heap.read_obj(Self::bucket_off(&header, idx))?;
            if !bucket.is_entry() {
                continue;
            }
            let bytes = heap.bytes(bucket.key_off.get(), bucket.key_len.get() as u64)?;
            let key = std::str::from_utf8(bytes)
                .map_err(|_| StoreError::corrupt(heap.path(), "stored key is not valid UTF-8"))?
                .to_string();
            f(key, &bucket.cell)?;
        }
        Ok(())
    }

    /// Moves every entry into a fresh bucket array of `new_cap` slots. The
    /// old array is untouched until the new one is fully built, so an
    /// allocation failure leaves the shard consistent.
    fn rehash(&self, heap: &MappedHeap, header: &ShardHeader, new_cap: u32) -> Result<ShardHeader> {
        debug_assert!(new_cap.is_power_of_two());
        let new_off = heap.alloc_zeroed(new_cap as u64 * BUCKET_SIZE)?;
        let mask = new_cap as u64 - 1;

        for idx in 0..header.capacity() as u64 {
            let bucket: Bucket = heap.read_obj(Self::bucket_off(header, idx))?;
            if !bucket.is_entry() {
                continue;
            }
            let key = heap.bytes(bucket.key_off.get(), bucket.key_len.get() as u64)?;
            let hash = hash_key(key);
            let mut pos = (hash >> SHARD_COUNT.trailing_zeros()) & mask;
            loop {
                let off = new_off + pos * BUCKET_SIZE;
                let probe: Bucket = heap.read_obj(off)?;
                if probe.key_off.get() == KEY_EMPTY {
                    heap.write_obj(off, &bucket)?;
                    break;
                }
                pos = (pos + 1) & mask;
            }
        }

        let mut updated = *header;
        updated.set_buckets_off(new_off);
        updated.set_capacity(new_cap);
        updated.set_tombstones(0);
        heap.write_obj(self.header_off, &updated)?;
        heap.free(header.buckets_off())?;
        Ok(updated)
    }
}

fn load_exceeded(occupied: u32, capacity: u32) -> bool {
    occupied as u64 * MAX_LOAD_DEN > capacity as u64 * MAX_LOAD_NUM
}

fn occupancy_exceeded(header: &ShardHeader) -> bool {
    load_exceeded(header.len() + header.tombstones() + 1, header.capacity())
}

/// The `"properties"` object: 64 shard headers back to back.
#[derive(Debug, Clone, Copy)]
pub struct ShardDirectory {
    base_off: u64,
}

impl ShardDirectory {
    /// Total size of the directory allocation.
    pub const SIZE: u64 = SHARD_COUNT as u64 * SHARD_HEADER_SIZE;

    pub fn at(base_off: u64) -> Self {
        Self { base_off }
    }

    /// Initializes all shards, splitting `total_buckets` across them.
    pub fn init(&self, heap: &MappedHeap, total_buckets: u32) -> Result<()> {
        let per_shard = (total_buckets / SHARD_COUNT as u32)
            .next_power_of_two()
            .max(MIN_SHARD_BUCKETS);
        for idx in 0..SHARD_COUNT {
            self.shard(idx).init(heap, per_shard)?;
        }
        Ok(())
    }

    pub fn shard(&self, idx: usize) -> ShardTable {
        debug_assert!(idx < SHARD_COUNT);
        ShardTable::at(self.base_off + idx as u64 * SHARD_HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_FILE_SIZE;
    use crate::index::hash_key;
    use tempfile::tempdir;

    fn table() -> (tempfile::TempDir, MappedHeap, ShardTable) {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE * 100).unwrap();
        let (off, _) = heap.find_or_construct("shard", SHARD_HEADER_SIZE).unwrap();
        let table = ShardTable::at(off);
        table.init(&heap, MIN_SHARD_BUCKETS).unwrap();
        (dir, heap, table)
    }

    fn put(heap: &MappedHeap, table: &ShardTable, key: &str, value: Value<'_>) {
        table.insert(heap, key, hash_key(key.as_bytes()), value).unwrap();
    }

    fn get(heap: &MappedHeap, table: &ShardTable, key: &str) -> Option<OwnedValue> {
        table
            .get(heap, key, hash_key(key.as_bytes()))
            .unwrap()
            .map(|cell| cell.to_owned(heap).unwrap())
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let (_dir, heap, table) = table();

        put(&heap, &table, "a", Value::Str("alpha"));
        put(&heap, &table, "b", Value::F64(3.14));

        assert_eq!(get(&heap, &table, "a").unwrap(), "alpha");
        assert_eq!(get(&heap, &table, "b").unwrap(), 3.14);
        assert_eq!(get(&heap, &table, "c"), None);

        assert!(table.remove(&heap, "a", hash_key(b"a")).unwrap());
        assert_eq!(get(&heap, &table, "a"), None);
        assert!(!table.remove(&heap, "a", hash_key(b"a")).unwrap());
    }

    #[test]
    fn overwrite_replaces_value_and_may_change_type() {
        let (_dir, heap, table) = table();

        put(&heap, &table, "k", Value::Str("first"));
        put(&heap, &table, "k", Value::F64(2.0));

        assert_eq!(get(&heap, &table, "k").unwrap(), 2.0);
        assert_eq!(table.len(&heap).unwrap(), 1);
    }

    #[test]
    fn overwrite_frees_the_old_payload() {
        let (_dir, heap, table) = table();

        put(&heap, &table, "k", Value::Str("a payload worth freeing"));
        let before = heap.free_memory().unwrap();
        put(&heap, &table, "k", Value::Str("a payload worth freeing"));
        assert_eq!(heap.free_memory().unwrap(), before);
    }

    #[test]
    fn empty_key_is_a_regular_key() {
        let (_dir, heap, table) = table();

        put(&heap, &table, "", Value::Str("empty"));
        assert_eq!(get(&heap, &table, "").unwrap(), "empty");
        assert!(table.remove(&heap, "", hash_key(b"")).unwrap());
    }

    #[test]
    fn grows_through_many_rehashes() {
        let (_dir, heap, table) = table();

        for i in 0..1000 {
            let key = format!("key-{i}");
            put(&heap, &table, &key, Value::F64(i as f64));
        }
        assert_eq!(table.len(&heap).unwrap(), 1000);
        assert!(table.capacity(&heap).unwrap() >= 1024);

        for i in (0..1000).step_by(97) {
            let key = format!("key-{i}");
            assert_eq!(get(&heap, &table, &key).unwrap(), i as f64);
        }
    }

    #[test]
    fn tombstones_are_reclaimed_by_rehash() {
        let (_dir, heap, table) = table();

        for round in 0..50 {
            let key = format!("churn-{round}");
            put(&heap, &table, &key, Value::Str("v"));
            assert!(table.remove(&heap, &key, hash_key(key.as_bytes())).unwrap());
        }
        // Churn must not have inflated the table.
        assert_eq!(table.len(&heap).unwrap(), 0);
        assert!(table.capacity(&heap).unwrap() <= 32);
    }

    #[test]
    fn entries_lists_everything() {
        let (_dir, heap, table) = table();

        put(&heap, &table, "x", Value::Str("ex"));
        put(&heap, &table, "y", Value::Bytes(&[1, 2, 3]));

        let mut entries = table.entries(&heap).unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            vec![
                ("x".to_string(), OwnedValue::Str("ex".into())),
                ("y".to_string(), OwnedValue::Bytes(vec![1, 2, 3])),
            ]
        );
    }

    #[test]
    fn directory_splits_buckets_across_shards() {
        let dir = tempdir().unwrap();
        let heap = MappedHeap::create(dir.path().join("seg"), MIN_FILE_SIZE * 100).unwrap();
        let (off, _) = heap
            .find_or_construct("properties", ShardDirectory::SIZE)
            .unwrap();
        let directory = ShardDirectory::at(off);
        directory.init(&heap, 1024).unwrap();

        for idx in [0, 31, 63] {
            assert_eq!(directory.shard(idx).capacity(&heap).unwrap(), 16);
            assert_eq!(directory.shard(idx).len(&heap).unwrap(), 0);
        }
    }
}
