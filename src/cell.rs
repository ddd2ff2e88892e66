//! # Value Cells
//!
//! A cell is the stored form of one value: a 16-byte tagged union living
//! inside the mapped heap. String and buffer payloads are separate heap
//! allocations owned by the cell; numbers are stored inline as IEEE-754
//! bits. A cell's tag never changes after construction — overwriting a key
//! frees the old cell's payload and writes a brand-new cell, which is how a
//! value may change type.
//!
//! ## Views
//!
//! - [`Value`] is the borrowed input type accepted by `set`.
//! - [`OwnedValue`] is a deep copy, detached from the mapping.
//! - `ValueRef` (in `crate::store`) is the zero-copy view returned by `get`;
//!   it borrows the mapping and carries the lock guards that keep the
//!   borrow valid.

use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StoreError;
use crate::heap::MappedHeap;

pub(crate) const TAG_STRING: u32 = 1;
pub(crate) const TAG_NUMBER: u32 = 2;
pub(crate) const TAG_BUFFER: u32 = 3;

/// A value handed to `set`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Str(&'a str),
    Bytes(&'a [u8]),
    F64(f64),
}

impl<'a> Value<'a> {
    /// Bytes of heap payload this value will occupy, used by the growth
    /// heuristic before the allocator has been asked.
    pub fn stored_len(&self) -> u64 {
        match self {
            Value::Str(s) => s.len() as u64,
            Value::Bytes(b) => b.len() as u64,
            Value::F64(_) => std::mem::size_of::<f64>() as u64,
        }
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(s: &'a str) -> Self {
        Value::Str(s)
    }
}

impl<'a> From<&'a String> for Value<'a> {
    fn from(s: &'a String) -> Self {
        Value::Str(s)
    }
}

impl<'a> From<&'a [u8]> for Value<'a> {
    fn from(b: &'a [u8]) -> Self {
        Value::Bytes(b)
    }
}

impl<'a> From<f64> for Value<'a> {
    fn from(n: f64) -> Self {
        Value::F64(n)
    }
}

/// A value copied out of the store, independent of the mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedValue {
    Str(String),
    Bytes(Vec<u8>),
    F64(f64),
}

impl OwnedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OwnedValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OwnedValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OwnedValue::F64(n) => Some(*n),
            _ => None,
        }
    }
}

impl PartialEq<&str> for OwnedValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl PartialEq<f64> for OwnedValue {
    fn eq(&self, other: &f64) -> bool {
        self.as_f64() == Some(*other)
    }
}

/// The stored form. For strings and buffers `data` is the payload offset and
/// `len` its byte length; for numbers `data` holds the f64 bits.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct CellRepr {
    tag: U32,
    len: U32,
    data: U64,
}

const _: () = assert!(std::mem::size_of::<CellRepr>() == 16);

/// Borrowed payload of a cell, resolved against a live mapping. The raw
/// pointers are only dereferenced by `ValueRef`, which owns the guards that
/// keep the mapping and the locks alive.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RawValue {
    Str(*const u8, usize),
    Bytes(*const u8, usize),
    Num(f64),
}

impl CellRepr {
    pub(crate) fn zeroed() -> Self {
        Self {
            tag: U32::new(0),
            len: U32::new(0),
            data: U64::new(0),
        }
    }

    /// Copies `value` into the heap and returns the cell describing it.
    pub(crate) fn store(heap: &MappedHeap, value: Value<'_>) -> Result<Self> {
        match value {
            Value::Str(s) => {
                let off = heap.alloc(s.len() as u64)?;
                heap.write_bytes(off, s.as_bytes())?;
                Ok(Self {
                    tag: U32::new(TAG_STRING),
                    len: U32::new(s.len() as u32),
                    data: U64::new(off),
                })
            }
            Value::Bytes(b) => {
                let off = heap.alloc(b.len() as u64)?;
                heap.write_bytes(off, b)?;
                Ok(Self {
                    tag: U32::new(TAG_BUFFER),
                    len: U32::new(b.len() as u32),
                    data: U64::new(off),
                })
            }
            Value::F64(n) => Ok(Self {
                tag: U32::new(TAG_NUMBER),
                len: U32::new(0),
                data: U64::new(n.to_bits()),
            }),
        }
    }

    /// Frees the payload allocation, if this cell owns one.
    pub(crate) fn free_payload(&self, heap: &MappedHeap) -> Result<()> {
        match self.tag.get() {
            TAG_STRING | TAG_BUFFER => heap.free(self.data.get()),
            _ => Ok(()),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self.tag.get() {
            TAG_STRING => "string",
            TAG_NUMBER => "number",
            TAG_BUFFER => "buffer",
            _ => "uninitialized",
        }
    }

    /// Resolves the payload against the mapping without copying.
    pub(crate) fn raw(&self, heap: &MappedHeap) -> Result<RawValue> {
        match self.tag.get() {
            TAG_STRING => {
                let len = self.len.get() as u64;
                let ptr = heap.ptr_at(self.data.get(), len)?;
                Ok(RawValue::Str(ptr, len as usize))
            }
            TAG_BUFFER => {
                let len = self.len.get() as u64;
                let ptr = heap.ptr_at(self.data.get(), len)?;
                Ok(RawValue::Bytes(ptr, len as usize))
            }
            TAG_NUMBER => Ok(RawValue::Num(f64::from_bits(self.data.get()))),
            tag => Err(StoreError::corrupt(
                heap.path(),
                format!("unknown cell tag {}", tag),
            )
            .into()),
        }
    }

    /// Deep-copies the value out of the mapping.
    pub(crate) fn to_owned(&self, heap: &MappedHeap) -> Result<OwnedValue> {
        match self.tag.get() {
            TAG_STRING => {
                let bytes = heap.bytes(self.data.get(), self.len.get() as u64)?;
                let s = std::str::from_utf8(bytes).map_err(|_| {
                    StoreError::corrupt(heap.path(), "stored string is not valid UTF-8")
                })?;
                Ok(OwnedValue::Str(s.to_string()))
            }
            TAG_BUFFER => {
                let bytes = heap.bytes(self.data.get(), self.len.get() as u64)?;
                Ok(OwnedValue::Bytes(bytes.to_vec()))
            }
            TAG_NUMBER => Ok(OwnedValue::F64(f64::from_bits(self.data.get()))),
            tag => Err(StoreError::corrupt(
                heap.path(),
                format!("unknown cell tag {}", tag),
            )
            .into()),
        }
    }

}

/// Predicted heap cost of storing a value, including its cell.
/// Mirrors the accounting the allocator will do, so the growth heuristic
/// never under-estimates.
pub(crate) fn value_length(value: &Value<'_>) -> u64 {
    value.stored_len() + std::mem::size_of::<CellRepr>() as u64
}
