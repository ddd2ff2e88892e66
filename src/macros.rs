//! # Internal Macros
//!
//! This module provides internal macros for reducing boilerplate in mmstore.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U32, U64). All on-disk structures in the
//! segment (the segment header, shard headers, buckets and cells) store
//! multi-byte fields little-endian so a store written on one machine reads
//! back on any other.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct ShardHeader {
//!     buckets_off: U64,
//!     capacity: U32,
//! }
//!
//! impl ShardHeader {
//!     zerocopy_accessors! {
//!         buckets_off: u64,
//!         capacity: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn buckets_off(&self) -> u64 { self.buckets_off.get() }
//! // pub fn set_buckets_off(&mut self, val: u64) { self.buckets_off = U64::new(val); }
//! // pub fn capacity(&self) -> u32 { self.capacity.get() }
//! // pub fn set_capacity(&mut self, val: u32) { self.capacity = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields (read-only).
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
