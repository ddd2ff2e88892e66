//! # Method-Name Filter
//!
//! Language bindings that expose a store as a property bag need one
//! predicate: does this property name address the store's own API, or is it
//! a data key? The reserved set is fixed at compile time, so the filter is
//! a perfect-hash set; the names themselves are the binding-surface
//! spellings and include the host-language object machinery some runtimes
//! probe for.
//!
//! The core never consults this filter — reserved names passed to `get` or
//! `set` are ordinary keys. Routing is entirely the caller's concern.

use phf::phf_set;

static RESERVED: phf::Set<&'static str> = phf_set! {
    "bucket_count",
    "close",
    "fileFormatVersion",
    "get_free_memory",
    "get_size",
    "isClosed",
    "isOpen",
    "load_factor",
    "max_bucket_count",
    "max_load_factor",
    "propertyIsEnumerable",
    "remove_shared_mutex",
    "toString",
    "valueOf",
};

/// True when `name` addresses the store API rather than a data key.
pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_names_are_reserved() {
        for name in ["close", "isOpen", "get_size", "load_factor", "valueOf"] {
            assert!(is_reserved(name), "{name} should be reserved");
        }
    }

    #[test]
    fn data_keys_are_not() {
        for name in ["", "a", "Close", "close ", "get_size2", "some key"] {
            assert!(!is_reserved(name), "{name} should not be reserved");
        }
    }

    #[test]
    fn the_set_is_exactly_fourteen_names() {
        assert_eq!(RESERVED.len(), 14);
    }
}
