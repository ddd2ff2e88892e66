//! # Store Error Kinds
//!
//! All fallible operations in mmstore return `eyre::Result` with rich
//! context, following the same propagation style as the storage layer's
//! `wrap_err_with` calls. Callers that need to react to a *specific* failure
//! (the grow-and-retry loop in `set`, a caller distinguishing "busy" from
//! "corrupt") discriminate through the typed [`StoreError`] kind embedded in
//! the report rather than by parsing messages.
//!
//! ## Discriminating errors
//!
//! ```ignore
//! match mmstore::error::kind(&report) {
//!     Some(StoreError::BusyWriteOnly(_)) => retry_later(),
//!     Some(StoreError::VersionMismatch { .. }) => refuse_file(),
//!     _ => return Err(report),
//! }
//! ```
//!
//! `kind` walks the full context chain, so a kind stays visible no matter
//! how many `wrap_err` layers were added on the way up.
//!
//! ## Kinds that never occur
//!
//! The reference surface also reported `UnsupportedKey` and
//! `UnsupportedValue`. Those conditions are unrepresentable here: keys are
//! `&str` and values a closed enum, so the type system refuses them before
//! the store is reached. I/O failures travel as `std::io::Error` inside the
//! chain and remain downcastable the same way.

use std::path::Path;

use thiserror::Error;

/// Typed failure kinds surfaced at the store façade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("'{0}' does not exist, cannot open read-only")]
    NotFound(String),

    #[error("'{0}' is not a regular file")]
    NotRegularFile(String),

    #[error("'{0}' is an empty file")]
    Empty(String),

    #[error("file '{0}' appears to be corrupt ({1})")]
    Corrupt(String, String),

    #[error("cannot open '{0}', another process has this open write-only")]
    BusyWriteOnly(String),

    #[error("cannot lock '{0}' for write-only, another process has this file open")]
    Busy(String),

    #[error("file '{path}' is format version {found} (version {expected} is expected)")]
    VersionMismatch {
        path: String,
        found: u32,
        expected: u32,
    },

    #[error("cannot write to read-only store")]
    ReadOnly,

    #[error("store is closed")]
    Closed,

    #[error("attempted to close a closed store")]
    AlreadyClosed,

    #[error("file grew too large")]
    FileTooLarge,

    #[error("file needs to be larger but can only be resized in write-only mode")]
    GrowRequiresWriteOnly,

    #[error("wrong value type: stored cell is a {found}, not a {expected}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("shared mutex region is corrupt or abandoned")]
    LockBroken,

    /// Internal: the in-segment allocator ran out of room. The façade's
    /// grow-and-retry loop consumes this; it only escapes when growth is
    /// forbidden or exhausted.
    #[error("segment out of space: need {needed} bytes, {free} free")]
    OutOfSpace { needed: u64, free: u64 },
}

impl StoreError {
    pub(crate) fn corrupt(path: &Path, detail: impl Into<String>) -> Self {
        StoreError::Corrupt(path.display().to_string(), detail.into())
    }
}

/// Extracts the typed kind from a report, looking through context layers.
pub fn kind(report: &eyre::Report) -> Option<&StoreError> {
    report.downcast_ref::<StoreError>()
}

/// True when the report carries the given kind, matching on discriminant.
pub fn is_kind(report: &eyre::Report, probe: fn(&StoreError) -> bool) -> bool {
    kind(report).is_some_and(probe)
}
