//! Open configuration.
//!
//! `OpenOptions` is the single entry point for tunables: access mode, size
//! limits, bucket count and the optional shm mapping hint. Zero means
//! "default" for the numeric knobs, so binding layers can pass absent
//! arguments straight through.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use eyre::Result;

use super::Store;

/// Access mode of one store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Maps the file read-only. Mutation fails with `ReadOnly`.
    ReadOnly,
    /// Reads and in-place writes; cannot grow the file.
    ReadWrite,
    /// Exclusive writer: holds the write-only lock exclusively for the
    /// whole session and is the only mode allowed to grow the file.
    WriteOnly,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ReadOnly => "ro",
            Mode::ReadWrite => "rw",
            Mode::WriteOnly => "wo",
        }
    }
}

impl FromStr for Mode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ro" => Ok(Mode::ReadOnly),
            "rw" => Ok(Mode::ReadWrite),
            "wo" => Ok(Mode::WriteOnly),
            other => Err(eyre::eyre!("unknown store mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for opening (or creating) a store.
///
/// ```ignore
/// let store = OpenOptions::new("/tmp/cache")
///     .mode(Mode::WriteOnly)
///     .initial_size_kib(1024)
///     .max_size_kib(64 * 1024)
///     .open()?;
/// ```
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub(crate) path: PathBuf,
    pub(crate) mode: Mode,
    pub(crate) initial_size_kib: u64,
    pub(crate) max_size_kib: u64,
    pub(crate) initial_bucket_count: u32,
    pub(crate) map_base_addr: Option<usize>,
}

impl OpenOptions {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mode: Mode::ReadWrite,
            initial_size_kib: 0,
            max_size_kib: 0,
            initial_bucket_count: 0,
            map_base_addr: None,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Initial file size in KiB when creating. 0 means 5 MiB. Clamped up so
    /// the empty store (header, registry, shard directory and its bucket
    /// arrays) always fits.
    pub fn initial_size_kib(mut self, kib: u64) -> Self {
        self.initial_size_kib = kib;
        self
    }

    /// Growth ceiling in KiB. 0 means 5000 MiB; never below the initial
    /// size.
    pub fn max_size_kib(mut self, kib: u64) -> Self {
        self.max_size_kib = kib;
        self
    }

    /// Total bucket count at create time, divided across the shards.
    /// 0 means 1024.
    pub fn initial_bucket_count(mut self, count: u32) -> Self {
        self.initial_bucket_count = count;
        self
    }

    /// Address hint for mapping the shared-mutex region, for platforms
    /// where default placement differs between processes. See
    /// `config::DEFAULT_MAP_BASE_ADDR`.
    pub fn map_base_addr(mut self, addr: usize) -> Self {
        self.map_base_addr = Some(addr);
        self
    }

    pub fn open(self) -> Result<Store> {
        Store::open_with(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings_round_trip() {
        for mode in [Mode::ReadOnly, Mode::ReadWrite, Mode::WriteOnly] {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        assert!("banana".parse::<Mode>().is_err());
    }
}
