//! Centralized configuration constants.
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{SHARD_COUNT, LOCK_TIMEOUT};
//! ```

mod constants;

pub use constants::*;
