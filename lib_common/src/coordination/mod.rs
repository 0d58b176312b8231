//! # Coordination Module
//!
//! Shared-state helpers for concurrent connection handlers.
//!
//! - **`registry`**: a reference-counted map of async mutexes, one per key,
//!   so that two messages for the same client and dashboard never interleave
//!   their dedup check and checksum updates.

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-key async locks with reference-counted cleanup.
pub mod registry;

pub use registry::{KeyGuard, KeyLockRegistry};
