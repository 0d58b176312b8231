//! # lib_common
//!
//! Shared core of the CCD fingerprint ingestion server. Every folder is a
//! feature-gated module so the binaries only pull in what they use:
//!
//! - **`ingest`**: header routing, section extraction, grammar templates,
//!   checksums, the dedup gate and the per-message pipeline.
//! - **`coordination`**: per-key async locks shared by connection handlers.
//! - **`connections`**: the SQLite store behind the checksum and row tables.

#![forbid(unsafe_code)]

#[cfg(feature = "coordination")]
pub mod coordination;
#[cfg(feature = "ingest")]
pub mod ingest;
#[cfg(feature = "connections")]
pub mod connections;

// Re-export the types every binary touches.
#[cfg(feature = "ingest")]
pub use ingest::{GrammarSet, IngestError, IngestOutcome, Ingestor};
#[cfg(feature = "connections")]
pub use connections::db_sqlite::SqliteStore;
