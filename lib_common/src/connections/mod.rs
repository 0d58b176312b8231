//! # Connections Module
//!
//! Persistent backends behind the ingest pipeline.

/// SQLite store for checksums, timestamps and parsed rows.
pub mod db_sqlite;

pub use db_sqlite::SqliteStore;
