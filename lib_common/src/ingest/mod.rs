//! # Ingest Module
//!
//! Everything between "bytes arrived on a socket" and "rows are in the store".
//! A message is routed by its header line, checked against the last checksums
//! seen for the same client and dashboard, split into named sections and each
//! changed section is parsed with its grammar template and persisted.
//!
//! ## Contained Modules:
//! - **`model`**: section names, dashboards, client keys, rows and freshness records.
//! - **`error`**: the error taxonomy shared by every stage.
//! - **`checksum`**: content hashing used for change detection.
//! - **`extractor`**: header routing and section extraction.
//! - **`grammar`**: JSON5 rule templates and row assembly.
//! - **`parser`**: delimiter checks and grammar application per section.
//! - **`dedup`**: message and section change decisions.
//! - **`store`**: the persistence seam (`IngestStore`).
//! - **`pipeline`**: the per-message state machine (`Ingestor`).

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Section names, routing keys and persisted record shapes.
pub mod model;
/// Error taxonomy for routing, parsing and persistence.
pub mod error;
/// SHA-256 content checksums.
pub mod checksum;
/// Header routing and section extraction.
pub mod extractor;
/// Declarative section grammars loaded from JSON5 templates.
pub mod grammar;
/// Record parser wrapping grammar application.
pub mod parser;
/// Message and section change detection.
pub mod dedup;
/// Storage trait implemented by the persistence backends.
pub mod store;
/// The per-message ingest state machine.
pub mod pipeline;

// --- Public API Re-exports ---
pub use checksum::Checksum;
pub use error::{GrammarError, IngestError, StoreError};
pub use extractor::{RouteHeader, SectionExtractor};
pub use grammar::{GrammarSet, SectionGrammar};
pub use model::{ClientFreshnessRecord, ClientKey, Dashboard, Row, SectionName, SectionRecordSet};
pub use parser::RecordParser;
pub use pipeline::{IngestOutcome, Ingestor, MessageDisposition, SectionReport, SectionStatus};
pub use store::IngestStore;
