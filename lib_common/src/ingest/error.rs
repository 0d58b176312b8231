//! # Ingest Errors
//!
//! `IngestError` is the taxonomy every stage reports with. `InvalidHeader`,
//! `TransportFailure` and a `PersistenceFailure` while reading the prior
//! record end a whole message. Parse errors and `PersistenceFailure` on a
//! section write stay confined to that section.

use thiserror::Error;

/// Errors raised while routing, parsing or persisting a message.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The routing line is not `dashboard/pts/<treatment|tcs>`.
    #[error("invalid header: {0:?}")]
    InvalidHeader(String),

    /// The section body is missing its `NAME:{` or `}` delimiters.
    #[error("malformed section {section}")]
    MalformedSection {
        /// Section name.
        section: String,
    },

    /// No grammar is loaded for this section name.
    #[error("unknown section {0}")]
    UnknownSection(String),

    /// The grammar matched nothing it could turn into rows.
    #[error("section {section} produced no rows")]
    ParseFailure {
        /// Section name.
        section: String,
    },

    /// The store rejected a read or write.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StoreError),

    /// Reading the message failed, timed out, or produced nothing.
    #[error("transport failure: {0}")]
    TransportFailure(String),
}

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected the statement or is unavailable.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be encoded or decoded.
    #[error("row serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored timestamp is not RFC 3339.
    #[error("invalid stored timestamp: {0}")]
    Timestamp(String),
}

/// Errors raised while loading grammar templates at startup.
#[derive(Debug, Error)]
pub enum GrammarError {
    /// A template file or directory could not be read.
    #[error("cannot read template {path}: {source}")]
    Io {
        /// File or directory path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A template is not valid JSON5 or does not match the template schema.
    #[error("invalid template {path}: {reason}")]
    Template {
        /// Where the template came from.
        path: String,
        /// Parser message.
        reason: String,
    },

    /// A rule pattern is not a valid regular expression.
    #[error("section {section}, rule {rule}: invalid pattern: {source}")]
    Pattern {
        /// Section name.
        section: String,
        /// Rule name.
        rule: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// A pivot refers to a capture group the pattern does not define.
    #[error("section {section}, rule {rule}: pivot group {group:?} not in pattern")]
    MissingGroup {
        /// Section name.
        section: String,
        /// Rule name.
        rule: String,
        /// Missing group name.
        group: String,
    },

    /// The template file name and its `section` field disagree.
    #[error("template {path} declares section {section:?}")]
    SectionMismatch {
        /// Template file path.
        path: String,
        /// Section declared inside the file.
        section: String,
    },
}
