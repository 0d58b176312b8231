//! # Ingest Store
//!
//! The persistence seam used by the pipeline. One backend holds both the
//! checksum bookkeeping and the parsed rows, so that replacing a section's
//! rows and advancing its checksum can share a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::checksum::Checksum;
use super::error::StoreError;
use super::model::{ClientFreshnessRecord, ClientKey, SectionName, SectionRecordSet};

/// Storage operations the ingest pipeline needs.
///
/// Implementations must serialize their own access; callers additionally
/// hold the per-key lock for the duration of a message.
#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Everything stored for `key`, or `None` for a client never seen.
    async fn get_record(&self, key: &ClientKey) -> Result<Option<ClientFreshnessRecord>, StoreError>;

    /// Replaces the rows of `section` for `key` and records `checksum` as the
    /// section's last persisted body. All-or-nothing: on error neither the
    /// rows nor the checksum change.
    async fn upsert_section(
        &self,
        key: &ClientKey,
        section: SectionName,
        records: &SectionRecordSet,
        checksum: &Checksum,
    ) -> Result<(), StoreError>;

    /// Sets the freshness timestamp (changed content accepted).
    async fn touch_freshness(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Sets the liveness timestamp (any routable message received).
    async fn touch_last_seen(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Records `checksum` as the last fully processed message.
    async fn advance_message_checksum(&self, key: &ClientKey, checksum: &Checksum) -> Result<(), StoreError>;

    /// The stored rows of `section`, or `None` if never persisted.
    async fn section_rows(
        &self,
        key: &ClientKey,
        section: SectionName,
    ) -> Result<Option<SectionRecordSet>, StoreError>;
}
