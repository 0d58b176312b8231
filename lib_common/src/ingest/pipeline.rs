//! # Ingest Pipeline
//!
//! The per-message state machine run by every connection handler once the
//! bytes are in:
//!
//! `Routing -> DedupCheck -> {Skip | SectionLoop} -> Done`
//!
//! Everything from the dedup check to the final checksum advance happens
//! under the key lock of the message's `(client-id, dashboard)`, so two
//! deliveries for the same key never interleave.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::coordination::KeyLockRegistry;

use super::checksum::Checksum;
use super::dedup::{should_process_message, should_process_section};
use super::error::{GrammarError, IngestError};
use super::extractor::{extract_header, SectionExtractor};
use super::grammar::GrammarSet;
use super::model::{ClientFreshnessRecord, ClientKey, SectionName};
use super::parser::RecordParser;
use super::store::IngestStore;

/// Whether a message went through the section loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// The message differed from the last one and its sections were visited.
    Processed,
    /// Byte-identical to the last fully processed message; nothing was parsed.
    Unchanged,
}

/// What happened to one section of a processed message.
#[derive(Debug)]
pub enum SectionStatus {
    /// The message did not contain the section.
    Absent,
    /// The section body matched the stored checksum.
    Unchanged,
    /// Rows were replaced.
    Persisted {
        /// Number of rows written.
        rows: usize,
    },
    /// Parsing or persisting failed; stored rows and checksum are untouched.
    Failed(IngestError),
}

/// One line of an [`IngestOutcome`].
#[derive(Debug)]
pub struct SectionReport {
    /// Section visited.
    pub section: SectionName,
    /// Result for that section.
    pub status: SectionStatus,
}

/// Summary of one message, logged by the handler.
#[derive(Debug)]
pub struct IngestOutcome {
    /// Key the message was routed to.
    pub key: ClientKey,
    /// Skip or full processing.
    pub disposition: MessageDisposition,
    /// Per-section results, in processing order. Empty when unchanged.
    pub sections: Vec<SectionReport>,
    /// Whether `last_update` was advanced.
    pub freshness_updated: bool,
    /// Whether the whole-message checksum was advanced.
    pub checksum_advanced: bool,
}

impl IngestOutcome {
    fn count(&self, pred: impl Fn(&SectionStatus) -> bool) -> usize {
        self.sections.iter().filter(|r| pred(&r.status)).count()
    }

    /// Sections whose rows were replaced.
    pub fn persisted(&self) -> usize {
        self.count(|s| matches!(s, SectionStatus::Persisted { .. }))
    }

    /// Sections that failed to parse or persist.
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SectionStatus::Failed(_)))
    }

    /// Status recorded for `section`, if it was visited.
    pub fn status(&self, section: SectionName) -> Option<&SectionStatus> {
        self.sections
            .iter()
            .find(|r| r.section == section)
            .map(|r| &r.status)
    }
}

impl fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disposition {
            MessageDisposition::Unchanged => write!(f, "{}: unchanged, skipped", self.key),
            MessageDisposition::Processed => write!(
                f,
                "{}: {} persisted, {} unchanged, {} failed, {} absent",
                self.key,
                self.persisted(),
                self.count(|s| matches!(s, SectionStatus::Unchanged)),
                self.failed(),
                self.count(|s| matches!(s, SectionStatus::Absent)),
            ),
        }
    }
}

/// Routes, deduplicates, parses and persists whole messages.
pub struct Ingestor {
    extractor: SectionExtractor,
    parser: RecordParser,
    store: Arc<dyn IngestStore>,
    locks: KeyLockRegistry<ClientKey>,
}

impl Ingestor {
    /// Builds an ingestor over `grammars` and `store`.
    pub fn new(grammars: GrammarSet, store: Arc<dyn IngestStore>) -> Result<Self, GrammarError> {
        Ok(Self {
            extractor: SectionExtractor::new()?,
            parser: RecordParser::new(grammars),
            store,
            locks: KeyLockRegistry::new(),
        })
    }

    /// Processes one complete message received from `client_id`.
    ///
    /// # Errors
    /// Only message-level failures are returned: `TransportFailure` for an
    /// empty message, `InvalidHeader`, and `PersistenceFailure` when the
    /// prior record cannot be read. Section failures are reported inside the
    /// outcome.
    pub async fn process(&self, client_id: &str, raw: &[u8]) -> Result<IngestOutcome, IngestError> {
        if raw.is_empty() {
            return Err(IngestError::TransportFailure("empty message".to_string()));
        }

        let text = String::from_utf8_lossy(raw);
        let header = extract_header(&text)?;
        let key = ClientKey::new(client_id, header.dashboard);
        let message_checksum = Checksum::of(raw);

        let _guard = self.locks.lock(key.clone()).await;

        let prior = self.store.get_record(&key).await?;

        if let Err(e) = self.store.touch_last_seen(&key, Utc::now()).await {
            log::warn!("{}: could not record last_seen: {}", key, e);
        }

        if !should_process_message(&message_checksum, prior.as_ref()) {
            log::debug!("{}: message checksum unchanged", key);
            return Ok(IngestOutcome {
                key,
                disposition: MessageDisposition::Unchanged,
                sections: Vec::new(),
                freshness_updated: false,
                checksum_advanced: false,
            });
        }

        let mut sections = Vec::with_capacity(SectionName::ALL.len());
        for section in SectionName::ALL {
            let status = self.process_section(&key, section, &text, prior.as_ref()).await;
            sections.push(SectionReport { section, status });
        }

        let freshness_updated = match self.store.touch_freshness(&key, Utc::now()).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("{}: could not update freshness: {}", key, e);
                false
            }
        };

        let write_failed = sections.iter().any(|r| {
            matches!(
                r.status,
                SectionStatus::Failed(IngestError::PersistenceFailure(_))
            )
        });

        let mut checksum_advanced = false;
        if freshness_updated && !write_failed {
            match self.store.advance_message_checksum(&key, &message_checksum).await {
                Ok(()) => checksum_advanced = true,
                Err(e) => log::error!("{}: could not store message checksum: {}", key, e),
            }
        } else {
            log::warn!("{}: message checksum kept so a resend is reprocessed", key);
        }

        Ok(IngestOutcome {
            key,
            disposition: MessageDisposition::Processed,
            sections,
            freshness_updated,
            checksum_advanced,
        })
    }

    async fn process_section(
        &self,
        key: &ClientKey,
        section: SectionName,
        text: &str,
        prior: Option<&ClientFreshnessRecord>,
    ) -> SectionStatus {
        let Some(block) = self.extractor.extract_section(section, text) else {
            return SectionStatus::Absent;
        };

        let body = Checksum::of(block.as_bytes());
        if !should_process_section(section, &body, prior) {
            log::debug!("{}: section {} unchanged", key, section);
            return SectionStatus::Unchanged;
        }

        let records = match self.parser.parse(section.as_str(), block) {
            Ok(records) => records,
            Err(e) => {
                log::warn!("{}: section {} not parsed: {}", key, section, e);
                return SectionStatus::Failed(e);
            }
        };

        match self.store.upsert_section(key, section, &records, &body).await {
            Ok(()) => SectionStatus::Persisted { rows: records.len() },
            Err(e) => {
                log::warn!("{}: section {} not persisted: {}", key, section, e);
                SectionStatus::Failed(e.into())
            }
        }
    }
}

#[cfg(all(test, feature = "connections"))]
mod tests {
    use super::*;
    use crate::connections::SqliteStore;
    use crate::ingest::error::StoreError;
    use crate::ingest::model::{Dashboard, Row, SectionRecordSet};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const CLIENT: &str = "10.20.3";

    /// Delegates to SQLite, counting section writes. Section writes for one
    /// section, the freshness write and the record read can be made to fail.
    struct FlakyStore {
        inner: SqliteStore,
        fail_section: Option<SectionName>,
        failing: AtomicBool,
        fail_freshness: AtomicBool,
        fail_record_read: AtomicBool,
        upserts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_section: Option<SectionName>) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                fail_section,
                failing: AtomicBool::new(fail_section.is_some()),
                fail_freshness: AtomicBool::new(false),
                fail_record_read: AtomicBool::new(false),
                upserts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IngestStore for FlakyStore {
        async fn get_record(&self, key: &ClientKey) -> Result<Option<ClientFreshnessRecord>, StoreError> {
            if self.fail_record_read.load(Ordering::SeqCst) {
                return Err(StoreError::Database("database is locked".to_string()));
            }
            self.inner.get_record(key).await
        }

        async fn upsert_section(
            &self,
            key: &ClientKey,
            section: SectionName,
            records: &SectionRecordSet,
            checksum: &Checksum,
        ) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) && self.fail_section == Some(section) {
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            self.upserts.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_section(key, section, records, checksum).await
        }

        async fn touch_freshness(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError> {
            if self.fail_freshness.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            self.inner.touch_freshness(key, at).await
        }

        async fn touch_last_seen(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.touch_last_seen(key, at).await
        }

        async fn advance_message_checksum(&self, key: &ClientKey, checksum: &Checksum) -> Result<(), StoreError> {
            self.inner.advance_message_checksum(key, checksum).await
        }

        async fn section_rows(
            &self,
            key: &ClientKey,
            section: SectionName,
        ) -> Result<Option<SectionRecordSet>, StoreError> {
            self.inner.section_rows(key, section).await
        }
    }

    fn ingestor(store: Arc<FlakyStore>) -> Ingestor {
        Ingestor::new(GrammarSet::builtin().unwrap(), store).unwrap()
    }

    fn treatment() -> ClientKey {
        ClientKey::new(CLIENT, Dashboard::Treatment)
    }

    fn message(ppvs_version: &str) -> String {
        format!(
            "dashboard/pts/treatment\n\
             OIS:{{\nOISType:Varian\nOISVersion:15.6\n}}\n\
             PPVS:{{\nPPVS1Version:{ppvs_version}\nPPVS1ConfigVersion:7\n}}\n\
             IT:{{\nHostname:pts-01\nOS:Windows 10\n}}\n"
        )
    }

    #[tokio::test]
    async fn test_new_client_it_message() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));
        let raw = b"dashboard/pts/treatment\nIT:{\nKey1:Val1\n}\n";

        let outcome = ingestor.process(CLIENT, raw).await.unwrap();
        assert_eq!(outcome.disposition, MessageDisposition::Processed);
        assert!(matches!(
            outcome.status(SectionName::It),
            Some(SectionStatus::Persisted { rows: 1 })
        ));
        assert!(matches!(outcome.status(SectionName::Tcs), Some(SectionStatus::Absent)));
        assert!(outcome.freshness_updated);
        assert!(outcome.checksum_advanced);

        let rows = store.section_rows(&treatment(), SectionName::It).await.unwrap().unwrap();
        assert_eq!(rows.rows, vec![Row::from([("Key1".to_string(), "Val1".to_string())])]);

        let record = store.get_record(&treatment()).await.unwrap().unwrap();
        assert!(record.last_update.is_some());
        assert_eq!(record.message_checksum, Some(Checksum::of(raw)));
        assert_eq!(
            record.section_checksum(SectionName::It),
            Some(&Checksum::of(b"IT:{\nKey1:Val1\n}"))
        );
    }

    #[tokio::test]
    async fn test_invalid_dashboard_leaves_store_untouched() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));

        let result = ingestor
            .process(CLIENT, b"dashboard/pts/staging\nIT:{\nKey1:Val1\n}\n")
            .await;
        assert!(matches!(result, Err(IngestError::InvalidHeader(_))));

        for dashboard in [Dashboard::Treatment, Dashboard::Tcs] {
            let key = ClientKey::new(CLIENT, dashboard);
            assert!(store.get_record(&key).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_empty_message_is_transport_failure() {
        let ingestor = ingestor(Arc::new(FlakyStore::new(None)));
        assert!(matches!(
            ingestor.process(CLIENT, b"").await,
            Err(IngestError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_only_changed_ppvs_is_rewritten() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));

        ingestor.process(CLIENT, message("3.1").as_bytes()).await.unwrap();
        let before = store.get_record(&treatment()).await.unwrap().unwrap();
        let ois_before = store.section_rows(&treatment(), SectionName::Ois).await.unwrap();
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);

        let outcome = ingestor.process(CLIENT, message("3.2").as_bytes()).await.unwrap();
        assert_eq!(outcome.persisted(), 1);
        assert!(matches!(outcome.status(SectionName::Ois), Some(SectionStatus::Unchanged)));
        assert!(matches!(outcome.status(SectionName::It), Some(SectionStatus::Unchanged)));
        assert_eq!(store.upserts.load(Ordering::SeqCst), 4);

        let after = store.get_record(&treatment()).await.unwrap().unwrap();
        assert_ne!(after.message_checksum, before.message_checksum);
        assert_ne!(
            after.section_checksum(SectionName::Ppvs),
            before.section_checksum(SectionName::Ppvs)
        );
        for unchanged in [SectionName::Ois, SectionName::It] {
            assert_eq!(after.section_checksum(unchanged), before.section_checksum(unchanged));
        }
        assert_eq!(
            store.section_rows(&treatment(), SectionName::Ois).await.unwrap(),
            ois_before
        );

        let ppvs = store.section_rows(&treatment(), SectionName::Ppvs).await.unwrap().unwrap();
        assert_eq!(ppvs.rows[0]["version"], "3.2");
    }

    #[tokio::test]
    async fn test_identical_message_is_skipped_but_seen() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));
        let raw = message("3.1");

        ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        let first = store.get_record(&treatment()).await.unwrap().unwrap();
        let writes = store.upserts.load(Ordering::SeqCst);

        let outcome = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert_eq!(outcome.disposition, MessageDisposition::Unchanged);
        assert!(outcome.sections.is_empty());
        assert!(!outcome.freshness_updated);
        assert_eq!(store.upserts.load(Ordering::SeqCst), writes);

        let second = store.get_record(&treatment()).await.unwrap().unwrap();
        assert_eq!(second.last_update, first.last_update);
        assert_eq!(second.message_checksum, first.message_checksum);
        assert!(second.last_seen >= first.last_seen);
        assert!(second.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_prior_state_and_retry_succeeds() {
        let store = Arc::new(FlakyStore::new(Some(SectionName::Ppvs)));
        store.failing.store(false, Ordering::SeqCst);
        let ingestor = ingestor(Arc::clone(&store));

        ingestor.process(CLIENT, message("3.1").as_bytes()).await.unwrap();
        let prior = store.get_record(&treatment()).await.unwrap().unwrap();
        let prior_rows = store.section_rows(&treatment(), SectionName::Ppvs).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let raw = message("3.2");
        let outcome = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert!(matches!(
            outcome.status(SectionName::Ppvs),
            Some(SectionStatus::Failed(IngestError::PersistenceFailure(_)))
        ));
        assert!(!outcome.checksum_advanced);

        let after = store.get_record(&treatment()).await.unwrap().unwrap();
        assert_eq!(
            after.section_checksum(SectionName::Ppvs),
            prior.section_checksum(SectionName::Ppvs)
        );
        assert_eq!(after.message_checksum, prior.message_checksum);
        assert_eq!(
            store.section_rows(&treatment(), SectionName::Ppvs).await.unwrap(),
            prior_rows
        );

        store.failing.store(false, Ordering::SeqCst);
        let retry = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert_eq!(retry.disposition, MessageDisposition::Processed);
        assert!(matches!(
            retry.status(SectionName::Ppvs),
            Some(SectionStatus::Persisted { .. })
        ));
        assert!(retry.checksum_advanced);
        let ppvs = store.section_rows(&treatment(), SectionName::Ppvs).await.unwrap().unwrap();
        assert_eq!(ppvs.rows[0]["version"], "3.2");
    }

    #[tokio::test]
    async fn test_parse_failure_is_isolated() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));
        let raw = "dashboard/pts/tcs\n\
                   OIS:{\nnothing useful\n}\n\
                   PCVUE:{\nPCVUE Version:11.2\n}\n";

        let outcome = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert!(matches!(
            outcome.status(SectionName::Ois),
            Some(SectionStatus::Failed(IngestError::ParseFailure { .. }))
        ));
        assert!(matches!(
            outcome.status(SectionName::Pcvue),
            Some(SectionStatus::Persisted { rows: 1 })
        ));
        assert!(outcome.checksum_advanced);

        let key = ClientKey::new(CLIENT, Dashboard::Tcs);
        let record = store.get_record(&key).await.unwrap().unwrap();
        assert!(record.section_checksum(SectionName::Ois).is_none());
        assert!(store.section_rows(&key, SectionName::Ois).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dashboards_are_tracked_separately() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));
        let body = "IT:{\nKey1:Val1\n}\n";

        ingestor
            .process(CLIENT, format!("dashboard/pts/treatment\n{body}").as_bytes())
            .await
            .unwrap();
        let outcome = ingestor
            .process(CLIENT, format!("dashboard/pts/tcs\n{body}").as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            outcome.status(SectionName::It),
            Some(SectionStatus::Persisted { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_freshness_write_keeps_message_checksum() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));
        let raw = message("3.1");

        store.fail_freshness.store(true, Ordering::SeqCst);
        let outcome = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert_eq!(outcome.disposition, MessageDisposition::Processed);
        assert_eq!(outcome.persisted(), 3);
        assert!(!outcome.freshness_updated);
        assert!(!outcome.checksum_advanced);
        let record = store.get_record(&treatment()).await.unwrap().unwrap();
        assert!(record.message_checksum.is_none());
        assert!(record.last_update.is_none());

        store.fail_freshness.store(false, Ordering::SeqCst);
        let resend = ingestor.process(CLIENT, raw.as_bytes()).await.unwrap();
        assert_eq!(resend.disposition, MessageDisposition::Processed);
        assert!(resend.freshness_updated);
        assert!(resend.checksum_advanced);
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreadable_record_aborts_before_any_section_write() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = ingestor(Arc::clone(&store));

        store.fail_record_read.store(true, Ordering::SeqCst);
        let result = ingestor.process(CLIENT, message("3.1").as_bytes()).await;
        assert!(matches!(result, Err(IngestError::PersistenceFailure(_))));
        assert_eq!(store.upserts.load(Ordering::SeqCst), 0);

        store.fail_record_read.store(false, Ordering::SeqCst);
        assert!(store.get_record(&treatment()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_identical_messages_persist_once() {
        let store = Arc::new(FlakyStore::new(None));
        let ingestor = Arc::new(ingestor(Arc::clone(&store)));
        let raw = message("3.1");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ingestor = Arc::clone(&ingestor);
            let raw = raw.clone();
            handles.push(tokio::spawn(async move {
                ingestor.process(CLIENT, raw.as_bytes()).await.unwrap().disposition
            }));
        }
        let mut processed = 0;
        for handle in handles {
            if handle.await.unwrap() == MessageDisposition::Processed {
                processed += 1;
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
    }
}
