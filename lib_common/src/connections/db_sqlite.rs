//! # SQLite Store
//!
//! `IngestStore` backed by a single `rusqlite` connection. Calls hop onto the
//! blocking pool and serialize on a mutex around the connection.
//!
//! Tables (created on open when missing):
//! - `client_freshness`: one row per `(client_id, dashboard)` with the last
//!   fully processed message checksum and both timestamps.
//! - `section_checksums`: last persisted body checksum per section.
//! - `section_rows`: parsed rows per section as JSON, in parse order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::ingest::checksum::Checksum;
use crate::ingest::error::StoreError;
use crate::ingest::model::{ClientFreshnessRecord, ClientKey, Row, SectionName, SectionRecordSet};
use crate::ingest::store::IngestStore;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS client_freshness (
    client_id        TEXT NOT NULL,
    dashboard        TEXT NOT NULL,
    message_checksum TEXT,
    last_update      TEXT,
    last_seen        TEXT,
    PRIMARY KEY (client_id, dashboard)
);
CREATE TABLE IF NOT EXISTS section_checksums (
    client_id  TEXT NOT NULL,
    dashboard  TEXT NOT NULL,
    section    TEXT NOT NULL,
    checksum   TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (client_id, dashboard, section)
);
CREATE TABLE IF NOT EXISTS section_rows (
    client_id TEXT NOT NULL,
    dashboard TEXT NOT NULL,
    section   TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    row_json  TEXT NOT NULL,
    PRIMARY KEY (client_id, dashboard, section, row_index)
);
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// SQLite implementation of [`IngestStore`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) the database file at `path`, enabling WAL and
    /// creating the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        log::info!("SQLite store ready at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Timestamp(format!("{s:?}: {e}")))
    })
    .transpose()
}

type FreshnessRow = (Option<String>, Option<String>, Option<String>);

fn read_record(conn: &Connection, key: &ClientKey) -> Result<Option<ClientFreshnessRecord>, StoreError> {
    let dashboard = key.dashboard.as_str();

    let freshness: Option<FreshnessRow> = conn
        .query_row(
            "SELECT message_checksum, last_update, last_seen FROM client_freshness
             WHERE client_id = ?1 AND dashboard = ?2",
            params![key.client_id, dashboard],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let mut stmt = conn.prepare(
        "SELECT section, checksum FROM section_checksums
         WHERE client_id = ?1 AND dashboard = ?2",
    )?;
    let pairs = stmt
        .query_map(params![key.client_id, dashboard], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if freshness.is_none() && pairs.is_empty() {
        return Ok(None);
    }

    let mut section_checksums = HashMap::with_capacity(pairs.len());
    for (name, checksum) in pairs {
        let section: SectionName = name.parse().map_err(StoreError::Database)?;
        section_checksums.insert(section, Checksum::from_hex(checksum));
    }

    let (message_checksum, last_update, last_seen) = freshness.unwrap_or((None, None, None));
    Ok(Some(ClientFreshnessRecord {
        message_checksum: message_checksum.map(Checksum::from_hex),
        section_checksums,
        last_update: parse_ts(last_update)?,
        last_seen: parse_ts(last_seen)?,
    }))
}

#[async_trait]
impl IngestStore for SqliteStore {
    async fn get_record(&self, key: &ClientKey) -> Result<Option<ClientFreshnessRecord>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| read_record(conn, &key)).await
    }

    async fn upsert_section(
        &self,
        key: &ClientKey,
        section: SectionName,
        records: &SectionRecordSet,
        checksum: &Checksum,
    ) -> Result<(), StoreError> {
        let encoded = records
            .rows
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        let key = key.clone();
        let checksum = checksum.as_str().to_string();
        let now = format_ts(Utc::now());

        self.with_conn(move |conn| {
            let dashboard = key.dashboard.as_str();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM section_rows WHERE client_id = ?1 AND dashboard = ?2 AND section = ?3",
                params![key.client_id, dashboard, section.as_str()],
            )?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO section_rows (client_id, dashboard, section, row_index, row_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (index, row_json) in encoded.iter().enumerate() {
                    insert.execute(params![
                        key.client_id,
                        dashboard,
                        section.as_str(),
                        index as i64,
                        row_json
                    ])?;
                }
            }
            tx.execute(
                "INSERT INTO section_checksums (client_id, dashboard, section, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (client_id, dashboard, section)
                 DO UPDATE SET checksum = excluded.checksum, updated_at = excluded.updated_at",
                params![key.client_id, dashboard, section.as_str(), checksum, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn touch_freshness(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO client_freshness (client_id, dashboard, last_update)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (client_id, dashboard) DO UPDATE SET last_update = excluded.last_update",
                params![key.client_id, key.dashboard.as_str(), format_ts(at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch_last_seen(&self, key: &ClientKey, at: DateTime<Utc>) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO client_freshness (client_id, dashboard, last_seen)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (client_id, dashboard) DO UPDATE SET last_seen = excluded.last_seen",
                params![key.client_id, key.dashboard.as_str(), format_ts(at)],
            )?;
            Ok(())
        })
        .await
    }

    async fn advance_message_checksum(&self, key: &ClientKey, checksum: &Checksum) -> Result<(), StoreError> {
        let key = key.clone();
        let checksum = checksum.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO client_freshness (client_id, dashboard, message_checksum)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (client_id, dashboard) DO UPDATE SET message_checksum = excluded.message_checksum",
                params![key.client_id, key.dashboard.as_str(), checksum],
            )?;
            Ok(())
        })
        .await
    }

    async fn section_rows(
        &self,
        key: &ClientKey,
        section: SectionName,
    ) -> Result<Option<SectionRecordSet>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let dashboard = key.dashboard.as_str();
            let persisted: Option<String> = conn
                .query_row(
                    "SELECT checksum FROM section_checksums
                     WHERE client_id = ?1 AND dashboard = ?2 AND section = ?3",
                    params![key.client_id, dashboard, section.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if persisted.is_none() {
                return Ok(None);
            }

            let mut stmt = conn.prepare(
                "SELECT row_json FROM section_rows
                 WHERE client_id = ?1 AND dashboard = ?2 AND section = ?3
                 ORDER BY row_index",
            )?;
            let encoded = stmt
                .query_map(params![key.client_id, dashboard, section.as_str()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let rows = encoded
                .iter()
                .map(|json| serde_json::from_str::<Row>(json))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(SectionRecordSet::new(rows)))
        })
        .await
    }
}
