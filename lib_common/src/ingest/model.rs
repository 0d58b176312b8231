//! # Ingest Data Model
//!
//! Typed names for the five sections and two dashboards the agents report,
//! the `(client-id, dashboard)` key everything is stored under, and the
//! shapes that reach the store.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checksum::Checksum;

/// One parsed row: field name to captured value.
pub type Row = BTreeMap<String, String>;

/// # Section Name
///
/// The sections an agent may include in a message. The declaration order is
/// the order the pipeline visits them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionName {
    /// TCS version file, stored verbatim.
    #[serde(rename = "TCS")]
    Tcs,
    /// OIS type/version pairs.
    #[serde(rename = "OIS")]
    Ois,
    /// PcVue supervisory version.
    #[serde(rename = "PCVUE")]
    Pcvue,
    /// Per-room PPVS version and config version.
    #[serde(rename = "PPVS")]
    Ppvs,
    /// Free-form IT inventory.
    #[serde(rename = "IT")]
    It,
}

impl SectionName {
    /// All sections, in processing order.
    pub const ALL: [SectionName; 5] = [
        SectionName::Tcs,
        SectionName::Ois,
        SectionName::Pcvue,
        SectionName::Ppvs,
        SectionName::It,
    ];

    /// The wire name, e.g. `"PCVUE"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionName::Tcs => "TCS",
            SectionName::Ois => "OIS",
            SectionName::Pcvue => "PCVUE",
            SectionName::Ppvs => "PPVS",
            SectionName::It => "IT",
        }
    }
}

impl fmt::Display for SectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown section name {s:?}"))
    }
}

/// # Dashboard
///
/// The dashboard a message is routed to, taken from the third header token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dashboard {
    /// Treatment room dashboard.
    Treatment,
    /// TCS dashboard.
    Tcs,
}

impl Dashboard {
    /// The wire name, e.g. `"treatment"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dashboard::Treatment => "treatment",
            Dashboard::Tcs => "tcs",
        }
    }
}

impl fmt::Display for Dashboard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dashboard {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "treatment" => Ok(Dashboard::Treatment),
            "tcs" => Ok(Dashboard::Tcs),
            other => Err(format!("unknown dashboard {other:?}")),
        }
    }
}

/// # Client Key
///
/// The identity every checksum, row set and timestamp is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    /// Site identifier derived from the agent's address.
    pub client_id: String,
    /// Dashboard named in the message header.
    pub dashboard: Dashboard,
}

impl ClientKey {
    /// Builds a key from a client id and dashboard.
    pub fn new(client_id: impl Into<String>, dashboard: Dashboard) -> Self {
        Self {
            client_id: client_id.into(),
            dashboard,
        }
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.dashboard)
    }
}

/// # Section Record Set
///
/// The ordered rows produced by parsing one section. A new set for the same
/// key and section replaces the old one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionRecordSet {
    /// Rows in the order their lines appeared.
    pub rows: Vec<Row>,
}

impl SectionRecordSet {
    /// Wraps already assembled rows.
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows were produced.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// # Client Freshness Record
///
/// What the store remembers about one `(client-id, dashboard)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientFreshnessRecord {
    /// Checksum of the last whole message that was fully processed.
    pub message_checksum: Option<Checksum>,
    /// Checksum of each section's last successfully persisted body.
    pub section_checksums: HashMap<SectionName, Checksum>,
    /// When changed content was last accepted.
    pub last_update: Option<DateTime<Utc>>,
    /// When any routable message was last received, changed or not.
    pub last_seen: Option<DateTime<Utc>>,
}

impl ClientFreshnessRecord {
    /// Stored checksum for `section`, if any.
    pub fn section_checksum(&self, section: SectionName) -> Option<&Checksum> {
        self.section_checksums.get(&section)
    }
}
