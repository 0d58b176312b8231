//! # Dedup Gate
//!
//! Change decisions at two granularities. A client with no stored record
//! mismatches everything, so its first message is processed in full.

use super::checksum::Checksum;
use super::model::{ClientFreshnessRecord, SectionName};

/// True when the whole message differs from the last fully processed one.
pub fn should_process_message(message: &Checksum, prior: Option<&ClientFreshnessRecord>) -> bool {
    prior
        .and_then(|record| record.message_checksum.as_ref())
        .map_or(true, |stored| stored != message)
}

/// True when a section body differs from the last one persisted for it.
///
/// Sections missing from a message never reach this check; their stored
/// rows and checksums stay as they are.
pub fn should_process_section(
    section: SectionName,
    body: &Checksum,
    prior: Option<&ClientFreshnessRecord>,
) -> bool {
    prior
        .and_then(|record| record.section_checksum(section))
        .map_or(true, |stored| stored != body)
}
