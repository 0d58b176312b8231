//! # Record Parser
//!
//! Checks the `NAME:{ ... }` delimiters of an extracted section, strips them
//! and hands the inner text to the section's grammar. Each call is independent;
//! a failure here never touches sibling sections.

use super::error::IngestError;
use super::grammar::{GrammarSet, TemplateMode};
use super::model::SectionRecordSet;

/// Applies the loaded grammars to extracted section blocks.
#[derive(Debug, Clone)]
pub struct RecordParser {
    grammars: GrammarSet,
}

impl RecordParser {
    /// Wraps a grammar set.
    pub fn new(grammars: GrammarSet) -> Self {
        Self { grammars }
    }

    /// Parses one delimited section block into rows.
    ///
    /// # Errors
    /// - `UnknownSection` when no grammar is loaded for `section`.
    /// - `MalformedSection` when the block lacks its delimiters.
    /// - `ParseFailure` when a rows-mode grammar matched nothing.
    pub fn parse(&self, section: &str, block: &str) -> Result<SectionRecordSet, IngestError> {
        let grammar = self
            .grammars
            .get(section)
            .ok_or_else(|| IngestError::UnknownSection(section.to_string()))?;

        let inner = section_inner(section, block).ok_or_else(|| IngestError::MalformedSection {
            section: section.to_string(),
        })?;

        let rows = grammar.apply(inner);
        if rows.is_empty() && grammar.mode() == TemplateMode::Rows {
            return Err(IngestError::ParseFailure {
                section: section.to_string(),
            });
        }

        log::debug!("Parsed section {} into {} row(s)", section, rows.len());
        Ok(SectionRecordSet::new(rows))
    }
}

/// Text between `NAME:{` and the closing `}`, minus the newline that follows
/// the opening brace.
fn section_inner<'a>(section: &str, block: &'a str) -> Option<&'a str> {
    let inner = block
        .trim()
        .strip_prefix(section)?
        .strip_prefix(":{")?
        .strip_suffix('}')?;
    Some(
        inner
            .strip_prefix("\r\n")
            .or_else(|| inner.strip_prefix('\n'))
            .unwrap_or(inner),
    )
}
