//! # Section Extractor
//!
//! Splits a raw message into its routing header and the delimited section
//! blocks. A section starts at the beginning of a line with `NAME:{` and runs
//! lazily to the first closing brace that has whitespace before it and
//! whitespace (or the end of the message) after it.

use std::collections::HashMap;

use regex::Regex;

use super::error::{GrammarError, IngestError};
use super::model::{Dashboard, SectionName};

/// The only application the server accepts.
pub const APP_PTS: &str = "pts";

/// # Route Header
///
/// Routing metadata from the first line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHeader {
    /// Application token (always `pts`).
    pub app: String,
    /// Target dashboard.
    pub dashboard: Dashboard,
}

/// Parses the header line `dashboard/<app>/<dashboard>`.
///
/// The first token is matched case-insensitively; the app and dashboard
/// tokens are exact. Tokens past the third are ignored.
pub fn extract_header(message: &str) -> Result<RouteHeader, IngestError> {
    let line = message.split('\n').next().unwrap_or_default().trim_end();
    let tokens: Vec<&str> = line.split('/').collect();

    if tokens.len() < 3 || !tokens[0].eq_ignore_ascii_case("dashboard") {
        return Err(IngestError::InvalidHeader(line.to_string()));
    }
    if tokens[1] != APP_PTS {
        return Err(IngestError::InvalidHeader(line.to_string()));
    }
    let dashboard = tokens[2]
        .parse::<Dashboard>()
        .map_err(|_| IngestError::InvalidHeader(line.to_string()))?;

    Ok(RouteHeader {
        app: tokens[1].to_string(),
        dashboard,
    })
}

/// Compiled section locators, one per known section.
#[derive(Debug, Clone)]
pub struct SectionExtractor {
    patterns: HashMap<SectionName, Regex>,
}

impl SectionExtractor {
    /// Compiles the locator for every known section.
    pub fn new() -> Result<Self, GrammarError> {
        let mut patterns = HashMap::new();
        for section in SectionName::ALL {
            let pattern = format!(
                r"(?ms)^(?P<block>{}:\{{.*?\s\}})(?:\s|\z)",
                regex::escape(section.as_str())
            );
            let regex = Regex::new(&pattern).map_err(|source| GrammarError::Pattern {
                section: section.to_string(),
                rule: "extractor".to_string(),
                source,
            })?;
            patterns.insert(section, regex);
        }
        Ok(Self { patterns })
    }

    /// Returns the delimited block for `section`, `NAME:{` through `}`, or
    /// `None` when the message does not carry it.
    pub fn extract_section<'a>(&self, section: SectionName, message: &'a str) -> Option<&'a str> {
        self.patterns
            .get(&section)?
            .captures(message)?
            .name("block")
            .map(|m| m.as_str())
    }
}
