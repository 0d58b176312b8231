//! # Section Grammar
//!
//! Grammars are data, not code: each section is described by a JSON5 template
//! (`template_<NAME>.json5`) holding an ordered list of line rules. A rule is
//! a regular expression with named capture groups; when it matches a line its
//! captures form a partial row.
//!
//! ## Row assembly (`rows` mode)
//! - Each line is offered to the rules in order and the first match wins the
//!   line. Lines matching nothing are skipped.
//! - A **repeatable** rule completes the currently open row when that row has
//!   not yet taken a contribution from the same rule and every field both
//!   share has the same value. Otherwise it opens a new row. This is what
//!   pairs `OISType:`/`OISVersion:` lines and joins the two lines reported for
//!   one PPVS room.
//! - A **singular** rule only uses its first matching line. Its fields are
//!   added to every row, or form the only row when no repeatable rule matched.
//! - A rule with a **pivot** emits `{<captured key>: <captured value>}`
//!   instead of its group names.
//!
//! `blob` mode skips all of this and keeps the section text verbatim in one
//! field.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use regex::{Captures, Regex};
use serde::Deserialize;

use super::error::GrammarError;
use super::model::{Row, SectionName};

/// File name prefix of grammar templates.
pub const TEMPLATE_PREFIX: &str = "template_";
/// File name extension of grammar templates.
pub const TEMPLATE_EXTENSION: &str = "json5";

/// Templates compiled into the binary, used when no template directory is configured.
const BUILTIN_TEMPLATES: [(&str, &str); 5] = [
    ("builtin:TCS", include_str!("../../../templates/template_TCS.json5")),
    ("builtin:OIS", include_str!("../../../templates/template_OIS.json5")),
    ("builtin:PCVUE", include_str!("../../../templates/template_PCVUE.json5")),
    ("builtin:PPVS", include_str!("../../../templates/template_PPVS.json5")),
    ("builtin:IT", include_str!("../../../templates/template_IT.json5")),
];

/// How a section's text becomes rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateMode {
    /// Line rules assemble rows.
    Rows,
    /// The whole text is one opaque value.
    Blob,
}

/// Pivot a key/value capture pair into a single-field row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PivotSpec {
    /// Group whose text becomes the field name.
    pub key: String,
    /// Group whose text becomes the field value.
    pub value: String,
}

/// One rule as written in a template file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleTemplate {
    /// Rule name, used in error messages.
    pub name: String,
    /// Regular expression matched against each trimmed line.
    pub pattern: String,
    /// Repeatable (every match contributes) or singular (first match only).
    #[serde(default)]
    pub repeat: bool,
    /// Optional key/value pivot.
    #[serde(default)]
    pub pivot: Option<PivotSpec>,
}

/// A section template as written in a template file.
#[derive(Debug, Clone, Deserialize)]
pub struct SectionTemplate {
    /// Section this template parses.
    pub section: String,
    /// Assembly mode.
    #[serde(default = "default_mode")]
    pub mode: TemplateMode,
    /// Field name used in blob mode.
    #[serde(default = "default_blob_field")]
    pub blob_field: String,
    /// Ordered line rules (rows mode).
    #[serde(default)]
    pub rules: Vec<RuleTemplate>,
}

fn default_mode() -> TemplateMode {
    TemplateMode::Rows
}

fn default_blob_field() -> String {
    "content".to_string()
}

/// A compiled line rule.
#[derive(Debug, Clone)]
pub struct LineRule {
    name: String,
    regex: Regex,
    repeat: bool,
    pivot: Option<PivotSpec>,
}

impl LineRule {
    fn partial_row(&self, caps: &Captures<'_>) -> Row {
        let mut row = Row::new();
        match &self.pivot {
            Some(pivot) => {
                if let (Some(key), Some(value)) = (caps.name(&pivot.key), caps.name(&pivot.value)) {
                    row.insert(key.as_str().trim().to_string(), value.as_str().to_string());
                }
            }
            None => {
                for name in self.regex.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        row.insert(name.to_string(), m.as_str().to_string());
                    }
                }
            }
        }
        row
    }
}

/// A row under construction and the rules that have filled it.
struct OpenRow {
    fields: Row,
    rules: HashSet<usize>,
}

impl OpenRow {
    fn accepts(&self, rule: usize, partial: &Row) -> bool {
        !self.rules.contains(&rule)
            && partial
                .iter()
                .all(|(k, v)| self.fields.get(k).map_or(true, |existing| existing == v))
    }
}

/// # Section Grammar
///
/// The compiled template for one section.
#[derive(Debug, Clone)]
pub struct SectionGrammar {
    section: String,
    mode: TemplateMode,
    blob_field: String,
    rules: Vec<LineRule>,
}

impl SectionGrammar {
    /// Compiles a template, validating every pattern and pivot.
    pub fn compile(template: SectionTemplate) -> Result<Self, GrammarError> {
        let mut rules = Vec::with_capacity(template.rules.len());
        for rule in template.rules {
            let regex = Regex::new(&rule.pattern).map_err(|source| GrammarError::Pattern {
                section: template.section.clone(),
                rule: rule.name.clone(),
                source,
            })?;
            if let Some(pivot) = &rule.pivot {
                let groups: HashSet<&str> = regex.capture_names().flatten().collect();
                for group in [&pivot.key, &pivot.value] {
                    if !groups.contains(group.as_str()) {
                        return Err(GrammarError::MissingGroup {
                            section: template.section.clone(),
                            rule: rule.name.clone(),
                            group: group.clone(),
                        });
                    }
                }
            }
            rules.push(LineRule {
                name: rule.name,
                regex,
                repeat: rule.repeat,
                pivot: rule.pivot,
            });
        }

        Ok(Self {
            section: template.section,
            mode: template.mode,
            blob_field: template.blob_field,
            rules,
        })
    }

    /// Assembly mode.
    pub fn mode(&self) -> TemplateMode {
        self.mode
    }

    /// Turns the inner text of a section into rows. Never fails; an empty
    /// result is for the caller to judge.
    pub fn apply(&self, text: &str) -> Vec<Row> {
        match self.mode {
            TemplateMode::Blob => vec![Row::from([(self.blob_field.clone(), text.to_string())])],
            TemplateMode::Rows => self.assemble(text),
        }
    }

    fn assemble(&self, text: &str) -> Vec<Row> {
        let mut singular = Row::new();
        let mut singular_seen: HashSet<usize> = HashSet::new();
        let mut rows: Vec<OpenRow> = Vec::new();

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some((index, rule, caps)) = self
                .rules
                .iter()
                .enumerate()
                .find_map(|(i, rule)| rule.regex.captures(line).map(|caps| (i, rule, caps)))
            else {
                continue;
            };

            log::trace!("{}: rule {} matched {:?}", self.section, rule.name, line);
            let partial = rule.partial_row(&caps);
            if partial.is_empty() {
                continue;
            }

            if !rule.repeat {
                if singular_seen.insert(index) {
                    for (k, v) in partial {
                        singular.entry(k).or_insert(v);
                    }
                }
                continue;
            }

            match rows.last_mut() {
                Some(open) if open.accepts(index, &partial) => {
                    open.fields.extend(partial);
                    open.rules.insert(index);
                }
                _ => {
                    rows.push(OpenRow {
                        fields: partial,
                        rules: HashSet::from([index]),
                    });
                }
            }
        }

        if rows.is_empty() {
            return if singular.is_empty() { Vec::new() } else { vec![singular] };
        }

        rows.into_iter()
            .map(|open| {
                let mut fields = open.fields;
                for (k, v) in &singular {
                    fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
                fields
            })
            .collect()
    }
}

/// # Grammar Set
///
/// Every loaded grammar, keyed by section name. Built once at startup and
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct GrammarSet {
    grammars: HashMap<String, SectionGrammar>,
}

impl GrammarSet {
    /// The five default templates shipped with the server.
    pub fn builtin() -> Result<Self, GrammarError> {
        let mut set = GrammarSet::default();
        for (origin, source) in BUILTIN_TEMPLATES {
            set.insert(parse_template(origin, source)?)?;
        }
        Ok(set)
    }

    /// Loads every `template_<NAME>.json5` file in `dir`.
    ///
    /// A template whose `section` differs from its file name is rejected.
    /// Known sections without a template are logged; parsing them later
    /// yields `UnknownSection`.
    pub fn load_dir(dir: &Path) -> Result<Self, GrammarError> {
        let io_err = |source| GrammarError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|ext| ext.to_str()) == Some(TEMPLATE_EXTENSION)
                    && path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| name.starts_with(TEMPLATE_PREFIX))
            })
            .collect();
        paths.sort();

        let mut set = GrammarSet::default();
        for path in paths {
            let origin = path.display().to_string();
            let source = fs::read_to_string(&path).map_err(|source| GrammarError::Io {
                path: origin.clone(),
                source,
            })?;
            let template = parse_template(&origin, &source)?;

            let expected = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(TEMPLATE_PREFIX))
                .unwrap_or_default();
            if template.section != expected {
                return Err(GrammarError::SectionMismatch {
                    path: origin,
                    section: template.section,
                });
            }

            log::debug!("Loaded grammar template {}", origin);
            set.insert(template)?;
        }

        for section in SectionName::ALL {
            if set.get(section.as_str()).is_none() {
                log::warn!(
                    "No grammar template for section {} in {}; it will be reported as unknown.",
                    section,
                    dir.display()
                );
            }
        }

        Ok(set)
    }

    fn insert(&mut self, template: SectionTemplate) -> Result<(), GrammarError> {
        let grammar = SectionGrammar::compile(template)?;
        self.grammars.insert(grammar.section.clone(), grammar);
        Ok(())
    }

    /// Grammar for `section`, if loaded.
    pub fn get(&self, section: &str) -> Option<&SectionGrammar> {
        self.grammars.get(section)
    }

    /// Number of loaded grammars.
    pub fn len(&self) -> usize {
        self.grammars.len()
    }

    /// True when nothing is loaded.
    pub fn is_empty(&self) -> bool {
        self.grammars.is_empty()
    }
}

fn parse_template(origin: &str, source: &str) -> Result<SectionTemplate, GrammarError> {
    serde_json5::from_str::<SectionTemplate>(source).map_err(|e| GrammarError::Template {
        path: origin.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    }

    fn builtin(section: &str) -> SectionGrammar {
        GrammarSet::builtin().unwrap().get(section).unwrap().clone()
    }

    #[test]
    fn test_builtin_loads_all_sections() {
        let set = GrammarSet::builtin().unwrap();
        assert_eq!(set.len(), 5);
        for section in SectionName::ALL {
            assert!(set.get(section.as_str()).is_some(), "missing {section}");
        }
        assert_eq!(set.get("TCS").unwrap().mode(), TemplateMode::Blob);
    }

    #[test]
    fn test_it_pivots_one_row_per_key() {
        let rows = builtin("IT").apply(
            "MCR PythonVersion:2.7.5 (default)\nMCRS3 OSVersion:NAME=SLES; VERSION=12\nnot a pair\n",
        );
        assert_eq!(
            rows,
            vec![
                row(&[("MCR PythonVersion", "2.7.5 (default)")]),
                row(&[("MCRS3 OSVersion", "NAME=SLES; VERSION=12")]),
            ]
        );
    }

    #[test]
    fn test_ois_pairs_lines_into_rows() {
        let rows = builtin("OIS").apply(
            "OISType:Varian\nOISVersion:15.6\nOISType:Elekta\nOISVersion:5.1\n",
        );
        assert_eq!(
            rows,
            vec![
                row(&[("ois_type", "Varian"), ("ois_version", "15.6")]),
                row(&[("ois_type", "Elekta"), ("ois_version", "5.1")]),
            ]
        );
    }

    #[test]
    fn test_ppvs_joins_lines_of_the_same_room() {
        let rows = builtin("PPVS").apply(
            "PPVS1Version:3.2.1\nPPVS1ConfigVersion:44\nPPVS2Version:3.2.0\nPPVS3ConfigVersion:12\n",
        );
        assert_eq!(
            rows,
            vec![
                row(&[("room", "1"), ("version", "3.2.1"), ("config_version", "44")]),
                row(&[("room", "2"), ("version", "3.2.0")]),
                row(&[("room", "3"), ("config_version", "12")]),
            ]
        );
    }

    #[test]
    fn test_singular_rule_first_match_wins() {
        let rows = builtin("PCVUE").apply("PCVUE Version:11.2.06\nPCVUE Version:9.0.0\n");
        assert_eq!(rows, vec![row(&[("version", "11.2.06")])]);
    }

    #[test]
    fn test_singular_fields_apply_to_every_row() {
        let template: SectionTemplate = serde_json5::from_str(
            r#"{
                section: "X",
                rules: [
                    { name: "site", pattern: "^Site:(?P<site>.*)$" },
                    { name: "item", pattern: "^Item:(?P<item>.*)$", repeat: true },
                ],
            }"#,
        )
        .unwrap();
        let grammar = SectionGrammar::compile(template).unwrap();
        let rows = grammar.apply("Item:a\nSite:Liege\nItem:b\nSite:Other\n");
        assert_eq!(
            rows,
            vec![
                row(&[("item", "a"), ("site", "Liege")]),
                row(&[("item", "b"), ("site", "Liege")]),
            ]
        );
    }

    #[test]
    fn test_blob_keeps_text_verbatim() {
        let text = "PTS DB: demo\n  indented line \n";
        assert_eq!(builtin("TCS").apply(text), vec![row(&[("content", text)])]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let grammar = builtin("PPVS");
        let text = "PPVS1Version:3\nPPVS1ConfigVersion:4\n";
        assert_eq!(grammar.apply(text), grammar.apply(text));
    }

    #[test]
    fn test_compile_rejects_bad_pattern_and_pivot() {
        let bad_pattern: SectionTemplate =
            serde_json5::from_str(r#"{ section: "X", rules: [{ name: "r", pattern: "(" }] }"#).unwrap();
        assert!(matches!(
            SectionGrammar::compile(bad_pattern),
            Err(GrammarError::Pattern { .. })
        ));

        let bad_pivot: SectionTemplate = serde_json5::from_str(
            r#"{ section: "X", rules: [{ name: "r", pattern: "(?P<k>.*)", pivot: { key: "k", value: "v" } }] }"#,
        )
        .unwrap();
        assert!(matches!(
            SectionGrammar::compile(bad_pivot),
            Err(GrammarError::MissingGroup { .. })
        ));
    }

    #[test]
    fn test_load_dir_reads_templates() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("template_PCVUE.json5"),
            r#"{ section: "PCVUE", rules: [{ name: "v", pattern: "^V=(?P<version>.*)$" }] }"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let set = GrammarSet::load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get("PCVUE").unwrap().apply("V=1.0"),
            vec![row(&[("version", "1.0")])]
        );
    }

    #[test]
    fn test_load_dir_without_templates_is_empty() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("readme.json5"), "{}").unwrap();
        let set = GrammarSet::load_dir(dir.path()).unwrap();
        assert!(set.is_empty());
        assert!(!GrammarSet::builtin().unwrap().is_empty());
    }

    #[test]
    fn test_load_dir_rejects_section_mismatch() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("template_OIS.json5"),
            r#"{ section: "IT", rules: [] }"#,
        )
        .unwrap();
        assert!(matches!(
            GrammarSet::load_dir(dir.path()),
            Err(GrammarError::SectionMismatch { .. })
        ));
    }

    #[test]
    fn test_repository_templates_match_builtin() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../templates");
        let set = GrammarSet::load_dir(&dir).unwrap();
        assert_eq!(set.len(), 5);
    }
}
