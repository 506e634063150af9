//! Informal structured-text spec syntax.
//!
//! ```text
//! # Checkout flow
//! Property: storefront
//! Complexity: standard
//!
//! ## Features
//! ### Cart persistence
//! Priority: P1
//! Labels: api, db
//! Depends on: Session store
//! Files:
//! - src/cart.rs
//! Acceptance:
//! - carts survive restarts :: verify: cargo test cart
//! Free text lines become the description.
//!
//! ## Requirements
//! - no new dependencies
//!
//! ## Success Criteria
//! - checkout works end to end
//! ```
//!
//! Header `Key: value` lines must be known keys. Inside a feature, lines
//! that are not known keys or list items are description text.

use std::sync::OnceLock;

use regex::Regex;

use crate::core::AcceptanceCriterion;
use crate::error::{Error, Result};

use super::document::{FeatureDocument, SpecDocument};

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,3})\s+(.+?)\s*#*\s*$").expect("valid regex"))
}

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z _-]*?)\s*:\s*(.*)$").expect("valid regex"))
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+?)\s*$").expect("valid regex"))
}

fn inline_verify_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)\s*`verify:\s*([^`]+)`\s*$").expect("valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Header,
    Features,
    Requirements,
    Success,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ListKey {
    Files,
    Acceptance,
    DependsOn,
    Labels,
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(['-', '_'], " ")
}

fn split_inline(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_matches('`').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_priority(value: &str, field: &str) -> Result<u8> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix('P')
        .or_else(|| trimmed.strip_prefix('p'))
        .unwrap_or(trimmed);
    digits
        .parse::<u8>()
        .map_err(|_| Error::spec(field, format!("invalid priority {:?}", value.trim())))
}

/// Parse one acceptance bullet, recognising the two verify notations.
pub fn parse_acceptance(text: &str) -> AcceptanceCriterion {
    if let Some((description, command)) = text.split_once(":: verify:") {
        return AcceptanceCriterion::Verified {
            description: description.trim().to_string(),
            verify: command.trim().to_string(),
        };
    }
    if let Some(caps) = inline_verify_re().captures(text) {
        return AcceptanceCriterion::Verified {
            description: caps[1].trim().to_string(),
            verify: caps[2].trim().to_string(),
        };
    }
    AcceptanceCriterion::Description(text.trim().to_string())
}

struct TextParser {
    doc: SpecDocument,
    section: Section,
    feature: Option<FeatureDocument>,
    list: Option<ListKey>,
}

impl TextParser {
    fn new() -> Self {
        Self {
            doc: SpecDocument::default(),
            section: Section::Header,
            feature: None,
            list: None,
        }
    }

    fn feature_field(&self, key: &str) -> String {
        format!("features[{}].{}", self.doc.features.len(), key)
    }

    fn finish_feature(&mut self) {
        if let Some(mut feature) = self.feature.take() {
            feature.description = feature.description.trim().to_string();
            self.doc.features.push(feature);
        }
        self.list = None;
    }

    fn heading(&mut self, level: usize, text: &str) {
        match level {
            1 if self.doc.title.is_empty() => {
                self.doc.title = text.to_string();
            }
            1 | 2 => {
                self.finish_feature();
                let name = text.to_lowercase();
                self.section = if name.starts_with("feature") {
                    Section::Features
                } else if name.contains("requirement") {
                    Section::Requirements
                } else if name.starts_with("success") {
                    Section::Success
                } else {
                    Section::Ignored
                };
            }
            _ => {
                if self.section == Section::Features {
                    self.finish_feature();
                    self.feature = Some(FeatureDocument {
                        title: text.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
    }

    fn header_key(&mut self, key: &str, value: &str, line_no: usize) -> Result<()> {
        match normalize_key(key).as_str() {
            "title" => self.doc.title = value.to_string(),
            "property" | "target" | "target property" => self.doc.property = Some(value.to_string()),
            "complexity" => self.doc.complexity = Some(value.to_string()),
            other => {
                return Err(Error::spec(
                    other.to_string(),
                    format!("unknown header key on line {}", line_no),
                ))
            }
        }
        Ok(())
    }

    /// Returns `false` when the key is not a feature key (the line is prose).
    fn feature_key(&mut self, key: &str, value: &str) -> Result<bool> {
        let key = normalize_key(key);
        let list = match key.as_str() {
            "priority" => {
                let field = self.feature_field("priority");
                let priority = parse_priority(value, &field)?;
                if let Some(feature) = self.feature.as_mut() {
                    feature.priority = Some(priority);
                }
                return Ok(true);
            }
            "description" => {
                if let Some(feature) = self.feature.as_mut() {
                    feature.description.push_str(value);
                    feature.description.push('\n');
                }
                return Ok(true);
            }
            "labels" | "label" => ListKey::Labels,
            "depends on" | "dependencies" | "after" => ListKey::DependsOn,
            "files" => ListKey::Files,
            "acceptance" | "acceptance criteria" => ListKey::Acceptance,
            _ => return Ok(false),
        };

        self.list = Some(list);
        if !value.is_empty() {
            for entry in split_inline(value) {
                self.push_list_entry(list, &entry);
            }
        }
        Ok(true)
    }

    fn push_list_entry(&mut self, list: ListKey, entry: &str) {
        let Some(feature) = self.feature.as_mut() else {
            return;
        };
        match list {
            ListKey::Files => feature.files.push(entry.trim_matches('`').to_string()),
            ListKey::Labels => feature.labels.push(entry.to_string()),
            ListKey::DependsOn => feature.depends_on.push(entry.to_string()),
            ListKey::Acceptance => feature.acceptance.push(parse_acceptance(entry)),
        }
    }

    fn line(&mut self, line_no: usize, raw: &str) -> Result<()> {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            return Ok(());
        }

        if let Some(caps) = heading_re().captures(line) {
            self.heading(caps[1].len(), caps[2].trim());
            return Ok(());
        }

        match self.section {
            Section::Header => {
                if let Some(caps) = key_re().captures(line.trim()) {
                    self.header_key(&caps[1], caps[2].trim(), line_no)?;
                }
            }
            Section::Requirements | Section::Success => {
                let entry = bullet_re()
                    .captures(line)
                    .map(|caps| caps[1].to_string())
                    .unwrap_or_else(|| line.trim().to_string());
                if self.section == Section::Requirements {
                    self.doc.requirements.push(entry);
                } else {
                    self.doc.success.push(entry);
                }
            }
            Section::Features => {
                if self.feature.is_none() {
                    return Ok(());
                }
                if let Some(caps) = bullet_re().captures(line) {
                    if let Some(list) = self.list {
                        self.push_list_entry(list, &caps[1]);
                        return Ok(());
                    }
                }
                if let Some(caps) = key_re().captures(line.trim()) {
                    if self.feature_key(&caps[1], caps[2].trim())? {
                        return Ok(());
                    }
                }
                self.list = None;
                if let Some(feature) = self.feature.as_mut() {
                    feature.description.push_str(line.trim());
                    feature.description.push('\n');
                }
            }
            Section::Ignored => {}
        }
        Ok(())
    }
}

/// Parse the informal structured-text syntax into a [`SpecDocument`].
pub fn parse(content: &str) -> Result<SpecDocument> {
    let mut parser = TextParser::new();
    for (index, line) in content.lines().enumerate() {
        parser.line(index + 1, line)?;
    }
    parser.finish_feature();
    Ok(parser.doc)
}
