//! Surface document shared by both spec syntaxes.
//!
//! The declarative format (TOML or JSON) deserializes straight into these
//! types; the informal text format is parsed into them by [`super::text`].
//! Nothing downstream of [`super::loader::normalize`] sees this type.

use serde::{Deserialize, Serialize};

use crate::core::AcceptanceCriterion;

/// A work spec as written by a human, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecDocument {
    #[serde(default)]
    pub title: String,
    /// Target property the work lands in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
    /// Optional complexity override applied to every feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default)]
    pub features: Vec<FeatureDocument>,
    /// Cross-cutting requirements every session must respect.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Success criteria for the whole run.
    #[serde(default)]
    pub success: Vec<String>,
}

/// A single `[[features]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default)]
    pub files: Vec<String>,
    /// Titles of features that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<AcceptanceCriterion>,
    #[serde(default)]
    pub labels: Vec<String>,
}
