//! Complexity classification of work items.
//!
//! The classifier scores each item from static signals and maps the score to
//! a [`ComplexityTier`]. It never selects an agent itself; the tier's
//! [`ComplexityTier::capability`] does that downstream.
//!
//! | signal | weight |
//! |---|---|
//! | broad-scope keywords in title/description | +3 each, at most +6 |
//! | distinct files listed or mentioned | +1 per 3 files, at most +4 |
//! | files spread over more than one subsystem | +2 |
//! | two or more dependencies | +1 |
//!
//! Fifteen or more files force at least `complex`. Scores sitting exactly on
//! a bucket boundary land in the higher tier.

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;

use crate::core::{Classification, ComplexityTier, WorkItem};
use crate::spec::WorkSpec;

pub const KEYWORD_WEIGHT: u32 = 3;
pub const KEYWORD_CAP: u32 = 6;
pub const FILES_PER_POINT: usize = 3;
pub const FILES_CAP: u32 = 4;
pub const SUBSYSTEM_WEIGHT: u32 = 2;
pub const DEPENDENCY_WEIGHT: u32 = 1;
/// Distinct files at which an item is complex regardless of score.
pub const COMPLEX_FILE_THRESHOLD: usize = 15;

pub const SIMPLE_AT: u32 = 2;
pub const STANDARD_AT: u32 = 4;
pub const COMPLEX_AT: u32 = 7;

/// Directories whose children are separate packages.
const PACKAGE_ROOTS: &[&str] = &["crates", "packages", "apps", "services", "libs"];

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(all|every|entire|migrate|migration|refactor|across|rewrite|overhaul|codebase)\b",
        )
        .expect("valid regex")
    })
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\w.-]+(?:/[\w.-]+)*/[\w-]+\.[A-Za-z0-9]+").expect("valid regex")
    })
}

/// Map a score to its tier bucket.
pub fn tier_for_score(score: u32) -> ComplexityTier {
    if score >= COMPLEX_AT {
        ComplexityTier::Complex
    } else if score >= STANDARD_AT {
        ComplexityTier::Standard
    } else if score >= SIMPLE_AT {
        ComplexityTier::Simple
    } else {
        ComplexityTier::Trivial
    }
}

/// Top-level component a file belongs to (`crates/<name>` counts as one).
fn subsystem_of(path: &str) -> String {
    let parts: Vec<String> = Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    match parts.as_slice() {
        [] | [_] => String::new(),
        [root, name, _, ..] if PACKAGE_ROOTS.contains(&root.as_str()) => format!("{}/{}", root, name),
        [root, ..] => root.clone(),
    }
}

/// Scores work items and assigns complexity tiers.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    override_tier: Option<ComplexityTier>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A classifier whose explicit override always wins over the score.
    pub fn with_override(tier: Option<ComplexityTier>) -> Self {
        Self { override_tier: tier }
    }

    pub fn override_tier(&self) -> Option<ComplexityTier> {
        self.override_tier
    }

    /// Classify a single item.
    pub fn classify_item(&self, item: &WorkItem) -> Classification {
        if let Some(tier) = self.override_tier {
            return Classification {
                tier,
                score: 0,
                signals: vec![format!("explicit override: {}", tier)],
                overridden: true,
            };
        }

        let mut score = 0;
        let mut signals = Vec::new();

        let text = format!("{} {}", item.title, item.description);
        let keywords: BTreeSet<String> = keyword_re()
            .find_iter(&text)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        if !keywords.is_empty() {
            let points = (KEYWORD_WEIGHT * keywords.len() as u32).min(KEYWORD_CAP);
            score += points;
            signals.push(format!(
                "broad-scope keywords ({}): +{}",
                keywords.into_iter().collect::<Vec<_>>().join(", "),
                points
            ));
        }

        let mut files: BTreeSet<String> = item
            .files
            .iter()
            .map(|f| f.to_string_lossy().to_string())
            .collect();
        files.extend(
            path_re()
                .find_iter(&item.description)
                .map(|m| m.as_str().to_string()),
        );
        if !files.is_empty() {
            let points = ((files.len() / FILES_PER_POINT) as u32).min(FILES_CAP);
            score += points;
            signals.push(format!("{} files: +{}", files.len(), points));
        }

        let subsystems: BTreeSet<String> = files.iter().map(|f| subsystem_of(f)).collect();
        if subsystems.len() > 1 {
            score += SUBSYSTEM_WEIGHT;
            signals.push(format!(
                "spans {} subsystems: +{}",
                subsystems.len(),
                SUBSYSTEM_WEIGHT
            ));
        }

        if item.depends_on.len() >= 2 {
            score += DEPENDENCY_WEIGHT;
            signals.push(format!(
                "{} dependencies: +{}",
                item.depends_on.len(),
                DEPENDENCY_WEIGHT
            ));
        }

        let mut tier = tier_for_score(score);
        if files.len() >= COMPLEX_FILE_THRESHOLD && tier < ComplexityTier::Complex {
            tier = ComplexityTier::Complex;
            signals.push(format!(
                "{} files reach the complex threshold of {}",
                files.len(),
                COMPLEX_FILE_THRESHOLD
            ));
        }

        Classification {
            tier,
            score,
            signals,
            overridden: false,
        }
    }

    /// Classify and annotate every item of a spec.
    ///
    /// The spec's own complexity override applies when this classifier has
    /// none. Returns the highest tier assigned.
    pub fn classify_spec(&self, spec: &mut WorkSpec) -> ComplexityTier {
        let effective = Classifier::with_override(self.override_tier.or(spec.complexity));
        let mut highest = ComplexityTier::Trivial;
        for item in &mut spec.items {
            let classification = effective.classify_item(item);
            if classification.overridden {
                tracing::info!(item = %item.title, tier = %classification.tier, "complexity overridden");
            } else {
                tracing::debug!(
                    item = %item.title,
                    tier = %classification.tier,
                    score = classification.score,
                    "complexity classified"
                );
            }
            highest = highest.max(classification.tier);
            item.classification = Some(classification);
        }
        highest
    }
}
