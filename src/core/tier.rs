//! Complexity and capability tiers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Execution tier chosen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Trivial,
    Simple,
    Standard,
    Complex,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 4] = [
        ComplexityTier::Trivial,
        ComplexityTier::Simple,
        ComplexityTier::Standard,
        ComplexityTier::Complex,
    ];

    /// Capability tier of the agent that executes work of this tier.
    pub fn capability(&self) -> CapabilityTier {
        match self {
            ComplexityTier::Trivial | ComplexityTier::Simple => CapabilityTier::Light,
            ComplexityTier::Standard => CapabilityTier::Standard,
            ComplexityTier::Complex => CapabilityTier::Heavy,
        }
    }

    /// Overhead budget: wall time a single session may spend.
    pub fn session_timeout(&self) -> Duration {
        let minutes = match self {
            ComplexityTier::Trivial => 10,
            ComplexityTier::Simple => 20,
            ComplexityTier::Standard => 45,
            ComplexityTier::Complex => 90,
        };
        Duration::from_secs(minutes * 60)
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexityTier::Trivial => write!(f, "trivial"),
            ComplexityTier::Simple => write!(f, "simple"),
            ComplexityTier::Standard => write!(f, "standard"),
            ComplexityTier::Complex => write!(f, "complex"),
        }
    }
}

impl std::str::FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trivial" => Ok(ComplexityTier::Trivial),
            "simple" => Ok(ComplexityTier::Simple),
            "standard" => Ok(ComplexityTier::Standard),
            "complex" => Ok(ComplexityTier::Complex),
            other => Err(format!(
                "unknown complexity {:?} (expected trivial, simple, standard, or complex)",
                other
            )),
        }
    }
}

/// Strength of the execution agent. Weaker tiers are cheaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityTier {
    Light,
    Standard,
    Heavy,
}

impl std::fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityTier::Light => write!(f, "light"),
            CapabilityTier::Standard => write!(f, "standard"),
            CapabilityTier::Heavy => write!(f, "heavy"),
        }
    }
}

impl std::str::FromStr for CapabilityTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "light" => Ok(CapabilityTier::Light),
            "standard" => Ok(CapabilityTier::Standard),
            "heavy" => Ok(CapabilityTier::Heavy),
            other => Err(format!(
                "unknown capability {:?} (expected light, standard, or heavy)",
                other
            )),
        }
    }
}

/// Result of classifying one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ComplexityTier,
    /// Weighted score; zero when overridden.
    pub score: u32,
    /// Human-readable reasons that contributed to the score.
    #[serde(default)]
    pub signals: Vec<String>,
    /// Set when an explicit override replaced the computed tier.
    #[serde(default)]
    pub overridden: bool,
}

impl Classification {
    pub fn capability(&self) -> CapabilityTier {
        self.tier.capability()
    }
}
