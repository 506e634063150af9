use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{CapabilityTier, RepositoryId};
use crate::orchestration::{
    CheckpointPolicy, RepositoryContext, ReviewArea, RouteRule, RoutingTable,
};
use crate::scheduler::SchedulerPolicy;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where the issue store and log live. Defaults to `~/.harness`.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    pub command: Option<String>,
    /// Extra arguments passed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub models: ModelConfig,
}

/// Model names per capability tier.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    pub light: Option<String>,
    pub standard: Option<String>,
    pub heavy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub local_attempts: u32,
    pub e2e_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            local_attempts: 3,
            e2e_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub every_sessions: u32,
    pub every_hours: f64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_sessions: 3,
            every_hours: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub blocker_boost: u8,
    pub stack_boosts: bool,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            blocker_boost: 1,
            stack_boosts: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    pub default: Option<String>,
    /// Label rules in priority order.
    #[serde(default)]
    pub rules: Vec<RouteRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    pub label: String,
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepositoryConfig {
    pub path: String,
    /// Build, test, type and lint commands that must pass before the first session.
    #[serde(default)]
    pub baseline: Vec<String>,
    #[serde(default)]
    pub local: Vec<String>,
    #[serde(default)]
    pub e2e: Vec<String>,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewConfig {
    #[serde(default)]
    pub security: Vec<String>,
    #[serde(default)]
    pub architecture: Vec<String>,
    #[serde(default)]
    pub quality: Vec<String>,
}

impl Config {
    pub fn harness_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".harness"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::harness_dir()?.join("harness.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Self::harness_dir(),
        }
    }

    pub fn tracker_path(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("issues.json"))
    }

    pub fn effective_command(&self) -> &str {
        self.agent.command.as_deref().unwrap_or("claude")
    }

    pub fn model_for(&self, capability: CapabilityTier) -> &str {
        let models = &self.agent.models;
        match capability {
            CapabilityTier::Light => models.light.as_deref().unwrap_or("haiku"),
            CapabilityTier::Standard => models.standard.as_deref().unwrap_or("sonnet"),
            CapabilityTier::Heavy => models.heavy.as_deref().unwrap_or("opus"),
        }
    }

    /// Load from the default location, or defaults when the file is missing.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            repositories = config.repositories.len(),
            rules = config.routing.rules.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let state_dir = self.state_dir()?;
        if !state_dir.exists() {
            tracing::debug!(dir = %state_dir.display(), "creating state directory");
            fs::create_dir_all(&state_dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.local_attempts == 0 || self.retry.e2e_attempts == 0 {
            return Err(Error::Config("retry attempts must be at least 1".to_string()));
        }
        if self.checkpoint.every_sessions == 0 {
            return Err(Error::Config(
                "checkpoint.every_sessions must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.every_hours.is_nan() || self.checkpoint.every_hours <= 0.0 {
            return Err(Error::Config(
                "checkpoint.every_hours must be positive".to_string(),
            ));
        }
        if self.repositories.is_empty() {
            return Ok(());
        }
        let targets = self
            .routing
            .rules
            .iter()
            .map(|rule| &rule.repository)
            .chain(self.routing.default.iter());
        for target in targets {
            if !self.repositories.contains_key(target) {
                return Err(Error::Config(format!(
                    "routing refers to unknown repository {:?}",
                    target
                )));
            }
        }
        Ok(())
    }

    pub fn scheduler_policy(&self) -> SchedulerPolicy {
        SchedulerPolicy {
            local_attempts: self.retry.local_attempts,
            e2e_attempts: self.retry.e2e_attempts,
            blocker_boost: self.priority.blocker_boost,
            stack_boosts: self.priority.stack_boosts,
        }
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        CheckpointPolicy {
            every_sessions: self.checkpoint.every_sessions,
            every: Duration::from_secs_f64(self.checkpoint.every_hours * 3600.0),
        }
    }

    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable {
            default: self.routing.default.as_deref().map(RepositoryId::new),
            rules: self
                .routing
                .rules
                .iter()
                .map(|rule| RouteRule::new(&rule.label, RepositoryId::new(&rule.repository)))
                .collect(),
        }
    }

    /// Repository contexts; the current directory stands in as `main` when
    /// none are configured.
    pub fn repository_contexts(&self) -> Result<Vec<RepositoryContext>> {
        if self.repositories.is_empty() {
            return Ok(vec![RepositoryContext::new(
                RepositoryId::default(),
                std::env::current_dir()?,
            )]);
        }
        Ok(self
            .repositories
            .iter()
            .map(|(name, repo)| {
                let mut context =
                    RepositoryContext::new(RepositoryId::new(name), expand_tilde(&repo.path));
                context.baseline = repo.baseline.clone();
                context.local = repo.local.clone();
                context.e2e = repo.e2e.clone();
                context
                    .review
                    .insert(ReviewArea::Security, repo.review.security.clone());
                context
                    .review
                    .insert(ReviewArea::Architecture, repo.review.architecture.clone());
                context
                    .review
                    .insert(ReviewArea::Quality, repo.review.quality.clone());
                context
            })
            .collect())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
