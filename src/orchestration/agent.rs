//! Execution agents.
//!
//! An [`ExecutionAgent`] performs one autonomous session on one work item.
//! [`CommandAgent`] drives a headless coding CLI (`claude -p` by default)
//! and parses its JSON output. The agent may report newly discovered work by
//! ending its answer with a fenced JSON block:
//!
//! ```text
//! ```json
//! {"discovered": [{"title": "Fix schema", "labels": ["blocker"]}]}
//! ```
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AcceptanceCriterion, CapabilityTier, ComplexityTier, ItemKind, Priority, WorkItem,
};
use crate::error::{Error, Result};
use crate::orchestration::routing::RepositoryContext;
use crate::scheduler::BLOCKER_LABEL;

/// Everything an agent needs for one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub item: WorkItem,
    pub tier: ComplexityTier,
    pub capability: CapabilityTier,
    pub repository: RepositoryContext,
    /// Cross-cutting requirements every session must respect.
    pub requirements: Vec<String>,
    /// Verification output from the previous attempt, if any.
    pub feedback: Option<String>,
    /// 1-based attempt within this session.
    pub attempt: u32,
}

impl SessionRequest {
    pub fn timeout(&self) -> Duration {
        self.tier.session_timeout()
    }

    /// Render the prompt handed to the agent.
    pub fn prompt(&self) -> String {
        let item = &self.item;
        let mut prompt = format!("# Task: {}\n\n", item.title);
        if !item.description.is_empty() {
            prompt.push_str(&item.description);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&format!(
            "Repository: {} ({})\n",
            self.repository.id,
            self.repository.path.display()
        ));
        if !item.files.is_empty() {
            prompt.push_str("\n## Files\n");
            for file in &item.files {
                prompt.push_str(&format!("- {}\n", file.display()));
            }
        }
        if !item.acceptance.is_empty() {
            prompt.push_str("\n## Acceptance criteria\n");
            for criterion in &item.acceptance {
                match criterion.verify_command() {
                    Some(cmd) => prompt.push_str(&format!(
                        "- {} (verified by `{}`)\n",
                        criterion.description(),
                        cmd
                    )),
                    None => prompt.push_str(&format!("- {}\n", criterion.description())),
                }
            }
        }
        if !self.requirements.is_empty() {
            prompt.push_str("\n## Requirements\n");
            for requirement in &self.requirements {
                prompt.push_str(&format!("- {}\n", requirement));
            }
        }
        if let Some(feedback) = &self.feedback {
            prompt.push_str(&format!(
                "\n## Verification failed (attempt {})\nFix the following before finishing:\n\n{}\n",
                self.attempt.saturating_sub(1),
                feedback
            ));
        }
        prompt.push_str(
            "\nDo not commit. If you discover work outside this task, end your answer with a \
             ```json block of the form {\"discovered\": [{\"title\", \"description\", \
             \"priority\", \"labels\", \"files\", \"blocks_current\"}]}. Use \
             \"blocks_current\": true only when this task cannot finish without it.\n",
        );
        prompt
    }
}

/// New work found during a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredWork {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<AcceptanceCriterion>,
    /// The current item cannot finish until this is done.
    #[serde(default)]
    pub blocks_current: bool,
}

impl DiscoveredWork {
    pub fn is_blocker(&self) -> bool {
        self.blocks_current || self.labels.iter().any(|l| l == BLOCKER_LABEL)
    }

    pub fn to_work_item(&self) -> WorkItem {
        WorkItem::new(self.title.trim(), self.description.trim())
            .with_priority(self.priority.map(Priority).unwrap_or_default())
            .with_labels(self.labels.iter().cloned())
            .with_files(self.files.iter().map(PathBuf::from))
            .with_acceptance(self.acceptance.clone())
            .with_kind(ItemKind::AdHoc)
    }
}

/// What a session produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub summary: String,
    #[serde(default)]
    pub discovered: Vec<DiscoveredWork>,
}

/// Performs autonomous work sessions.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    /// Run one session. Implementations stop early when `cancel` fires.
    async fn execute(&self, request: &SessionRequest, cancel: CancellationToken) -> Result<SessionReport>;
}

/// Internal struct for deserializing the CLI's JSON response.
#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveredBlock {
    #[serde(default)]
    discovered: Vec<DiscoveredWork>,
}

fn discovered_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("valid regex"))
}

/// Parse the CLI's JSON output into a report.
///
/// # Errors
/// Returns [`Error::UnrecoverableExecution`] when the agent reported an error.
pub fn parse_response(stdout: &str) -> Result<SessionReport> {
    let raw: RawResponse = serde_json::from_str(stdout.trim())?;
    let failed = raw.is_error || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
    if failed || (raw.result.is_none() && raw.error.is_some()) {
        let message = raw
            .error
            .or(raw.result)
            .unwrap_or_else(|| "agent reported an error".to_string());
        return Err(Error::UnrecoverableExecution(message));
    }
    Ok(parse_summary(&raw.result.unwrap_or_default()))
}

/// Split the agent's final answer into summary and discovered work.
pub fn parse_summary(text: &str) -> SessionReport {
    let mut discovered = Vec::new();
    let mut summary = text.to_string();
    if let Some(caps) = discovered_block_re().captures_iter(text).last() {
        match serde_json::from_str::<DiscoveredBlock>(&caps[1]) {
            Ok(block) => {
                discovered = block.discovered;
                if let Some(whole) = caps.get(0) {
                    summary = format!("{}{}", &text[..whole.start()], &text[whole.end()..]);
                }
            }
            Err(e) => tracing::warn!(error = %e, "ignoring malformed discovered-work block"),
        }
    }
    SessionReport {
        summary: summary.trim().to_string(),
        discovered,
    }
}

/// Agent backed by a headless CLI.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    binary: PathBuf,
    args: Vec<String>,
    models: BTreeMap<CapabilityTier, String>,
    timeout: Option<Duration>,
}

impl CommandAgent {
    /// Resolve `command` on `PATH`.
    ///
    /// # Errors
    /// Returns [`Error::AgentBinaryNotFound`] if the binary cannot be found.
    pub fn new(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::AgentBinaryNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            args: Vec::new(),
            models: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_model(mut self, capability: CapabilityTier, model: &str) -> Self {
        self.models.insert(capability, model.to_string());
        self
    }

    /// Override the tier's session timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn model(&self, capability: CapabilityTier) -> Option<&str> {
        self.models.get(&capability).map(String::as_str)
    }
}

#[async_trait]
impl ExecutionAgent for CommandAgent {
    async fn execute(&self, request: &SessionRequest, cancel: CancellationToken) -> Result<SessionReport> {
        let timeout = self.timeout.unwrap_or_else(|| request.timeout());
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .arg("-p")
            .arg(request.prompt())
            .arg("--output-format")
            .arg("json");
        if let Some(model) = self.model(request.capability) {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.repository.path).kill_on_drop(true);

        tracing::info!(
            item = %request.item.id.short(),
            capability = %request.capability,
            timeout_secs = timeout.as_secs(),
            "agent session started"
        );

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::UnrecoverableExecution("session cancelled".to_string()));
            }
            result = tokio::time::timeout(timeout, cmd.output()) => {
                result.map_err(|_| Error::Timeout(timeout))??
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match parse_response(&stdout) {
            Ok(report) => Ok(report),
            Err(Error::Json(_)) if output.status.success() => Ok(parse_summary(&stdout)),
            Err(Error::Json(_)) => {
                let message = if stderr.trim().is_empty() {
                    format!(
                        "agent exited with code {}",
                        output.status.code().unwrap_or(-1)
                    )
                } else {
                    stderr.trim().to_string()
                };
                Err(Error::UnrecoverableExecution(message))
            }
            Err(e) => Err(e),
        }
    }
}
