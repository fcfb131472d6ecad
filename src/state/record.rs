//! Agent records: the unit of shared state between swarm processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::short_hex;
use crate::{Error, Result};

/// Opaque agent identifier, unique within a store.
///
/// Restricted to `[A-Za-z0-9_-]` because ids double as file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Generate a fresh 8 hex character id.
    pub fn generate() -> Self {
        Self(short_hex(8))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(Error::Validation(format!("invalid agent id: {:?}", raw)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Running,
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Running => write!(f, "running"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Stop request written by control commands, read at iteration boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminateMode {
    #[default]
    #[serde(rename = "", alias = "none")]
    None,
    Immediate,
    AfterIteration,
}

impl TerminateMode {
    pub fn is_requested(self) -> bool {
        self != TerminateMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    Killed,
    Failed,
    Signal,
    /// Process vanished without finalizing its record.
    Crashed,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Completed => "completed",
            ExitReason::Killed => "killed",
            ExitReason::Failed => "failed",
            ExitReason::Signal => "signal",
            ExitReason::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Token and cost counters reported by the agent CLI.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_cost_usd += other.total_cost_usd;
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_cost_usd == 0.0
    }
}

/// One agent, as seen by every process sharing the store.
///
/// The JSON field names are the on-disk contract read by other clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub pid: u32,
    /// Label of the prompt (named prompt, file name, or `<string>`).
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: String,
    pub started_at: DateTime<Utc>,
    /// Target iteration count; 0 runs until stopped.
    #[serde(rename = "iterations", default)]
    pub total_iterations: u32,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(rename = "successful_iters", default)]
    pub successful_iterations: u32,
    #[serde(rename = "failed_iters", default)]
    pub failed_iterations: u32,
    pub status: AgentStatus,
    #[serde(default)]
    pub terminate_mode: TerminateMode,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub working_dir: PathBuf,
    #[serde(default, flatten)]
    pub usage: Usage,
}

impl AgentRecord {
    /// A running record started now.
    pub fn new(id: AgentId, name: &str, working_dir: &Path) -> Self {
        Self {
            id,
            name: name.to_string(),
            pid: std::process::id(),
            prompt: String::new(),
            model: String::new(),
            started_at: Utc::now(),
            total_iterations: 1,
            current_iteration: 0,
            successful_iterations: 0,
            failed_iterations: 0,
            status: AgentStatus::Running,
            terminate_mode: TerminateMode::None,
            paused: false,
            paused_at: None,
            terminated_at: None,
            exit_reason: None,
            last_error: None,
            log_file: None,
            working_dir: working_dir.to_path_buf(),
            usage: Usage::default(),
        }
    }

    pub fn with_prompt(mut self, label: &str) -> Self {
        self.prompt = label.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_iterations(mut self, total: u32) -> Self {
        self.total_iterations = total;
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    /// Name shown to users; falls back to the id for unnamed agents.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }

    /// Whether another iteration may start after `completed` have finished.
    pub fn has_iterations_left(&self, completed: u32) -> bool {
        self.total_iterations == 0 || completed < self.total_iterations
    }

    /// Transition to terminated. Idempotent: the first reason wins.
    pub fn terminate(&mut self, reason: ExitReason) {
        if self.status == AgentStatus::Terminated {
            return;
        }
        self.status = AgentStatus::Terminated;
        self.terminated_at = Some(Utc::now());
        self.exit_reason.get_or_insert(reason);
        self.paused = false;
        self.paused_at = None;
    }

    /// Check the invariants the store enforces on every write.
    pub fn validate(&self) -> Result<()> {
        if self.total_iterations != 0 && self.current_iteration > self.total_iterations {
            return Err(Error::Validation(format!(
                "agent {}: current iteration {} exceeds total {}",
                self.id, self.current_iteration, self.total_iterations
            )));
        }
        Ok(())
    }
}
