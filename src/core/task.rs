//! Task and pipeline definitions.
//!
//! A task names one agent invocation: which prompt to run, with which model,
//! how many times when run on its own, and which other tasks gate it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{Error, Result};

/// Gate on an upstream task's outcome in the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Upstream succeeded.
    #[default]
    Success,
    /// Upstream failed.
    Failure,
    /// Upstream finished, whatever the outcome.
    Any,
    /// Like `any`, and the dependent is never skipped on account of its
    /// other edges.
    Always,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Condition::Success => "success",
            Condition::Failure => "failure",
            Condition::Any => "any",
            Condition::Always => "always",
        };
        f.write_str(s)
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "success" => Ok(Condition::Success),
            "failure" => Ok(Condition::Failure),
            "any" => Ok(Condition::Any),
            "always" => Ok(Condition::Always),
            other => Err(Error::Validation(format!(
                "unknown dependency condition: {}",
                other
            ))),
        }
    }
}

/// One incoming edge: `task` must reach an outcome matching `condition`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "DependencyRepr")]
pub struct Dependency {
    pub task: String,
    pub condition: Condition,
}

impl Dependency {
    pub fn new(task: &str, condition: Condition) -> Self {
        Self {
            task: task.to_string(),
            condition,
        }
    }

    pub fn on_success(task: &str) -> Self {
        Self::new(task, Condition::Success)
    }
}

/// A bare task name is shorthand for a `success` edge.
#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyRepr {
    Name(String),
    Full {
        task: String,
        #[serde(default)]
        condition: Condition,
    },
}

impl From<DependencyRepr> for Dependency {
    fn from(repr: DependencyRepr) -> Self {
        match repr {
            DependencyRepr::Name(task) => Dependency::on_success(&task),
            DependencyRepr::Full { task, condition } => Dependency { task, condition },
        }
    }
}

/// Where a task's prompt text comes from. Exactly one per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    /// `<prompts dir>/<name>.md`
    Named(String),
    File(PathBuf),
    Inline(String),
}

impl PromptSource {
    /// Short label stored on agent records.
    pub fn label(&self) -> String {
        match self {
            PromptSource::Named(name) => name.clone(),
            PromptSource::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            PromptSource::Inline(_) => "<string>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskRepr")]
pub struct Task {
    pub name: String,
    pub prompt: PromptSource,
    pub model: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    /// Iterations when run standalone; pipelines use their own count.
    pub iterations: u32,
    /// Agent name override; defaults to the task name.
    pub agent_name: Option<String>,
    /// Runs of this task allowed at once across all swarm processes;
    /// 0 means unlimited.
    pub concurrency: u32,
    pub depends_on: Vec<Dependency>,
}

/// Field layout of a task definition, before the prompt fields are checked.
#[derive(Deserialize)]
struct TaskRepr {
    #[serde(default)]
    name: String,
    prompt: Option<String>,
    prompt_file: Option<PathBuf>,
    prompt_string: Option<String>,
    model: Option<String>,
    prefix: Option<String>,
    suffix: Option<String>,
    #[serde(default = "default_iterations")]
    iterations: u32,
    #[serde(alias = "name_override")]
    agent_name: Option<String>,
    #[serde(default)]
    concurrency: u32,
    #[serde(default)]
    depends_on: Vec<Dependency>,
}

fn default_iterations() -> u32 {
    1
}

impl TryFrom<TaskRepr> for Task {
    type Error = Error;

    fn try_from(repr: TaskRepr) -> Result<Self> {
        let prompt = match (repr.prompt, repr.prompt_file, repr.prompt_string) {
            (Some(name), None, None) => PromptSource::Named(name),
            (None, Some(path), None) => PromptSource::File(path),
            (None, None, Some(text)) => PromptSource::Inline(text),
            (None, None, None) => {
                return Err(Error::Validation(format!(
                    "task '{}' has no prompt, prompt_file or prompt_string",
                    repr.name
                )))
            }
            _ => {
                return Err(Error::Validation(format!(
                    "task '{}' sets more than one of prompt, prompt_file, prompt_string",
                    repr.name
                )))
            }
        };
        Ok(Task {
            name: repr.name,
            prompt,
            model: repr.model,
            prefix: repr.prefix,
            suffix: repr.suffix,
            iterations: repr.iterations,
            agent_name: repr.agent_name,
            concurrency: repr.concurrency,
            depends_on: repr.depends_on,
        })
    }
}

impl Task {
    pub fn new(name: &str, prompt: PromptSource) -> Self {
        Self {
            name: name.to_string(),
            prompt,
            model: None,
            prefix: None,
            suffix: None,
            iterations: 1,
            agent_name: None,
            concurrency: 0,
            depends_on: Vec::new(),
        }
    }

    /// Shorthand for a task with an inline prompt.
    pub fn inline(name: &str, text: &str) -> Self {
        Self::new(name, PromptSource::Inline(text.to_string()))
    }

    pub fn depends_on(mut self, task: &str, condition: Condition) -> Self {
        self.depends_on.push(Dependency::new(task, condition));
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Name used for agent records and the duplicate-start check.
    pub fn effective_name(&self) -> &str {
        self.agent_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.name)
    }
}

/// A named set of tasks run together for a number of iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Maximum tasks in flight; 0 means unbounded.
    #[serde(default)]
    pub parallelism: usize,
    pub tasks: Vec<String>,
}

impl Pipeline {
    pub fn new(name: &str, tasks: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            iterations: 1,
            parallelism: 0,
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Effective concurrency cap for `runnable` tasks.
    pub fn cap(&self, runnable: usize) -> usize {
        if self.parallelism == 0 {
            runnable.max(1)
        } else {
            self.parallelism
        }
    }
}

/// Outcome of one task within one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed {
        error: String,
    },
    /// Dependencies can never be satisfied this iteration.
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { .. } | TaskState::Skipped
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed { error } => write!(f, "failed: {}", error),
            TaskState::Skipped => write!(f, "skipped"),
        }
    }
}
