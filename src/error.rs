use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycles(.cycles))]
    Cycle { cycles: Vec<Vec<String>> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Failed to launch task '{task}': {reason}")]
    TaskLaunch { task: String, reason: String },

    #[error("Task '{task}' exited with status {code}")]
    TaskRuntime { task: String, code: i32 },

    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    TasksFailed(Vec<String>),

    #[error("Pipeline '{pipeline}' failed: {}", .tasks.join(", "))]
    PipelineFailed { pipeline: String, tasks: Vec<String> },

    #[error("Agent already exists: {0}")]
    AgentExists(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Multiple running agents named '{token}': {}", .matches.join(", "))]
    AmbiguousAgent { token: String, matches: Vec<String> },

    #[error("Agent {id} belongs to {found}, not to this scope ({scope})")]
    ScopeMismatch {
        id: String,
        scope: String,
        found: String,
    },

    #[error("Agent {id} is terminated and cannot return to running")]
    StatusRegression { id: String },

    #[error("Agent {0} is not running")]
    NotRunning(String),

    #[error("Agent binary not available: {0}")]
    AgentNotAvailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|c| format!("[{}]", c.join(", ")))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Process exit status for a command that failed with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            // 128 + SIGINT, as shells report an interrupted foreground job.
            Error::Cancelled => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
