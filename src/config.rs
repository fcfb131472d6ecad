use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

pub const PROJECT_CONFIG_FILE: &str = ".swarm.toml";

/// Agent CLI families with a built-in command preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    #[default]
    Cursor,
    ClaudeCode,
}

/// How the agent binary is invoked.
///
/// `args` may contain `{model}` and `{prompt}` placeholders, substituted
/// per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub executable: String,
    pub args: Vec<String>,
    /// Stream output verbatim instead of decoding stream-json events.
    #[serde(default)]
    pub raw_output: bool,
}

impl CommandConfig {
    /// Expand the argument template for one invocation.
    pub fn render_args(&self, model: &str, prompt: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{model}", model).replace("{prompt}", prompt))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backend: Backend,
    pub model: String,
    pub iterations: u32,
    pub command: CommandConfig,
    /// Milliseconds between store polls while paused or waiting.
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Kill an agent iteration that runs longer than this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_timeout_secs: Option<u64>,
}

fn default_poll_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self::preset(Backend::Cursor)
    }
}

/// On-disk shape: every field optional so a file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    backend: Option<Backend>,
    model: Option<String>,
    iterations: Option<u32>,
    poll_interval_ms: Option<u64>,
    iteration_timeout_secs: Option<u64>,
    #[serde(default)]
    command: CommandFile,
}

#[derive(Debug, Default, Deserialize)]
struct CommandFile {
    executable: Option<String>,
    args: Option<Vec<String>>,
    raw_output: Option<bool>,
}

impl Config {
    pub fn preset(backend: Backend) -> Self {
        match backend {
            Backend::Cursor => Self {
                backend,
                model: "opus-4.5-thinking".to_string(),
                iterations: 20,
                command: CommandConfig {
                    executable: "agent".to_string(),
                    args: [
                        "--model",
                        "{model}",
                        "--output-format",
                        "stream-json",
                        "--stream-partial-output",
                        "--sandbox",
                        "disabled",
                        "--print",
                        "--force",
                        "{prompt}",
                    ]
                    .map(String::from)
                    .to_vec(),
                    raw_output: false,
                },
                poll_interval_ms: default_poll_ms(),
                iteration_timeout_secs: None,
            },
            Backend::ClaudeCode => Self {
                backend,
                model: "opus".to_string(),
                iterations: 20,
                command: CommandConfig {
                    executable: "claude".to_string(),
                    args: [
                        "-p",
                        "--model",
                        "{model}",
                        "--dangerously-skip-permissions",
                        "{prompt}",
                    ]
                    .map(String::from)
                    .to_vec(),
                    raw_output: true,
                },
                poll_interval_ms: default_poll_ms(),
                iteration_timeout_secs: None,
            },
        }
    }

    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("config.toml"))
    }

    pub fn state_dir() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("state"))
    }

    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("logs"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn iteration_timeout(&self) -> Option<Duration> {
        self.iteration_timeout_secs
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
    }

    /// Load defaults, then the global file, then `<project>/.swarm.toml`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::default();
        let global = Self::config_path()?;
        config.merge_file(&global)?;
        config.merge_file(&project_dir.join(PROJECT_CONFIG_FILE))?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(());
        }
        let file: ConfigFile = toml::from_str(&fs::read_to_string(path)?)?;
        self.merge(file);
        debug!(path = %path.display(), model = %self.model, "config merged");
        Ok(())
    }

    fn merge(&mut self, file: ConfigFile) {
        if let Some(backend) = file.backend {
            let iterations = self.iterations;
            *self = Self::preset(backend);
            self.iterations = iterations;
        }
        if let Some(model) = file.model.filter(|m| !m.is_empty()) {
            self.model = model;
        }
        if let Some(iterations) = file.iterations.filter(|&n| n > 0) {
            self.iterations = iterations;
        }
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval_ms = ms;
        }
        if let Some(secs) = file.iteration_timeout_secs {
            self.iteration_timeout_secs = Some(secs);
        }
        if let Some(executable) = file.command.executable.filter(|e| !e.is_empty()) {
            self.command.executable = executable;
        }
        if let Some(args) = file.command.args.filter(|a| !a.is_empty()) {
            self.command.args = args;
        }
        if let Some(raw) = file.command.raw_output {
            self.command.raw_output = raw;
        }
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::swarm_dir()?;
        fs::create_dir_all(&dir)?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::swarm_dir()?, Self::state_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

/// Everything the runner and executor need, passed in explicitly.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub command: CommandConfig,
    pub default_model: String,
    pub default_iterations: u32,
    pub poll_interval: Duration,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Per-task concurrency slot files.
    pub locks_dir: PathBuf,
    /// Directory holding named `<name>.md` prompts.
    pub prompts_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Binary re-executed for detached agents.
    pub self_exe: PathBuf,
}

impl RunnerConfig {
    pub fn from_config(config: &Config, working_dir: &Path) -> Result<Self> {
        Ok(Self {
            command: config.command.clone(),
            default_model: config.model.clone(),
            default_iterations: config.iterations,
            poll_interval: config.poll_interval(),
            state_dir: Config::state_dir()?,
            logs_dir: Config::logs_dir()?,
            locks_dir: Config::state_dir()?.join("locks"),
            prompts_dir: working_dir.join("swarm").join("prompts"),
            working_dir: working_dir.to_path_buf(),
            self_exe: std::env::current_exe()?,
        })
    }

    /// A self-contained config rooted at `root`, for tests and embedding.
    pub fn rooted(root: &Path, command: CommandConfig) -> Self {
        Self {
            command,
            default_model: "test-model".to_string(),
            default_iterations: 1,
            poll_interval: Duration::from_millis(20),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
            locks_dir: root.join("state").join("locks"),
            prompts_dir: root.join("prompts"),
            working_dir: root.to_path_buf(),
            self_exe: PathBuf::from("swarm"),
        }
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
