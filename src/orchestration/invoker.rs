//! Running one agent iteration as a child process.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::agent::AgentCommand;
use crate::state::{AgentId, Usage};
use crate::{Error, Result};

/// Everything needed for a single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Fresh id for this iteration, also injected into the prompt.
    pub agent_id: AgentId,
    pub task: String,
    pub model: String,
    pub prompt: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AgentRun {
    pub exit_code: i32,
    pub usage: Usage,
}

impl AgentRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Map a non-zero exit to `TaskRuntime`.
    pub fn into_result(self, task: &str) -> Result<AgentRun> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::TaskRuntime {
                task: task.to_string(),
                code: self.exit_code,
            })
        }
    }
}

/// Seam between the orchestration engine and the agent CLI.
///
/// `Err` means the agent could not be run at all; a run that started and
/// exited non-zero is `Ok` with a non-zero `exit_code`.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        request: &AgentRequest,
        output: &mut (dyn Write + Send),
    ) -> Result<AgentRun>;
}

pub type SharedInvoker = Arc<dyn AgentInvoker>;

/// Invokes the configured agent binary.
#[derive(Debug, Clone)]
pub struct ProcessAgent {
    command: AgentCommand,
    timeout: Option<Duration>,
}

impl ProcessAgent {
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            timeout: None,
        }
    }

    /// Kill the agent if one iteration runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl AgentInvoker for ProcessAgent {
    async fn invoke(
        &self,
        request: &AgentRequest,
        output: &mut (dyn Write + Send),
    ) -> Result<AgentRun> {
        let args = self.command.args(&request.model, &request.prompt);
        debug!(
            task = %request.task,
            agent = %request.agent_id,
            binary = self.command.binary(),
            "spawning agent"
        );
        let mut child = Command::new(self.command.binary())
            .args(&args)
            .current_dir(&request.working_dir)
            .env("SWARM_AGENT_ID", request.agent_id.as_str())
            .env("SWARM_TASK", &request.task)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TaskLaunch {
                task: request.task.clone(),
                reason: e.to_string(),
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }
        drop(tx);

        let raw = self.command.raw_output();
        let mut usage = Usage::default();
        let run = async {
            while let Some(line) = rx.recv().await {
                trace!(task = %request.task, %line, "agent output");
                let decoded = decode_line(&line, raw);
                if let Some(u) = decoded.usage {
                    usage.add(&u);
                }
                if let Some(text) = decoded.text {
                    writeln!(output, "{}", text)?;
                }
            }
            output.flush()?;
            child.wait().await
        };
        let status = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::Timeout(limit))??,
            None => run.await?,
        };

        Ok(AgentRun {
            exit_code: status.code().unwrap_or(-1),
            usage,
        })
    }
}

/// What one line of agent output contributes.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub text: Option<String>,
    pub usage: Option<Usage>,
}

/// Decode a stream-json event line, or pass raw output through.
///
/// Assistant text is shown; usage comes from the final `result` event only,
/// since per-message usage would double count.
pub fn decode_line(line: &str, raw: bool) -> Decoded {
    if raw {
        return Decoded {
            text: Some(line.to_string()),
            usage: None,
        };
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::default();
    }
    let Ok(Value::Object(event)) = serde_json::from_str::<Value>(trimmed) else {
        return Decoded {
            text: Some(line.to_string()),
            usage: None,
        };
    };

    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => Decoded {
            text: assistant_text(&event),
            usage: None,
        },
        Some("result") => {
            let text = if event.get("is_error").and_then(Value::as_bool) == Some(true) {
                event
                    .get("result")
                    .and_then(Value::as_str)
                    .map(|r| format!("error: {}", r))
            } else {
                None
            };
            Decoded {
                text,
                usage: Some(result_usage(&event)),
            }
        }
        _ => Decoded::default(),
    }
}

fn assistant_text(event: &serde_json::Map<String, Value>) -> Option<String> {
    let content = event.get("message")?.get("content")?.as_array()?;
    let text: String = content
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn result_usage(event: &serde_json::Map<String, Value>) -> Usage {
    let field = |obj: Option<&Value>, names: &[&str]| -> u64 {
        names
            .iter()
            .filter_map(|n| obj.and_then(|o| o.get(*n)).and_then(Value::as_u64))
            .find(|&v| v > 0)
            .unwrap_or(0)
    };
    let usage = event.get("usage");
    Usage {
        input_tokens: field(usage, &["input_tokens", "prompt_tokens"]),
        output_tokens: field(usage, &["output_tokens", "completion_tokens"]),
        total_cost_usd: event
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    }
}
