//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A file-backed store in a temporary directory
//! - A scripted agent standing in for the agent CLI
//! - A spawner that records launches instead of forking

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use swarm::config::{CommandConfig, RunnerConfig};
use swarm::core::Task;
use swarm::orchestration::{
    AgentInvoker, AgentRequest, AgentRun, CaptureBuffer, DagExecutor, SpawnRequest, Spawner,
    TaskRunner, WriterGroup,
};
use swarm::state::{FileStore, Scope, SharedStore, Usage};
use swarm::{Error, Result};

/// Called on every invocation with the request and the per-task call number.
pub type Hook = Box<dyn Fn(&AgentRequest, u32) + Send + Sync>;

/// Fake agent CLI.
///
/// Writes a couple of lines per call, yielding between fragments so that
/// concurrent tasks interleave, and fails the calls it was told to fail.
pub struct ScriptedAgent {
    /// Task name to failing call number; `None` fails every call.
    failures: HashMap<String, Option<u32>>,
    delay: Duration,
    hook: Option<Hook>,
    calls: Mutex<Vec<AgentRequest>>,
    per_task: Mutex<HashMap<String, u32>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            failures: HashMap::new(),
            delay: Duration::ZERO,
            hook: None,
            calls: Mutex::new(Vec::new()),
            per_task: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing(mut self, task: &str) -> Self {
        self.failures.insert(task.to_string(), None);
        self
    }

    /// Fail only the `nth` call (1-based) for `task`.
    pub fn failing_on(mut self, task: &str, nth: u32) -> Self {
        self.failures.insert(task.to_string(), Some(nth));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn on_call<F>(mut self, hook: F) -> Self
    where
        F: Fn(&AgentRequest, u32) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Task names in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.task.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn should_fail(&self, task: &str, nth: u32) -> bool {
        match self.failures.get(task) {
            Some(None) => true,
            Some(Some(n)) => *n == nth,
            None => false,
        }
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(
        &self,
        request: &AgentRequest,
        output: &mut (dyn Write + Send),
    ) -> Result<AgentRun> {
        let nth = {
            let mut per_task = self.per_task.lock().unwrap();
            let n = per_task.entry(request.task.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.calls.lock().unwrap().push(request.clone());
        if let Some(hook) = &self.hook {
            hook(request, nth);
        }

        for step in 1..=2 {
            output.write_all(b"payload ")?;
            tokio::task::yield_now().await;
            writeln!(output, "{} {}", request.task, step)?;
            tokio::task::yield_now().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(AgentRun {
            exit_code: if self.should_fail(&request.task, nth) { 1 } else { 0 },
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_cost_usd: 0.01,
            },
        })
    }
}

/// Records spawn requests and hands out a fixed pid.
pub struct RecordingSpawner {
    pid: u32,
    fail: bool,
    requests: Mutex<Vec<SpawnRequest>>,
}

impl RecordingSpawner {
    pub fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            fail: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            pid: 0,
            fail: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Spawner for RecordingSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<u32> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(Error::TaskLaunch {
                task: request.program.display().to_string(),
                reason: "exec format error".to_string(),
            });
        }
        Ok(self.pid)
    }
}

/// A project-scoped file store rooted in a temporary directory.
pub struct Harness {
    /// Keeps the directory alive for the duration of the test.
    pub temp_dir: TempDir,
    pub store: Arc<FileStore>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(&temp_dir.path().join("state"), Scope::project(temp_dir.path()))
            .expect("Failed to open store");
        Self {
            temp_dir,
            store: Arc::new(store),
            cancel: CancellationToken::new(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn shared_store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn config(&self) -> RunnerConfig {
        RunnerConfig::rooted(
            self.root(),
            CommandConfig {
                executable: "true".into(),
                args: vec![],
                raw_output: true,
            },
        )
    }

    pub fn runner(&self, agent: Arc<ScriptedAgent>) -> Arc<TaskRunner> {
        self.runner_with(agent, RecordingSpawner::new(4242))
    }

    pub fn runner_with(&self, agent: Arc<ScriptedAgent>, spawner: Arc<RecordingSpawner>) -> Arc<TaskRunner> {
        Arc::new(TaskRunner::new(
            Arc::new(self.config()),
            self.shared_store(),
            agent,
            spawner,
            self.cancel.clone(),
        ))
    }

    pub fn executor(&self, agent: Arc<ScriptedAgent>) -> DagExecutor {
        DagExecutor::new(self.runner(agent))
    }

    /// Write `<root>/prompts/<name>.md`.
    pub fn write_prompt(&self, name: &str, body: &str) -> PathBuf {
        let dir = self.root().join("prompts");
        std::fs::create_dir_all(&dir).expect("Failed to create prompts dir");
        let path = dir.join(format!("{}.md", name));
        std::fs::write(&path, body).expect("Failed to write prompt");
        path
    }
}

/// Uncolored writer group over an inspectable buffer.
pub fn capture_group(names: &[&str]) -> (CaptureBuffer, WriterGroup) {
    let buf = CaptureBuffer::new();
    let group = WriterGroup::new(Box::new(buf.clone()), names, false);
    (buf, group)
}

pub fn task_map(tasks: Vec<Task>) -> HashMap<String, Task> {
    tasks.into_iter().map(|t| (t.name.clone(), t)).collect()
}

/// Split a prefixed output line into its trimmed prefix and body.
pub fn split_prefixed(line: &str) -> Option<(&str, &str)> {
    line.split_once(" | ").map(|(prefix, body)| (prefix.trim_end(), body))
}
