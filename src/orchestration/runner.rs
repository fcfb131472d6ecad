//! Execution strategies for a single task.
//!
//! A task runs either in the foreground, side by side with other tasks and
//! writing through its own prefixed sink, or detached as a background
//! process that keeps running after the launcher exits. Both register an
//! [`AgentRecord`] and both refuse to start a task whose name already
//! belongs to a running agent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::core::Task;
use crate::orchestration::invoker::{AgentRequest, AgentRun, SharedInvoker};
use crate::orchestration::looping::{IterationLoop, LoopTask};
use crate::orchestration::output::WriterGroup;
use crate::orchestration::prompt::{inject_agent_id, inject_task_id, PromptResolver};
use crate::orchestration::spawn::{SpawnRequest, Spawner};
use crate::state::{AgentId, AgentRecord, ExitReason, SharedStore};
use crate::util::blocking;
use crate::{Error, Result};

/// Hidden subcommand a detached agent re-enters the binary through.
pub const AGENT_SUBCOMMAND: &str = "__agent";

/// Result of one foreground unit.
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Finished(AgentRecord),
    /// A running agent already uses this name.
    Skipped { name: String },
}

impl UnitOutcome {
    pub fn name(&self) -> &str {
        match self {
            UnitOutcome::Finished(record) => record.display_name(),
            UnitOutcome::Skipped { name } => name,
        }
    }

    /// Whether the unit stopped because the launcher was interrupted.
    pub fn interrupted(&self) -> bool {
        matches!(self, UnitOutcome::Finished(record) if record.exit_reason == Some(ExitReason::Signal))
    }
}

/// Result of a detached launch.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchOutcome {
    Started {
        id: AgentId,
        pid: u32,
        log_file: PathBuf,
    },
    Skipped {
        name: String,
    },
}

pub struct TaskRunner {
    config: Arc<RunnerConfig>,
    store: SharedStore,
    invoker: SharedInvoker,
    spawner: Arc<dyn Spawner>,
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(
        config: Arc<RunnerConfig>,
        store: SharedStore,
        invoker: SharedInvoker,
        spawner: Arc<dyn Spawner>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            invoker,
            spawner,
            cancel,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn model_for(&self, task: &Task) -> String {
        task.model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    fn iteration_loop(&self) -> IterationLoop {
        IterationLoop::new(
            self.store.clone(),
            self.invoker.clone(),
            self.config.poll_interval,
            &self.config.default_model,
            self.cancel.clone(),
        )
    }

    async fn is_duplicate(&self, name: &str) -> Result<bool> {
        let store = self.store.clone();
        let running = blocking(move || store.running_names()).await?;
        Ok(running.contains(name))
    }

    fn new_record(&self, task: &Task, id: AgentId) -> AgentRecord {
        AgentRecord::new(id, task.effective_name(), &self.config.working_dir)
            .with_prompt(&task.prompt.label())
            .with_model(&self.model_for(task))
            .with_iterations(task.iterations)
    }

    /// Run every task concurrently and wait for all of them.
    ///
    /// Failures never cancel siblings; they are collected into one
    /// `TasksFailed` naming each failed task. A task fails when it could not
    /// be started or when any of its iterations failed.
    pub async fn run_foreground(
        &self,
        tasks: &[Task],
        resolver: &dyn PromptResolver,
        group: &mut WriterGroup,
    ) -> Result<Vec<UnitOutcome>> {
        let units: Vec<_> = tasks
            .iter()
            .map(|task| (task, group.writer(task.effective_name())))
            .collect();

        let results = join_all(units.into_iter().map(|(task, mut writer)| async move {
            let name = task.effective_name();
            let result = self.run_unit(task, resolver, &mut writer).await;
            if let Err(e) = &result {
                if let Err(write_err) = writeln!(writer, "Failed: {}", e) {
                    warn!(task = %name, error = %write_err, "could not report task failure");
                }
            }
            if let Err(e) = writer.finish() {
                warn!(task = %name, error = %e, "could not flush task output");
            }
            (name.to_string(), result)
        }))
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(UnitOutcome::Finished(record)) if record.failed_iterations > 0 => {
                    failed.push(name);
                }
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(task = %name, error = %e, "task failed");
                    failed.push(name);
                }
            }
        }
        if failed.is_empty() {
            Ok(outcomes)
        } else {
            Err(Error::TasksFailed(failed))
        }
    }

    async fn run_unit(
        &self,
        task: &Task,
        resolver: &dyn PromptResolver,
        output: &mut (dyn Write + Send),
    ) -> Result<UnitOutcome> {
        let name = task.effective_name().to_string();
        if self.is_duplicate(&name).await? {
            info!(task = %name, "already running, skipping");
            writeln!(output, "Skipped: agent '{}' is already running", name)?;
            return Ok(UnitOutcome::Skipped { name });
        }

        let prompt = resolver.resolve(task).map_err(|e| Error::TaskLaunch {
            task: name.clone(),
            reason: e.to_string(),
        })?;
        let record = self.new_record(task, AgentId::generate());
        {
            let store = self.store.clone();
            let record = record.clone();
            blocking(move || store.register(&record)).await?;
        }
        info!(id = %record.id, task = %name, iterations = task.iterations, "agent registered");

        let looped = LoopTask {
            id: record.id.clone(),
            task: name,
            prompt,
            working_dir: self.config.working_dir.clone(),
        };
        let record = self.iteration_loop().run(&looped, output).await?;
        Ok(UnitOutcome::Finished(record))
    }

    /// Start a task as a background process and return once its record
    /// is registered.
    pub async fn launch_detached(
        &self,
        task: &Task,
        resolver: &dyn PromptResolver,
    ) -> Result<LaunchOutcome> {
        let name = task.effective_name().to_string();
        if self.is_duplicate(&name).await? {
            info!(task = %name, "already running, not launching");
            return Ok(LaunchOutcome::Skipped { name });
        }

        let prompt = resolver.resolve(task)?;
        let id = AgentId::generate();
        fs::create_dir_all(&self.config.logs_dir)?;
        let log_file = self.config.logs_dir.join(format!("{}.log", id));
        let prompt_file = self.config.logs_dir.join(format!("{}.prompt", id));
        fs::write(&prompt_file, &prompt)?;

        // Registered before the child exists so it always finds its record.
        let record = self.new_record(task, id.clone()).with_log_file(log_file.clone());
        {
            let store = self.store.clone();
            let record = record.clone();
            blocking(move || store.register(&record)).await?;
        }

        let request = SpawnRequest {
            program: self.config.self_exe.clone(),
            args: vec![
                AGENT_SUBCOMMAND.to_string(),
                "--id".to_string(),
                id.to_string(),
                "--prompt-file".to_string(),
                prompt_file.display().to_string(),
                "--state-dir".to_string(),
                self.config.state_dir.display().to_string(),
            ],
            log_file: log_file.clone(),
            working_dir: self.config.working_dir.clone(),
            env: vec![("SWARM_AGENT_ID".to_string(), id.to_string())],
        };
        let spawner = self.spawner.clone();
        let pid = match blocking(move || spawner.spawn(&request)).await {
            Ok(pid) => pid,
            Err(e) => {
                let store = self.store.clone();
                let failed_id = id.clone();
                let reason = e.to_string();
                blocking(move || {
                    store.modify(&failed_id, &mut |r| {
                        r.last_error = Some(reason.clone());
                        r.terminate(ExitReason::Failed);
                    })
                })
                .await?;
                return Err(e);
            }
        };

        {
            let store = self.store.clone();
            let id = id.clone();
            blocking(move || store.modify(&id, &mut |r| r.pid = pid)).await?;
        }
        info!(%id, task = %name, pid, log = %log_file.display(), "agent detached");
        Ok(LaunchOutcome::Started { id, pid, log_file })
    }

    /// Child side of a detached launch: run the loop for an existing record.
    pub async fn resume_detached(
        &self,
        id: &AgentId,
        prompt_file: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<AgentRecord> {
        let prompt = fs::read_to_string(prompt_file)?;
        let own_pid = std::process::id();
        let record = {
            let store = self.store.clone();
            let id = id.clone();
            blocking(move || store.modify(&id, &mut |r| r.pid = own_pid)).await?
        };
        if !record.is_running() {
            return Err(Error::NotRunning(record.display_name().to_string()));
        }
        debug!(%id, "detached agent resuming");

        let looped = LoopTask {
            id: id.clone(),
            task: record.display_name().to_string(),
            prompt,
            working_dir: record.working_dir.clone(),
        };
        let done = self.iteration_loop().run(&looped, output).await?;
        if let Err(e) = fs::remove_file(prompt_file) {
            debug!(error = %e, "prompt file not removed");
        }
        Ok(done)
    }

    /// One agent invocation for a pipeline task, without a record of its own.
    pub async fn execute_unit(
        &self,
        task: &Task,
        prompt: &str,
        output: &mut (dyn Write + Send),
    ) -> Result<AgentRun> {
        let task_id = AgentId::generate();
        let agent_id = AgentId::generate();
        let request = AgentRequest {
            agent_id: agent_id.clone(),
            task: task.name.clone(),
            model: self.model_for(task),
            prompt: inject_agent_id(&inject_task_id(prompt, task_id.as_str()), agent_id.as_str()),
            working_dir: self.config.working_dir.clone(),
        };
        debug!(task = %task.name, agent = %agent_id, "executing unit");
        self.invoker.invoke(&request, output).await
    }
}
