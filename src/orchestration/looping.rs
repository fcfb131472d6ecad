//! The multi-iteration loop for a single task.
//!
//! External control reaches the loop only through the agent's record. The
//! record is re-read at every iteration boundary, and the decision of what to
//! do next is made by [`evaluate_control`], which is pure so the cancellation
//! rules can be tested without processes.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestration::invoker::{AgentRequest, SharedInvoker};
use crate::orchestration::prompt::inject_agent_id;
use crate::state::control::mark_paused;
use crate::state::{AgentId, AgentRecord, ExitReason, SharedStore, TerminateMode, Usage};
use crate::util::blocking;
use crate::{Error, Result};

/// What to do at the boundary before `iteration` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Proceed,
    Paused,
    Stop(ExitReason),
}

/// Decide whether iteration `iteration` (1-based) may start.
///
/// `immediate` always stops. `after_iteration` stops only from iteration 2
/// on, so a first iteration is never cut short by it. A pending stop request
/// takes precedence over a pause.
pub fn evaluate_control(record: &AgentRecord, iteration: u32) -> Control {
    if !record.is_running() {
        return Control::Stop(record.exit_reason.unwrap_or(ExitReason::Killed));
    }
    match record.terminate_mode {
        TerminateMode::Immediate => return Control::Stop(ExitReason::Killed),
        TerminateMode::AfterIteration if iteration > 1 => {
            return Control::Stop(ExitReason::Killed)
        }
        _ => {}
    }
    if !record.has_iterations_left(iteration.saturating_sub(1)) {
        return Control::Stop(ExitReason::Completed);
    }
    if record.paused && !record.terminate_mode.is_requested() {
        return Control::Paused;
    }
    Control::Proceed
}

/// Drives one registered agent record through its iterations.
#[derive(Clone)]
pub struct IterationLoop {
    store: SharedStore,
    invoker: SharedInvoker,
    poll_interval: Duration,
    default_model: String,
    cancel: CancellationToken,
}

/// Static inputs of one loop run.
#[derive(Debug, Clone)]
pub struct LoopTask {
    pub id: AgentId,
    pub task: String,
    pub prompt: String,
    pub working_dir: PathBuf,
}

impl IterationLoop {
    pub fn new(
        store: SharedStore,
        invoker: SharedInvoker,
        poll_interval: Duration,
        default_model: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            invoker,
            poll_interval,
            default_model: default_model.to_string(),
            cancel,
        }
    }

    async fn fetch(&self, id: &AgentId) -> Result<AgentRecord> {
        fetch_record(&self.store, id).await
    }

    async fn modify<F>(&self, id: &AgentId, f: F) -> Result<AgentRecord>
    where
        F: FnMut(&mut AgentRecord) + Send + 'static,
    {
        modify_record(&self.store, id, f).await
    }

    async fn finish(&self, id: &AgentId, reason: ExitReason) -> Result<AgentRecord> {
        let record = self.modify(id, move |r| r.terminate(reason)).await?;
        info!(
            id = %record.id,
            reason = %record.exit_reason.unwrap_or(reason),
            succeeded = record.successful_iterations,
            failed = record.failed_iterations,
            "agent finished"
        );
        Ok(record)
    }

    /// Run until the iteration budget is spent or a stop is requested.
    /// Returns the terminated record. On error the record is terminated as
    /// failed before the error is returned.
    pub async fn run(&self, task: &LoopTask, output: &mut (dyn Write + Send)) -> Result<AgentRecord> {
        match self.drive(task, output).await {
            Ok(record) => Ok(record),
            Err(e) => {
                abandon_record(&self.store, &task.id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(&self, task: &LoopTask, output: &mut (dyn Write + Send)) -> Result<AgentRecord> {
        let id = &task.id;
        let initial = self.fetch(id).await?;
        let mut seen_model = initial.model.clone();
        let mut seen_total = initial.total_iterations;
        let mut iteration = 1;

        loop {
            if self.cancel.is_cancelled() {
                writeln!(output, "\n[swarm] Interrupted, stopping")?;
                return self.finish(id, ExitReason::Signal).await;
            }

            let record = self.fetch(id).await?;
            if record.total_iterations != seen_total {
                seen_total = record.total_iterations;
                if seen_total == 0 {
                    writeln!(output, "\n[swarm] Now running indefinitely")?;
                } else {
                    writeln!(output, "\n[swarm] Iterations updated to {}", seen_total)?;
                }
            }
            if record.model != seen_model {
                seen_model = record.model.clone();
                writeln!(output, "\n[swarm] Model updated to {}", seen_model)?;
            }

            match evaluate_control(&record, iteration) {
                Control::Stop(reason) => {
                    if reason == ExitReason::Killed {
                        writeln!(output, "\n[swarm] Termination requested, stopping")?;
                    }
                    return self.finish(id, reason).await;
                }
                Control::Paused => {
                    let stop = wait_while_paused(
                        &self.store,
                        id,
                        iteration,
                        self.poll_interval,
                        &self.cancel,
                        output,
                    )
                    .await?;
                    if let Some(reason) = stop {
                        return self.finish(id, reason).await;
                    }
                    continue;
                }
                Control::Proceed => {}
            }

            match self.modify(id, move |r| r.current_iteration = iteration).await {
                Ok(_) => {}
                Err(Error::Validation(reason)) => {
                    // The target shrank under us; the next boundary check settles it.
                    debug!(%id, %reason, "could not advance iteration");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
            if record.total_iterations == 0 {
                writeln!(output, "\n[swarm] === Iteration {} ===", iteration)?;
            } else {
                writeln!(
                    output,
                    "\n[swarm] === Iteration {}/{} ===",
                    iteration, record.total_iterations
                )?;
            }

            let iteration_id = AgentId::generate();
            let request = AgentRequest {
                agent_id: iteration_id.clone(),
                task: task.task.clone(),
                model: if record.model.is_empty() {
                    self.default_model.clone()
                } else {
                    record.model.clone()
                },
                prompt: inject_agent_id(&task.prompt, iteration_id.as_str()),
                working_dir: task.working_dir.clone(),
            };

            let outcome = tokio::select! {
                result = self.invoker.invoke(&request, output) => Some(result),
                _ = self.cancel.cancelled() => None,
            };
            let Some(result) = outcome else {
                writeln!(output, "\n[swarm] Interrupted, stopping")?;
                return self.finish(id, ExitReason::Signal).await;
            };

            let (usage, error) = match result {
                Ok(run) if run.success() => (run.usage, None),
                Ok(run) => (run.usage, Some(format!("agent exited with code {}", run.exit_code))),
                Err(e) => (Usage::default(), Some(e.to_string())),
            };
            if let Some(error) = &error {
                warn!(%id, iteration, %error, "iteration failed");
                writeln!(output, "\n[swarm] Agent error (continuing): {}", error)?;
            }
            self.modify(id, move |r| {
                r.usage.add(&usage);
                match &error {
                    None => r.successful_iterations += 1,
                    Some(e) => {
                        r.failed_iterations += 1;
                        r.last_error = Some(e.clone());
                    }
                }
            })
            .await?;

            iteration += 1;
        }
    }
}

pub(crate) async fn fetch_record(store: &SharedStore, id: &AgentId) -> Result<AgentRecord> {
    let store = store.clone();
    let id = id.clone();
    blocking(move || store.get(&id)).await
}

pub(crate) async fn modify_record<F>(store: &SharedStore, id: &AgentId, mut f: F) -> Result<AgentRecord>
where
    F: FnMut(&mut AgentRecord) + Send + 'static,
{
    let store = store.clone();
    let id = id.clone();
    blocking(move || store.modify(&id, &mut f)).await
}

/// Best-effort termination of a record whose driver hit an error, so it does
/// not stay `running` with nobody behind it.
pub(crate) async fn abandon_record(store: &SharedStore, id: &AgentId, error: &Error) {
    let message = error.to_string();
    let result = modify_record(store, id, move |r| {
        if r.is_running() {
            r.last_error = Some(message.clone());
        }
        r.terminate(ExitReason::Failed);
    })
    .await;
    match result {
        Ok(_) => warn!(%id, %error, "agent failed"),
        Err(e) => warn!(%id, %error, cause = %e, "could not mark agent failed"),
    }
}

/// Block at a boundary until resumed. `Some` carries the reason to stop.
pub(crate) async fn wait_while_paused(
    store: &SharedStore,
    id: &AgentId,
    iteration: u32,
    poll_interval: Duration,
    cancel: &CancellationToken,
    output: &mut (dyn Write + Send),
) -> Result<Option<ExitReason>> {
    writeln!(output, "\n[swarm] Paused, waiting for resume...")?;
    {
        let store = store.clone();
        let id = id.clone();
        blocking(move || mark_paused(&*store, &id)).await?;
    }
    info!(%id, iteration, "paused");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => return Ok(Some(ExitReason::Signal)),
        }
        let record = fetch_record(store, id).await?;
        match evaluate_control(&record, iteration) {
            Control::Paused => continue,
            Control::Stop(reason) => return Ok(Some(reason)),
            Control::Proceed => {
                writeln!(output, "\n[swarm] Resumed")?;
                info!(%id, "resumed");
                return Ok(None);
            }
        }
    }
}
