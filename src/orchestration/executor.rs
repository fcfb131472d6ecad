//! Iteration engine for pipelines.
//!
//! Each iteration starts with every task pending and repeats
//! resolve-skips, launch-ready, wait-for-one until nothing is left pending
//! or running. Iterations are strictly sequential. When the pipeline has a
//! record of its own, the executor reads it at iteration and wave
//! boundaries so pause and kill work the same way as for single agents.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::core::{Condition, OutcomeTracker, Pipeline, PipelineGraph, Summary, Task, TaskState};
use crate::orchestration::invoker::AgentRun;
use crate::orchestration::looping::{
    abandon_record, evaluate_control, fetch_record, modify_record, wait_while_paused, Control,
};
use crate::orchestration::output::{PrefixedWriter, WriterGroup};
use crate::orchestration::prompt::PromptResolver;
use crate::orchestration::runner::TaskRunner;
use crate::state::{AgentId, AgentRecord, ExitReason, SharedStore, TaskSlots, Usage};
use crate::util::blocking;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub outcomes: BTreeMap<String, TaskState>,
    pub summary: Summary,
    /// Failed tasks whose failure skipped a `success`-gated consumer.
    pub blocking_failures: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: String,
    pub iterations: Vec<IterationReport>,
    pub exit_reason: ExitReason,
    pub usage: Usage,
}

impl PipelineReport {
    pub fn blocking_failures(&self) -> Vec<String> {
        self.iterations
            .iter()
            .flat_map(|it| it.blocking_failures.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Turn blocking failures into `PipelineFailed`.
    pub fn ensure_success(self) -> Result<Self> {
        let tasks = self.blocking_failures();
        if tasks.is_empty() {
            Ok(self)
        } else {
            Err(Error::PipelineFailed {
                pipeline: self.pipeline,
                tasks,
            })
        }
    }
}

type Finished = (String, PrefixedWriter, Result<AgentRun>);

pub struct DagExecutor {
    runner: Arc<TaskRunner>,
    slots: TaskSlots,
    record: Option<AgentId>,
}

impl DagExecutor {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        let slots = TaskSlots::new(&runner.config().locks_dir);
        Self {
            runner,
            slots,
            record: None,
        }
    }

    /// Report progress to, and take control from, an existing record.
    pub fn with_record(mut self, id: AgentId) -> Self {
        self.record = Some(id);
        self
    }

    pub fn record_id(&self) -> Option<&AgentId> {
        self.record.as_ref()
    }

    fn store(&self) -> &SharedStore {
        self.runner.store()
    }

    /// Register a record for `pipeline` and track it.
    ///
    /// Returns `None` without registering when a pipeline of the same name
    /// is already running.
    pub async fn register_pipeline(&mut self, pipeline: &Pipeline) -> Result<Option<AgentRecord>> {
        let store = self.store().clone();
        let running = blocking(move || store.running_names()).await?;
        if running.contains(&pipeline.name) {
            info!(pipeline = %pipeline.name, "pipeline already running");
            return Ok(None);
        }
        let config = self.runner.config();
        let record = AgentRecord::new(AgentId::generate(), &pipeline.name, &config.working_dir)
            .with_prompt(&format!("pipeline:{}", pipeline.name))
            .with_model(&config.default_model)
            .with_iterations(pipeline.iterations);
        {
            let store = self.store().clone();
            let record = record.clone();
            blocking(move || store.register(&record)).await?;
        }
        self.record = Some(record.id.clone());
        Ok(Some(record))
    }

    /// Run `pipeline` for its iterations.
    ///
    /// Graph errors are returned before anything runs. Task failures never
    /// abort an iteration; they show up in the report (see
    /// [`PipelineReport::ensure_success`]). Any error leaves the tracked
    /// record terminated as failed.
    pub async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        tasks: &HashMap<String, Task>,
        resolver: &dyn PromptResolver,
        group: &mut WriterGroup,
    ) -> Result<PipelineReport> {
        let result = self.drive(pipeline, tasks, resolver, group).await;
        if let (Err(e), Some(id)) = (&result, &self.record) {
            abandon_record(self.store(), id, e).await;
        }
        result
    }

    async fn drive(
        &self,
        pipeline: &Pipeline,
        tasks: &HashMap<String, Task>,
        resolver: &dyn PromptResolver,
        group: &mut WriterGroup,
    ) -> Result<PipelineReport> {
        let graph = PipelineGraph::from_pipeline(pipeline, tasks)?;
        graph.validate()?;

        let mut writers: HashMap<String, PrefixedWriter> = graph
            .tasks()
            .into_iter()
            .map(|name| (name.to_string(), group.writer(name)))
            .collect();
        let mut banner = group.unprefixed();
        let planned = match pipeline.iterations {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        };
        writeln!(
            banner,
            "Running pipeline '{}' with {} iteration(s) and {} task(s)",
            pipeline.name,
            planned,
            graph.len()
        )?;
        info!(pipeline = %pipeline.name, iterations = pipeline.iterations, tasks = graph.len(), "pipeline started");

        let mut report = PipelineReport {
            pipeline: pipeline.name.clone(),
            iterations: Vec::new(),
            exit_reason: ExitReason::Completed,
            usage: Usage::default(),
        };
        let mut total = pipeline.iterations;
        let mut iteration = 1;

        loop {
            if self.runner.cancel_token().is_cancelled() {
                report.exit_reason = ExitReason::Signal;
                break;
            }
            if let Some(id) = &self.record {
                let record = fetch_record(self.store(), id).await?;
                total = record.total_iterations;
                match evaluate_control(&record, iteration) {
                    Control::Stop(ExitReason::Completed) => break,
                    Control::Stop(reason) => {
                        writeln!(banner, "\n[swarm] Received termination signal")?;
                        report.exit_reason = reason;
                        break;
                    }
                    Control::Paused => {
                        let stop = wait_while_paused(
                            self.store(),
                            id,
                            iteration,
                            self.runner.config().poll_interval,
                            self.runner.cancel_token(),
                            &mut banner,
                        )
                        .await?;
                        if let Some(reason) = stop {
                            report.exit_reason = reason;
                            break;
                        }
                        continue;
                    }
                    Control::Proceed => {}
                }
                match modify_record(self.store(), id, move |r| r.current_iteration = iteration).await {
                    Ok(_) => {}
                    Err(Error::Validation(reason)) => {
                        debug!(%id, %reason, "could not advance pipeline iteration");
                        tokio::time::sleep(self.runner.config().poll_interval).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else if total != 0 && iteration > total {
                break;
            }

            if total == 0 {
                writeln!(banner, "\n=== Pipeline Iteration {} ===", iteration)?;
            } else {
                writeln!(banner, "\n=== Pipeline Iteration {}/{} ===", iteration, total)?;
            }
            let (iteration_report, stop) = self
                .run_iteration(
                    pipeline,
                    &graph,
                    tasks,
                    resolver,
                    iteration,
                    &mut writers,
                    &mut banner,
                    &mut report.usage,
                )
                .await?;
            writeln!(banner, "Tasks: {}", iteration_report.summary)?;
            info!(
                pipeline = %pipeline.name,
                iteration,
                summary = %iteration_report.summary,
                "iteration finished"
            );
            report.iterations.push(iteration_report);
            if let Some(reason) = stop {
                report.exit_reason = reason;
                break;
            }
            writeln!(banner, "--- Iteration {} complete ---", iteration)?;
            iteration += 1;
        }

        let blocking = report.blocking_failures();
        if report.exit_reason == ExitReason::Completed && !blocking.is_empty() {
            report.exit_reason = ExitReason::Failed;
        }
        if let Some(id) = &self.record {
            let reason = report.exit_reason;
            modify_record(self.store(), id, move |r| r.terminate(reason)).await?;
        }

        match report.exit_reason {
            ExitReason::Completed => writeln!(
                banner,
                "\nPipeline completed successfully ({} iterations)",
                report.iterations.len()
            )?,
            ExitReason::Failed => writeln!(
                banner,
                "\nPipeline finished with failures: {}",
                blocking.join(", ")
            )?,
            reason => writeln!(banner, "\nPipeline terminated ({})", reason)?,
        }
        banner.finish()?;
        info!(pipeline = %pipeline.name, reason = %report.exit_reason, "pipeline finished");
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        &self,
        pipeline: &Pipeline,
        graph: &PipelineGraph,
        tasks: &HashMap<String, Task>,
        resolver: &dyn PromptResolver,
        iteration: u32,
        writers: &mut HashMap<String, PrefixedWriter>,
        banner: &mut PrefixedWriter,
        usage: &mut Usage,
    ) -> Result<(IterationReport, Option<ExitReason>)> {
        let started = Instant::now();
        let cancel = self.runner.cancel_token().clone();
        let mut tracker = OutcomeTracker::new(graph.tasks());
        let mut in_flight = FuturesUnordered::new();
        let mut stop: Option<ExitReason> = None;

        loop {
            let mut hold = false;
            if let (None, Some(id)) = (stop, &self.record) {
                let record = fetch_record(self.store(), id).await?;
                // Mid-iteration only `immediate` and pauses apply.
                match evaluate_control(&record, 1) {
                    Control::Stop(reason) => {
                        writeln!(banner, "[swarm] Received termination signal")?;
                        stop = Some(reason);
                    }
                    Control::Paused if in_flight.is_empty() => {
                        stop = wait_while_paused(
                            self.store(),
                            id,
                            1,
                            self.runner.config().poll_interval,
                            &cancel,
                            banner,
                        )
                        .await?;
                    }
                    Control::Paused => hold = true,
                    Control::Proceed => {}
                }
            }

            for name in graph.resolve_skips(&mut tracker) {
                debug!(task = %name, iteration, "skipped");
                if let Some(writer) = writers.get_mut(&name) {
                    writeln!(writer, "Skipped (dependency condition not met)")?;
                }
            }

            if stop.is_none() && !hold {
                let ready = graph.ready_tasks(&tracker);
                let room = pipeline
                    .cap(ready.len() + in_flight.len())
                    .saturating_sub(in_flight.len());
                for name in ready.into_iter().take(room) {
                    let task = tasks
                        .get(&name)
                        .ok_or_else(|| Error::UnknownTask(name.clone()))?;
                    let mut writer = writers
                        .remove(&name)
                        .ok_or_else(|| Error::UnknownTask(name.clone()))?;
                    tracker.set_running(&name);
                    in_flight.push(self.run_task(task, resolver, iteration, writer));
                }
            }

            if in_flight.is_empty() {
                if stop.is_some() || tracker.all_terminal() {
                    break;
                }
                let summary = tracker.summary();
                return Err(Error::Validation(format!(
                    "deadlock: {} pending task(s) but none ready",
                    summary.pending
                )));
            }

            let next = tokio::select! {
                done = in_flight.next() => done,
                _ = cancel.cancelled() => None,
            };
            let Some((name, mut writer, result)) = next else {
                // Dropping the in-flight units kills their agents.
                warn!(iteration, running = in_flight.len(), "interrupted");
                stop = Some(ExitReason::Signal);
                break;
            };

            if let Ok(run) = &result {
                usage.add(&run.usage);
                self.record_usage(run.usage).await;
            }
            match result.and_then(|run| run.into_result(&name)) {
                Ok(_) => {
                    tracker.set_succeeded(&name);
                    writeln!(writer, "Completed")?;
                }
                Err(e) => {
                    warn!(task = %name, iteration, error = %e, "task failed");
                    tracker.set_failed(&name, &e.to_string());
                    writeln!(writer, "Failed: {}", e)?;
                }
            }
            writer.flush()?;
            writers.insert(name, writer);
        }

        let report = IterationReport {
            iteration,
            blocking_failures: blocking_failures(graph, &tracker),
            summary: tracker.summary(),
            outcomes: tracker.states().clone(),
            duration: started.elapsed(),
        };
        Ok((report, stop))
    }

    async fn run_task<'a>(
        &'a self,
        task: &'a Task,
        resolver: &'a dyn PromptResolver,
        iteration: u32,
        mut writer: PrefixedWriter,
    ) -> Finished {
        let result = self.run_in_slot(task, resolver, iteration, &mut writer).await;
        (task.name.clone(), writer, result)
    }

    /// Hold one of the task's concurrency slots, if it has a limit, for the
    /// whole invocation.
    async fn run_in_slot(
        &self,
        task: &Task,
        resolver: &dyn PromptResolver,
        iteration: u32,
        writer: &mut PrefixedWriter,
    ) -> Result<AgentRun> {
        let _slot = if task.concurrency > 0 {
            writeln!(writer, "Waiting for concurrency slot...")?;
            let slot = self
                .slots
                .acquire(&task.name, task.concurrency, self.runner.cancel_token())
                .await?;
            if slot.is_none() {
                return Err(Error::Cancelled);
            }
            slot
        } else {
            None
        };
        writeln!(writer, "Starting (iteration {})", iteration)?;
        let prompt = resolver.resolve(task).map_err(|e| Error::TaskLaunch {
            task: task.name.clone(),
            reason: e.to_string(),
        })?;
        self.runner.execute_unit(task, &prompt, writer).await
    }

    async fn record_usage(&self, usage: Usage) {
        let Some(id) = &self.record else {
            return;
        };
        if usage.is_empty() {
            return;
        }
        if let Err(e) = modify_record(self.store(), id, move |r| r.usage.add(&usage)).await {
            warn!(%id, error = %e, "could not record pipeline usage");
        }
    }
}

/// Failed tasks with a `success`-gated consumer that was skipped.
fn blocking_failures(graph: &PipelineGraph, tracker: &OutcomeTracker) -> Vec<String> {
    tracker
        .failed_tasks()
        .into_iter()
        .filter(|failed| {
            graph.dependents(failed).into_iter().any(|consumer| {
                *tracker.get(consumer) == TaskState::Skipped
                    && graph
                        .dependencies(consumer)
                        .iter()
                        .any(|(up, c)| *up == failed.as_str() && *c == Condition::Success)
            })
        })
        .collect()
}
