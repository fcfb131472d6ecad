//! Per-iteration outcome bookkeeping for pipeline tasks.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::task::TaskState;

/// Counts of task outcomes in one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if self.pending + self.running > 0 {
            write!(f, ", {} unfinished", self.pending + self.running)?;
        }
        Ok(())
    }
}

/// State of every task in the current iteration.
#[derive(Debug, Clone, Default)]
pub struct OutcomeTracker {
    states: BTreeMap<String, TaskState>,
}

impl OutcomeTracker {
    pub fn new<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            states: tasks
                .into_iter()
                .map(|t| (t.into(), TaskState::Pending))
                .collect(),
        }
    }

    /// Start a new iteration: everything back to pending.
    pub fn reset(&mut self) {
        for state in self.states.values_mut() {
            *state = TaskState::Pending;
        }
    }

    /// Unknown tasks read as pending.
    pub fn get(&self, task: &str) -> &TaskState {
        self.states.get(task).unwrap_or(&TaskState::Pending)
    }

    pub fn set(&mut self, task: &str, state: TaskState) {
        self.states.insert(task.to_string(), state);
    }

    pub fn set_running(&mut self, task: &str) {
        self.set(task, TaskState::Running);
    }

    pub fn set_succeeded(&mut self, task: &str) {
        self.set(task, TaskState::Succeeded);
    }

    pub fn set_failed(&mut self, task: &str, error: &str) {
        self.set(
            task,
            TaskState::Failed {
                error: error.to_string(),
            },
        );
    }

    pub fn set_skipped(&mut self, task: &str) {
        self.set(task, TaskState::Skipped);
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(TaskState::is_terminal)
    }

    pub fn tasks_in(&self, wanted: fn(&TaskState) -> bool) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| wanted(s))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn failed_tasks(&self) -> Vec<String> {
        self.tasks_in(|s| matches!(s, TaskState::Failed { .. }))
    }

    pub fn states(&self) -> &BTreeMap<String, TaskState> {
        &self.states
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for state in self.states.values() {
            match state {
                TaskState::Pending => summary.pending += 1,
                TaskState::Running => summary.running += 1,
                TaskState::Succeeded => summary.succeeded += 1,
                TaskState::Failed { .. } => summary.failed += 1,
                TaskState::Skipped => summary.skipped += 1,
            }
        }
        summary
    }
}
