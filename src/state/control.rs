//! Control-plane operations used by the CLI and other store clients.
//!
//! Every operation is a read-modify-write of one record. The running agent
//! loop observes the change at its next iteration boundary.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::record::{AgentId, AgentRecord, TerminateMode};
use crate::state::store::{AgentStore, SharedStore};
use crate::util::blocking;
use crate::{Error, Result};

/// Tokens that mean "the most recently started agent in scope".
pub const LAST_AGENT_ALIASES: [&str; 2] = ["@last", "_"];

/// Resolve an id, a name, or `@last`/`_`.
pub fn resolve(store: &dyn AgentStore, token: &str) -> Result<AgentRecord> {
    if LAST_AGENT_ALIASES.contains(&token) {
        return store
            .list(false)?
            .pop()
            .ok_or_else(|| Error::AgentNotFound(token.to_string()));
    }
    store.get_by_name_or_id(token)
}

fn modify_running(
    store: &dyn AgentStore,
    token: &str,
    f: &mut dyn FnMut(&mut AgentRecord),
) -> Result<AgentRecord> {
    let record = resolve(store, token)?;
    if !record.is_running() {
        return Err(Error::NotRunning(record.display_name().to_string()));
    }
    store.modify(&record.id, f)
}

pub fn pause(store: &dyn AgentStore, token: &str) -> Result<AgentRecord> {
    let record = modify_running(store, token, &mut |r| r.paused = true)?;
    info!(id = %record.id, "pause requested");
    Ok(record)
}

pub fn resume(store: &dyn AgentStore, token: &str) -> Result<AgentRecord> {
    let record = modify_running(store, token, &mut |r| {
        r.paused = false;
        r.paused_at = None;
    })?;
    info!(id = %record.id, "resume requested");
    Ok(record)
}

/// Ask an agent to stop. `Immediate` stops at the next boundary,
/// `AfterIteration` lets the in-progress iteration finish first.
pub fn kill(store: &dyn AgentStore, token: &str, mode: TerminateMode) -> Result<AgentRecord> {
    if mode == TerminateMode::None {
        return Err(Error::Validation("kill needs a terminate mode".to_string()));
    }
    let record = modify_running(store, token, &mut |r| r.terminate_mode = mode)?;
    info!(id = %record.id, ?mode, "termination requested");
    Ok(record)
}

/// Change the target iteration count; 0 means run until stopped.
pub fn set_iterations(store: &dyn AgentStore, token: &str, total: u32) -> Result<AgentRecord> {
    let current = resolve(store, token)?;
    if total != 0 && total < current.current_iteration {
        return Err(Error::Validation(format!(
            "agent {} is already on iteration {}",
            current.display_name(),
            current.current_iteration
        )));
    }
    modify_running(store, token, &mut |r| r.total_iterations = total)
}

pub fn set_model(store: &dyn AgentStore, token: &str, model: &str) -> Result<AgentRecord> {
    if model.trim().is_empty() {
        return Err(Error::Validation("model must not be empty".to_string()));
    }
    modify_running(store, token, &mut |r| r.model = model.to_string())
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub interval: Duration,
    /// Return as soon as one agent has terminated.
    pub any: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            interval: Duration::from_secs(1),
            any: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitState {
    Running,
    Terminated(AgentRecord),
    /// The record disappeared; counts as terminated.
    Removed,
}

impl WaitState {
    pub fn is_done(&self) -> bool {
        !matches!(self, WaitState::Running)
    }
}

/// Poll until all (or, with `any`, one) of the agents have terminated.
///
/// Returns the final observed state per agent, in input order.
pub async fn wait(
    store: SharedStore,
    tokens: &[String],
    options: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<Vec<(AgentId, WaitState)>> {
    let mut ids = Vec::with_capacity(tokens.len());
    for token in tokens {
        ids.push(resolve(&*store, token)?.id);
    }
    let started = Instant::now();

    loop {
        let snapshot = {
            let store = store.clone();
            let ids = ids.clone();
            blocking(move || poll_states(&*store, &ids)).await?
        };
        let done = snapshot.iter().filter(|(_, s)| s.is_done()).count();
        let finished = if options.any {
            done > 0
        } else {
            done == snapshot.len()
        };
        if finished {
            return Ok(snapshot);
        }

        let mut sleep_for = options.interval;
        if let Some(limit) = options.timeout {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(Error::Timeout(limit));
            }
            sleep_for = sleep_for.min(limit - elapsed);
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

fn poll_states(store: &dyn AgentStore, ids: &[AgentId]) -> Result<Vec<(AgentId, WaitState)>> {
    ids.iter()
        .map(|id| {
            let state = match store.get(id) {
                Ok(r) if r.is_running() => WaitState::Running,
                Ok(r) => WaitState::Terminated(r),
                Err(Error::AgentNotFound(_)) => WaitState::Removed,
                Err(e) => return Err(e),
            };
            Ok((id.clone(), state))
        })
        .collect()
}

/// Record that the owning loop has entered its pause wait.
pub(crate) fn mark_paused(store: &dyn AgentStore, id: &AgentId) -> Result<AgentRecord> {
    store.modify(id, &mut |r| {
        if r.paused_at.is_none() {
            r.paused_at = Some(Utc::now());
        }
    })
}
