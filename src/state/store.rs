//! The agent store contract shared by the file and memory backends.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::state::record::{AgentId, AgentRecord, AgentStatus};
use crate::state::scope::Scope;
use crate::{Error, Result};

/// Coarse notification: something in the store changed, re-read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Changed,
}

/// Subscription handle. Dropping it stops delivery.
pub struct ChangeFeed {
    rx: Receiver<StoreEvent>,
    // Keeps the producer (e.g. a filesystem watcher) alive.
    _source: Option<Box<dyn Send>>,
}

impl ChangeFeed {
    pub fn new(rx: Receiver<StoreEvent>) -> Self {
        Self { rx, _source: None }
    }

    pub fn with_source(rx: Receiver<StoreEvent>, source: Box<dyn Send>) -> Self {
        Self {
            rx,
            _source: Some(source),
        }
    }

    /// Block until a change arrives or `timeout` passes. Bursts are coalesced.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(_) => {
                self.drain();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Consume queued events; true if there were any.
    pub fn drain(&self) -> bool {
        let mut any = false;
        while self.rx.try_recv().is_ok() {
            any = true;
        }
        any
    }
}

/// Persistent registry of agent records.
///
/// Writes are whole-record and last-writer-wins; callers re-fetch before
/// mutating (see [`AgentStore::modify`]). Implementations must be safe to
/// share between threads and, for the file backend, between processes.
pub trait AgentStore: Send + Sync {
    fn scope(&self) -> &Scope;

    /// Insert a new record. Fails with `AgentExists` if the id is taken.
    fn register(&self, record: &AgentRecord) -> Result<()>;

    /// Replace an existing record. Fails with `AgentNotFound` if absent.
    fn update(&self, record: &AgentRecord) -> Result<()>;

    fn get(&self, id: &AgentId) -> Result<AgentRecord>;

    /// Snapshot of in-scope records, oldest first.
    fn list(&self, only_running: bool) -> Result<Vec<AgentRecord>>;

    fn subscribe(&self) -> Result<ChangeFeed>;

    /// Resolve a user-supplied token: exact id first, then exact name.
    ///
    /// Among name matches a single running record wins; several running
    /// matches are ambiguous; with none running, the latest started wins.
    fn get_by_name_or_id(&self, token: &str) -> Result<AgentRecord> {
        if let Ok(id) = AgentId::parse(token) {
            match self.get(&id) {
                Err(Error::AgentNotFound(_)) => {}
                other => return other,
            }
        }
        let matches: Vec<AgentRecord> = self
            .list(false)?
            .into_iter()
            .filter(|r| r.name == token)
            .collect();
        select_by_name(token, matches)
    }

    /// Read-modify-write of a single record.
    fn modify(
        &self,
        id: &AgentId,
        f: &mut dyn FnMut(&mut AgentRecord),
    ) -> Result<AgentRecord> {
        let mut record = self.get(id)?;
        f(&mut record);
        self.update(&record)?;
        Ok(record)
    }

    /// Names of running agents, for duplicate-start checks.
    fn running_names(&self) -> Result<HashSet<String>> {
        Ok(self
            .list(true)?
            .into_iter()
            .map(|r| r.display_name().to_string())
            .collect())
    }
}

pub type SharedStore = Arc<dyn AgentStore>;

fn select_by_name(token: &str, mut matches: Vec<AgentRecord>) -> Result<AgentRecord> {
    let running: Vec<&AgentRecord> = matches.iter().filter(|r| r.is_running()).collect();
    match running.len() {
        0 => {}
        1 => return Ok(running[0].clone()),
        _ => {
            return Err(Error::AmbiguousAgent {
                token: token.to_string(),
                matches: running.iter().map(|r| r.id.to_string()).collect(),
            })
        }
    }
    matches.sort_by_key(|r| r.started_at);
    matches
        .pop()
        .ok_or_else(|| Error::AgentNotFound(token.to_string()))
}

/// Checks every backend applies before persisting a record.
pub(crate) fn check_write(
    scope: &Scope,
    existing: Option<&AgentRecord>,
    record: &AgentRecord,
) -> Result<()> {
    record.validate()?;
    check_scope(scope, record)?;
    if let Some(prev) = existing {
        if prev.status == AgentStatus::Terminated && record.status == AgentStatus::Running {
            debug!(id = %record.id, "rejecting status regression");
            return Err(Error::StatusRegression {
                id: record.id.to_string(),
            });
        }
    }
    Ok(())
}

pub(crate) fn check_scope(scope: &Scope, record: &AgentRecord) -> Result<()> {
    if scope.contains(record) {
        Ok(())
    } else {
        Err(Error::ScopeMismatch {
            id: record.id.to_string(),
            scope: scope.to_string(),
            found: record.working_dir.display().to_string(),
        })
    }
}

pub(crate) fn sort_records(records: &mut [AgentRecord]) {
    records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
}
