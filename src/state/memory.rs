//! In-process agent store with the same contract as [`FileStore`].
//!
//! [`FileStore`]: crate::state::FileStore

use std::collections::HashMap;
use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::state::record::{AgentId, AgentRecord};
use crate::state::scope::Scope;
use crate::state::store::{
    check_scope, check_write, sort_records, AgentStore, ChangeFeed, StoreEvent,
};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    records: HashMap<AgentId, AgentRecord>,
    subscribers: Vec<Sender<StoreEvent>>,
}

pub struct MemoryStore {
    scope: Scope,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a record half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Scope::Global)
    }
}

impl Inner {
    fn notify(&mut self) {
        self.subscribers
            .retain(|tx| tx.send(StoreEvent::Changed).is_ok());
    }
}

impl AgentStore for MemoryStore {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn register(&self, record: &AgentRecord) -> Result<()> {
        check_write(&self.scope, None, record)?;
        let mut inner = self.lock();
        if inner.records.contains_key(&record.id) {
            return Err(Error::AgentExists(record.id.to_string()));
        }
        inner.records.insert(record.id.clone(), record.clone());
        inner.notify();
        Ok(())
    }

    fn update(&self, record: &AgentRecord) -> Result<()> {
        let mut inner = self.lock();
        let existing = inner
            .records
            .get(&record.id)
            .ok_or_else(|| Error::AgentNotFound(record.id.to_string()))?;
        check_scope(&self.scope, existing)?;
        check_write(&self.scope, Some(existing), record)?;
        inner.records.insert(record.id.clone(), record.clone());
        inner.notify();
        Ok(())
    }

    fn get(&self, id: &AgentId) -> Result<AgentRecord> {
        let inner = self.lock();
        let record = inner
            .records
            .get(id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        check_scope(&self.scope, record)?;
        Ok(record.clone())
    }

    fn list(&self, only_running: bool) -> Result<Vec<AgentRecord>> {
        let inner = self.lock();
        let mut records: Vec<AgentRecord> = inner
            .records
            .values()
            .filter(|r| self.scope.contains(r))
            .filter(|r| !only_running || r.is_running())
            .cloned()
            .collect();
        sort_records(&mut records);
        Ok(records)
    }

    fn subscribe(&self) -> Result<ChangeFeed> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.lock().subscribers.push(tx);
        Ok(ChangeFeed::new(rx))
    }
}

/// Wraps a [`MemoryStore`] and rejects every update matching `rejects`,
/// standing in for a full disk or a revoked permission.
#[cfg(test)]
pub(crate) struct RejectingStore {
    inner: MemoryStore,
    rejects: Box<dyn Fn(&AgentRecord) -> bool + Send + Sync>,
    pub(crate) rejected: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RejectingStore {
    pub(crate) fn new(rejects: impl Fn(&AgentRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner: MemoryStore::default(),
            rejects: Box::new(rejects),
            rejected: Default::default(),
        }
    }

    pub(crate) fn rejected(&self) -> usize {
        self.rejected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl AgentStore for RejectingStore {
    fn scope(&self) -> &Scope {
        self.inner.scope()
    }

    fn register(&self, record: &AgentRecord) -> Result<()> {
        self.inner.register(record)
    }

    fn update(&self, record: &AgentRecord) -> Result<()> {
        if (self.rejects)(record) {
            self.rejected
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.update(record)
    }

    fn get(&self, id: &AgentId) -> Result<AgentRecord> {
        self.inner.get(id)
    }

    fn list(&self, only_running: bool) -> Result<Vec<AgentRecord>> {
        self.inner.list(only_running)
    }

    fn subscribe(&self) -> Result<ChangeFeed> {
        self.inner.subscribe()
    }
}
