//! File-backed agent store: one JSON document per agent.
//!
//! Layout: `<root>/agents/<id>.json`. Several processes (launchers, control
//! commands, UI clients) read and write the same directory without locks.
//!
//! - `register` writes a private temp file and hard-links it into place, so a
//!   duplicate id fails atomically instead of overwriting.
//! - `update` writes a temp file and renames it over the target, so readers
//!   see either the old or the new record, never a torn one.
//! - Temp files start with `.` and are ignored by `list` and the watcher.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::state::record::{AgentId, AgentRecord, ExitReason};
use crate::state::scope::Scope;
use crate::state::store::{
    check_scope, check_write, sort_records, AgentStore, ChangeFeed, StoreEvent,
};
use crate::util::{pid_alive, short_hex};
use crate::{Error, Result};

pub struct FileStore {
    dir: PathBuf,
    scope: Scope,
}

impl FileStore {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: &Path, scope: Scope) -> Result<Self> {
        let dir = root.join("agents");
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), %scope, "opened file store");
        Ok(Self { dir, scope })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &AgentId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn temp_path(&self, id: &AgentId) -> PathBuf {
        self.dir.join(format!(".{}.{}.tmp", id, short_hex(8)))
    }

    fn write_temp(&self, record: &AgentRecord) -> Result<PathBuf> {
        let tmp = self.temp_path(&record.id);
        let data = serde_json::to_vec_pretty(record)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(tmp)
    }

    fn read_raw(&self, id: &AgentId) -> Result<Option<AgentRecord>> {
        match fs::read(self.path_for(id)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark running records whose process has disappeared as terminated.
    ///
    /// Returns the ids that were reconciled.
    pub fn reconcile_stale(&self) -> Result<Vec<AgentId>> {
        let mut reconciled = Vec::new();
        for record in self.list(true)? {
            if pid_alive(record.pid) {
                continue;
            }
            let result = self.modify(&record.id, &mut |r| {
                r.terminate(ExitReason::Crashed);
            });
            match result {
                Ok(_) => {
                    info!(id = %record.id, pid = record.pid, "reconciled stale agent");
                    reconciled.push(record.id);
                }
                // Finalized concurrently by its owner.
                Err(Error::StatusRegression { .. }) => {}
                Err(e) => warn!(id = %record.id, error = %e, "failed to reconcile agent"),
            }
        }
        Ok(reconciled)
    }
}

fn is_record_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && name.ends_with(".json")
}

impl AgentStore for FileStore {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn register(&self, record: &AgentRecord) -> Result<()> {
        check_write(&self.scope, None, record)?;
        let target = self.path_for(&record.id);
        let tmp = self.write_temp(record)?;
        let linked = fs::hard_link(&tmp, &target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AgentExists(record.id.to_string()));
            }
            Err(e) => {
                debug!(error = %e, "hard link unavailable, using exclusive create");
                let mut file = match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&target)
                {
                    Ok(f) => f,
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        return Err(Error::AgentExists(record.id.to_string()));
                    }
                    Err(e) => return Err(e.into()),
                };
                file.write_all(&serde_json::to_vec_pretty(record)?)?;
            }
        }
        debug!(id = %record.id, name = %record.name, "registered agent");
        Ok(())
    }

    fn update(&self, record: &AgentRecord) -> Result<()> {
        let existing = self
            .read_raw(&record.id)?
            .ok_or_else(|| Error::AgentNotFound(record.id.to_string()))?;
        check_scope(&self.scope, &existing)?;
        check_write(&self.scope, Some(&existing), record)?;
        let tmp = self.write_temp(record)?;
        if let Err(e) = fs::rename(&tmp, self.path_for(&record.id)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(id = %record.id, status = %record.status, "updated agent");
        Ok(())
    }

    fn get(&self, id: &AgentId) -> Result<AgentRecord> {
        let record = self
            .read_raw(id)?
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
        check_scope(&self.scope, &record)?;
        Ok(record)
    }

    fn list(&self, only_running: bool) -> Result<Vec<AgentRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !is_record_file(&path) {
                continue;
            }
            let data = match fs::read(&path) {
                Ok(data) => data,
                // Raced with a concurrent writer; the next list will see it.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<AgentRecord>(&data) {
                Ok(record) => {
                    if self.scope.contains(&record) && (!only_running || record.is_running()) {
                        records.push(record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt agent record"),
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    fn subscribe(&self) -> Result<ChangeFeed> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else {
                    return;
                };
                match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
                    _ => return,
                }
                if event.paths.iter().any(|p| is_record_file(p)) {
                    let _ = tx.send(StoreEvent::Changed);
                }
            },
            Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(ChangeFeed::with_source(rx, Box::new(watcher)))
    }
}
