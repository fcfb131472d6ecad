use std::path::{Path, PathBuf};

use crate::state::record::AgentRecord;

/// Which records a store instance is allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every record on this host.
    Global,
    /// Records whose working directory is exactly this path.
    Project(PathBuf),
}

impl Scope {
    pub fn project(dir: &Path) -> Self {
        Scope::Project(normalize(dir))
    }

    pub fn contains(&self, record: &AgentRecord) -> bool {
        match self {
            Scope::Global => true,
            Scope::Project(dir) => normalize(&record.working_dir) == *dir,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Project(dir) => write!(f, "project {}", dir.display()),
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
