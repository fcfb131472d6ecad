//! Turning a task's prompt source into the text handed to the agent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::task::{PromptSource, Task};
use crate::{Error, Result};

/// Supplies the full prompt text for a task.
pub trait PromptResolver: Send + Sync {
    fn resolve(&self, task: &Task) -> Result<String>;
}

/// Reads named prompts from `<dir>/<name>.md`, files as-is, and applies
/// the task's prefix and suffix.
#[derive(Debug, Clone)]
pub struct FilePromptResolver {
    prompts_dir: PathBuf,
    base_dir: PathBuf,
}

impl FilePromptResolver {
    /// `base_dir` anchors relative `prompt_file` paths.
    pub fn new(prompts_dir: &Path, base_dir: &Path) -> Self {
        Self {
            prompts_dir: prompts_dir.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
        }
    }

    fn read(&self, path: &Path, what: &str) -> Result<String> {
        fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::Validation(format!("{} not found: {}", what, path.display()))
            }
            _ => e.into(),
        })
    }
}

impl PromptResolver for FilePromptResolver {
    fn resolve(&self, task: &Task) -> Result<String> {
        let body = match &task.prompt {
            PromptSource::Named(name) => {
                let file = if name.ends_with(".md") {
                    name.clone()
                } else {
                    format!("{}.md", name)
                };
                self.read(&self.prompts_dir.join(file), "prompt")?
            }
            PromptSource::File(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    self.base_dir.join(path)
                };
                self.read(&path, "prompt file")?
            }
            PromptSource::Inline(text) => text.clone(),
        };
        Ok(assemble(task, body.trim()))
    }
}

/// Fixed prompts keyed by task name, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPrompts {
    prompts: HashMap<String, String>,
}

impl StaticPrompts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task: &str, prompt: &str) -> Self {
        self.prompts.insert(task.to_string(), prompt.to_string());
        self
    }
}

impl PromptResolver for StaticPrompts {
    fn resolve(&self, task: &Task) -> Result<String> {
        match self.prompts.get(&task.name) {
            Some(text) => Ok(assemble(task, text)),
            None => match &task.prompt {
                PromptSource::Inline(text) => Ok(assemble(task, text)),
                _ => Err(Error::Validation(format!(
                    "no prompt registered for task '{}'",
                    task.name
                ))),
            },
        }
    }
}

/// Apply prefix and suffix, separated by blank lines.
pub fn assemble(task: &Task, body: &str) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(3);
    if let Some(prefix) = task.prefix.as_deref().filter(|p| !p.trim().is_empty()) {
        parts.push(prefix.trim());
    }
    parts.push(body);
    if let Some(suffix) = task.suffix.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(suffix.trim());
    }
    parts.join("\n\n")
}

/// Tell the agent which id it runs under for this iteration.
pub fn inject_agent_id(prompt: &str, agent_id: &str) -> String {
    format!("Your Swarm Agent ID is {}.\n\n{}", agent_id, prompt)
}

/// Tell the agent which pipeline task it is working on.
pub fn inject_task_id(prompt: &str, task_id: &str) -> String {
    format!("Your Swarm Task ID is {}.\n\n{}", task_id, prompt)
}
