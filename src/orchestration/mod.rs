//! Orchestration layer: running agents for tasks and pipelines.
//!
//! [`TaskRunner`] executes single tasks in the foreground or detached,
//! [`DagExecutor`] drives pipelines iteration by iteration, and
//! [`IterationLoop`] is the control-aware loop both rely on. The agent CLI
//! and process spawning sit behind the [`AgentInvoker`] and [`Spawner`]
//! traits.

mod executor;
mod invoker;
mod looping;
pub mod output;
mod prompt;
mod runner;
mod spawn;

pub use executor::{DagExecutor, IterationReport, PipelineReport};
pub use invoker::{decode_line, AgentInvoker, AgentRequest, AgentRun, Decoded, ProcessAgent, SharedInvoker};
pub use looping::{evaluate_control, Control, IterationLoop, LoopTask};
pub use output::{CaptureBuffer, PrefixedWriter, WriterGroup};
pub use prompt::{
    assemble, inject_agent_id, inject_task_id, FilePromptResolver, PromptResolver, StaticPrompts,
};
pub use runner::{LaunchOutcome, TaskRunner, UnitOutcome, AGENT_SUBCOMMAND};
pub use spawn::{DetachedSpawner, SpawnRequest, Spawner};
