//! Core pipeline model: tasks, conditional dependencies and the graph
//! that decides which tasks may run in an iteration.

pub mod dag;
pub mod task;
pub mod tracker;

pub use dag::{PipelineGraph, Readiness};
pub use task::{Condition, Dependency, Pipeline, PromptSource, Task, TaskState};
pub use tracker::{OutcomeTracker, Summary};
