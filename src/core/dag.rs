//! Pipeline dependency graph with conditional edges.
//!
//! Nodes are task names; an edge `a -> b` labelled with a [`Condition`]
//! means `b` waits for `a` and runs only if `a`'s outcome matches. The graph
//! itself holds no runtime state: readiness is computed against an
//! [`OutcomeTracker`] for the current iteration.

use crate::core::task::{Condition, Pipeline, Task, TaskState};
use crate::core::tracker::OutcomeTracker;
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Where a task stands with respect to its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// All gates satisfied; may start now.
    Ready,
    /// Some upstream task has not finished yet.
    Pending,
    /// A gate can never be satisfied this iteration.
    Skip,
}

/// The pipeline dependency graph.
///
/// Uses petgraph's DiGraph with task names as node weights and edge
/// conditions as edge weights, plus a name index for lookups.
pub struct PipelineGraph {
    graph: DiGraph<String, Condition>,
    index: HashMap<String, NodeIndex>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph over every task in `tasks`.
    ///
    /// # Errors
    /// `UnknownDependency` if a task depends on a name not in `tasks`.
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_task(&task.name);
        }
        for task in tasks {
            for dep in &task.depends_on {
                graph.add_edge(&dep.task, &task.name, dep.condition)?;
            }
        }
        Ok(graph)
    }

    /// Build the graph for one pipeline.
    ///
    /// Members must all be defined. Edges from tasks that are defined but
    /// not part of the pipeline are dropped; edges from undefined tasks are
    /// an error.
    pub fn from_pipeline(pipeline: &Pipeline, tasks: &HashMap<String, Task>) -> Result<Self> {
        let mut graph = Self::new();
        for name in &pipeline.tasks {
            if !tasks.contains_key(name) {
                return Err(Error::UnknownTask(name.clone()));
            }
            graph.add_task(name);
        }
        for name in &pipeline.tasks {
            for dep in &tasks[name].depends_on {
                if graph.contains(&dep.task) {
                    graph.add_edge(&dep.task, name, dep.condition)?;
                } else if tasks.contains_key(&dep.task) {
                    debug!(
                        pipeline = %pipeline.name,
                        task = %name,
                        dependency = %dep.task,
                        "ignoring dependency outside pipeline"
                    );
                } else {
                    return Err(Error::UnknownDependency {
                        task: name.clone(),
                        dependency: dep.task.clone(),
                    });
                }
            }
        }
        Ok(graph)
    }

    /// Add a task node. Adding an existing name returns its node.
    pub fn add_task(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }

    /// Add `from -> to`: `to` waits for `from` under `condition`.
    ///
    /// Cycles are not rejected here; call [`validate`](Self::validate)
    /// once the graph is complete so that every cycle can be reported.
    pub fn add_edge(&mut self, from: &str, to: &str, condition: Condition) -> Result<()> {
        let to_index = *self
            .index
            .get(to)
            .ok_or_else(|| Error::UnknownTask(to.to_string()))?;
        let from_index = *self
            .index
            .get(from)
            .ok_or_else(|| Error::UnknownDependency {
                task: to.to_string(),
                dependency: from.to_string(),
            })?;
        self.graph.add_edge(from_index, to_index, condition);
        Ok(())
    }

    /// Reject the graph if it has any cycle, naming every node of every cycle.
    pub fn validate(&self) -> Result<()> {
        let cycles = self.cycles();
        if cycles.is_empty() {
            Ok(())
        } else {
            Err(Error::Cycle { cycles })
        }
    }

    /// Every cycle as a sorted list of task names, ordered by first name.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut names: Vec<String> =
                    scc.into_iter().map(|i| self.graph[i].clone()).collect();
                names.sort();
                names
            })
            .collect();
        cycles.sort();
        cycles
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Task names in insertion order.
    pub fn tasks(&self) -> Vec<&str> {
        self.graph.node_weights().map(String::as_str).collect()
    }

    /// Incoming edges of `name` as (upstream, condition).
    pub fn dependencies(&self, name: &str) -> Vec<(&str, Condition)> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (self.graph[e.source()].as_str(), *e.weight()))
            .collect()
    }

    /// Tasks that wait on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        self.graph
            .neighbors_directed(index, Direction::Outgoing)
            .filter(|n| seen.insert(*n))
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|i| self.graph[i].as_str())
            .collect()
    }

    /// Tasks ordered so that each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let sorted = toposort(&self.graph, None).map_err(|_| Error::Cycle {
            cycles: self.cycles(),
        })?;
        Ok(sorted.into_iter().map(|i| self.graph[i].as_str()).collect())
    }

    /// Evaluate every incoming gate of `name` against this iteration's outcomes.
    ///
    /// - `success` needs the upstream to have succeeded; failed or skipped
    ///   upstreams can never satisfy it.
    /// - `failure` needs the upstream to have failed; succeeded or skipped
    ///   upstreams can never satisfy it.
    /// - `any` and `always` need the upstream to be finished in any way.
    ///
    /// A task with an unsatisfiable gate is skipped, unless it also has an
    /// `always` gate: then it runs once every upstream has finished.
    pub fn readiness(&self, name: &str, outcomes: &OutcomeTracker) -> Readiness {
        let deps = self.dependencies(name);
        let has_always = deps.iter().any(|(_, c)| *c == Condition::Always);
        let mut waiting = false;
        let mut blocked = false;

        for (upstream, condition) in deps {
            let state = outcomes.get(upstream);
            if !state.is_terminal() {
                waiting = true;
                continue;
            }
            let satisfied = match condition {
                Condition::Success => *state == TaskState::Succeeded,
                Condition::Failure => matches!(state, TaskState::Failed { .. }),
                Condition::Any | Condition::Always => true,
            };
            if !satisfied {
                blocked = true;
            }
        }

        if blocked && !has_always {
            Readiness::Skip
        } else if waiting {
            Readiness::Pending
        } else {
            Readiness::Ready
        }
    }

    /// Pending tasks whose gates are all satisfied.
    pub fn ready_tasks(&self, outcomes: &OutcomeTracker) -> Vec<String> {
        self.pending_with(outcomes, Readiness::Ready)
    }

    /// Pending tasks that can no longer run this iteration.
    pub fn skippable_tasks(&self, outcomes: &OutcomeTracker) -> Vec<String> {
        self.pending_with(outcomes, Readiness::Skip)
    }

    fn pending_with(&self, outcomes: &OutcomeTracker, wanted: Readiness) -> Vec<String> {
        self.graph
            .node_weights()
            .filter(|name| *outcomes.get(name) == TaskState::Pending)
            .filter(|name| self.readiness(name, outcomes) == wanted)
            .cloned()
            .collect()
    }

    /// Mark every task that can never run as skipped, cascading downstream.
    ///
    /// Returns the newly skipped tasks in the order they were resolved.
    pub fn resolve_skips(&self, outcomes: &mut OutcomeTracker) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let batch = self.skippable_tasks(outcomes);
            if batch.is_empty() {
                return skipped;
            }
            for name in batch {
                outcomes.set_skipped(&name);
                skipped.push(name);
            }
        }
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("tasks", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}
