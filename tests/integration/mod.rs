//! Integration test suite for swarm.
//!
//! These tests drive the runner, the pipeline executor and the control
//! plane together against a real file-backed store in a temporary
//! directory.
//!
//! # Test Categories
//!
//! - `pipeline_e2e`: Multi-iteration pipelines, cycles and failure gating
//! - `control_plane`: Records, duplicate guards and stop/pause requests
//! - `parallel_output`: Attribution of interleaved foreground output
//!
//! # CI Compatibility
//!
//! The agent CLI is replaced by a scripted invoker and detached launches
//! by a recording spawner, so no external processes are started.

mod fixtures;

mod control_plane;
mod pipeline_e2e;
