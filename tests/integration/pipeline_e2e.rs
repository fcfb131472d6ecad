//! End-to-end pipeline tests.
//!
//! Pipelines run against the file store with a tracked record, so every
//! test also checks what other processes would see on disk.

use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use swarm::core::{Condition, Pipeline, PromptSource, Task, TaskState};
use swarm::orchestration::{FilePromptResolver, StaticPrompts};
use swarm::state::{control, AgentStatus, AgentStore, ExitReason, TerminateMode};
use swarm::Error;

use crate::fixtures::{capture_group, task_map, Harness, ScriptedAgent};

fn dev_loop() -> Vec<Task> {
    vec![
        Task::new("planner", PromptSource::Named("plan".into())),
        Task::new("coder", PromptSource::Named("code".into())).depends_on("planner", Condition::Success),
        Task::new("reviewer", PromptSource::Named("review".into())).depends_on("coder", Condition::Success),
    ]
}

/// Test: Planner, coder and reviewer over three iterations
/// Given a linear pipeline with named prompts on disk
/// When it runs with a tracked record
/// Then each iteration runs the chain in order and the record completes
#[tokio::test]
async fn test_dev_loop_runs_every_iteration_in_order() {
    let harness = Harness::new();
    harness.write_prompt("plan", "Write the plan.");
    harness.write_prompt("code", "Implement the next step.");
    harness.write_prompt("review", "Review the change.");
    let agent = ScriptedAgent::new().shared();
    let mut exec = harness.executor(agent.clone());

    let pipeline = Pipeline::new("dev", &["planner", "coder", "reviewer"]).with_iterations(3);
    let registered = assert_ok!(exec.register_pipeline(&pipeline).await).expect("registered");
    let resolver = FilePromptResolver::new(&harness.root().join("prompts"), harness.root());
    let (buf, mut group) = capture_group(&["planner", "coder", "reviewer"]);

    let report = assert_ok!(
        exec.run_pipeline(&pipeline, &task_map(dev_loop()), &resolver, &mut group)
            .await
    );

    assert_eq!(
        agent.calls(),
        ["planner", "coder", "reviewer"].repeat(3),
        "chain must run in order every iteration"
    );
    assert_eq!(report.iterations.len(), 3);
    assert_eq!(report.exit_reason, ExitReason::Completed);
    assert!(report.blocking_failures().is_empty());

    let first = &agent.requests()[0];
    assert!(first.prompt.contains("Write the plan."));
    assert!(first.prompt.contains(&format!("Your Swarm Agent ID is {}", first.agent_id)));
    assert!(first.prompt.contains("Your Swarm Task ID is "));

    let record = assert_ok!(harness.store.get(&registered.id));
    assert_eq!(record.status, AgentStatus::Terminated);
    assert_eq!(record.exit_reason, Some(ExitReason::Completed));
    assert_eq!(record.current_iteration, 3);
    assert_eq!(record.usage.input_tokens, 90);
    assert_eq!(record.usage.output_tokens, 45);

    let out = buf.contents();
    assert!(out.contains("=== Pipeline Iteration 3/3 ==="));
    assert!(out.contains("--- Iteration 2 complete ---"));
    assert!(out.contains("Pipeline completed successfully (3 iterations)"));
}

/// Test: Dependency cycle is rejected up front
/// Given tasks A -> B -> C -> A
/// When the pipeline runs
/// Then it fails with a cycle naming all three and no agent is invoked
#[tokio::test]
async fn test_cycle_is_rejected_before_any_work() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new().shared();
    let exec = harness.executor(agent.clone());
    let tasks = task_map(vec![
        Task::inline("A", "a").depends_on("C", Condition::Success),
        Task::inline("B", "b").depends_on("A", Condition::Success),
        Task::inline("C", "c").depends_on("B", Condition::Success),
    ]);
    let pipeline = Pipeline::new("loop", &["A", "B", "C"]);
    let (_, mut group) = capture_group(&["A", "B", "C"]);

    let err = assert_err!(
        exec.run_pipeline(&pipeline, &tasks, &StaticPrompts::new(), &mut group)
            .await
    );
    match err {
        Error::Cycle { cycles } => {
            assert_eq!(cycles.len(), 1);
            let mut members = cycles[0].clone();
            members.sort();
            assert_eq!(members, vec!["A", "B", "C"]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
    assert!(agent.calls().is_empty());
    assert!(assert_ok!(harness.store.list(false)).is_empty());
}

/// Test: A failure reroutes the iteration and recovers in the next
/// Given coder fails only in the first iteration
/// When the pipeline runs twice
/// Then iteration 1 runs the fixer and skips the reviewer, iteration 2 the reverse
#[tokio::test]
async fn test_failure_gating_across_iterations() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new().failing_on("coder", 1).shared();
    let mut exec = harness.executor(agent.clone());
    let tasks = task_map(vec![
        Task::inline("coder", "code"),
        Task::inline("reviewer", "review").depends_on("coder", Condition::Success),
        Task::inline("fixer", "fix").depends_on("coder", Condition::Failure),
        Task::inline("notify", "notify").depends_on("reviewer", Condition::Always),
    ]);
    let pipeline = Pipeline::new("gated", &["coder", "reviewer", "fixer", "notify"]).with_iterations(2);
    let registered = assert_ok!(exec.register_pipeline(&pipeline).await).expect("registered");
    let (buf, mut group) = capture_group(&["coder", "reviewer", "fixer", "notify"]);

    let report = assert_ok!(
        exec.run_pipeline(&pipeline, &tasks, &StaticPrompts::new(), &mut group)
            .await
    );

    let first = &report.iterations[0].outcomes;
    assert!(matches!(first["coder"], TaskState::Failed { .. }));
    assert_eq!(first["reviewer"], TaskState::Skipped);
    assert_eq!(first["fixer"], TaskState::Succeeded);
    assert_eq!(first["notify"], TaskState::Succeeded);

    let second = &report.iterations[1].outcomes;
    assert_eq!(second["coder"], TaskState::Succeeded);
    assert_eq!(second["reviewer"], TaskState::Succeeded);
    assert_eq!(second["fixer"], TaskState::Skipped);
    assert_eq!(second["notify"], TaskState::Succeeded);

    assert_eq!(report.exit_reason, ExitReason::Failed);
    assert!(buf.contents().contains("Pipeline finished with failures: coder"));
    let record = assert_ok!(harness.store.get(&registered.id));
    assert_eq!(record.exit_reason, Some(ExitReason::Failed));

    match report.ensure_success() {
        Err(Error::PipelineFailed { pipeline, tasks }) => {
            assert_eq!(pipeline, "gated");
            assert_eq!(tasks, vec!["coder"]);
        }
        other => panic!("expected pipeline failure, got {other:?}"),
    }
}

/// Test: Kill after iteration lets the current iteration finish
/// Given a five-iteration pipeline
/// When an after-iteration kill arrives during iteration 2
/// Then iteration 2 completes and iteration 3 never starts
#[tokio::test]
async fn test_after_iteration_kill_finishes_current_iteration() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |request, nth| {
            if request.task == "coder" && nth == 2 {
                control::kill(&*store, "nightly", TerminateMode::AfterIteration).unwrap();
            }
        })
        .shared();
    let mut exec = harness.executor(agent.clone());
    let tasks = task_map(vec![
        Task::inline("coder", "code"),
        Task::inline("reviewer", "review").depends_on("coder", Condition::Success),
    ]);
    let pipeline = Pipeline::new("nightly", &["coder", "reviewer"]).with_iterations(5);
    let registered = assert_ok!(exec.register_pipeline(&pipeline).await).expect("registered");
    let (buf, mut group) = capture_group(&["coder", "reviewer"]);

    let report = assert_ok!(
        exec.run_pipeline(&pipeline, &tasks, &StaticPrompts::new(), &mut group)
            .await
    );

    assert_eq!(agent.calls(), ["coder", "reviewer"].repeat(2));
    assert_eq!(report.iterations.len(), 2);
    assert_eq!(report.exit_reason, ExitReason::Killed);
    assert!(buf.contents().contains("[swarm] Received termination signal"));
    let record = assert_ok!(harness.store.get(&registered.id));
    assert_eq!(record.exit_reason, Some(ExitReason::Killed));
    assert_eq!(record.current_iteration, 2);
}

/// Test: Immediate kill stops launching inside the iteration
/// Given a two-task chain
/// When an immediate kill arrives while the first task runs
/// Then the second task never starts
#[tokio::test]
async fn test_immediate_kill_stops_within_iteration() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |request, _| {
            if request.task == "first" {
                control::kill(&*store, "urgent", TerminateMode::Immediate).unwrap();
            }
        })
        .shared();
    let mut exec = harness.executor(agent.clone());
    let tasks = task_map(vec![
        Task::inline("first", "one"),
        Task::inline("second", "two").depends_on("first", Condition::Success),
    ]);
    let pipeline = Pipeline::new("urgent", &["first", "second"]).with_iterations(3);
    assert_ok!(exec.register_pipeline(&pipeline).await);
    let (buf, mut group) = capture_group(&["first", "second"]);

    let report = assert_ok!(
        exec.run_pipeline(&pipeline, &tasks, &StaticPrompts::new(), &mut group)
            .await
    );

    assert_eq!(agent.calls(), vec!["first"]);
    assert_eq!(report.exit_reason, ExitReason::Killed);
    assert_eq!(report.iterations[0].outcomes["second"], TaskState::Pending);
    assert!(buf.contents().contains("Pipeline terminated (killed)"));
}

/// Test: Pause holds the pipeline until resumed
/// Given a two-iteration pipeline
/// When the pipeline is paused during iteration 1 and resumed shortly after
/// Then both iterations still run and the pause is announced
#[tokio::test]
async fn test_pause_then_resume_continues() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |_, nth| {
            if nth == 1 {
                control::pause(&*store, "held").unwrap();
                let store = store.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(150));
                    control::resume(&*store, "held").unwrap();
                });
            }
        })
        .shared();
    let mut exec = harness.executor(agent.clone());
    let tasks = task_map(vec![Task::inline("solo", "work")]);
    let pipeline = Pipeline::new("held", &["solo"]).with_iterations(2);
    let registered = assert_ok!(exec.register_pipeline(&pipeline).await).expect("registered");
    let (buf, mut group) = capture_group(&["solo"]);

    let report = assert_ok!(
        exec.run_pipeline(&pipeline, &tasks, &StaticPrompts::new(), &mut group)
            .await
    );

    assert_eq!(agent.calls(), vec!["solo", "solo"]);
    assert_eq!(report.exit_reason, ExitReason::Completed);
    let out = buf.contents();
    assert!(out.contains("[swarm] Paused, waiting for resume..."));
    assert!(out.contains("[swarm] Resumed"));
    let record = assert_ok!(harness.store.get(&registered.id));
    assert!(!record.paused);
    assert_eq!(record.paused_at, None);
}

/// Test: A second run of a running pipeline is refused
/// Given a registered, still running pipeline record
/// When the same pipeline is registered again
/// Then registration is skipped and no second record appears
#[tokio::test]
async fn test_duplicate_pipeline_registration_is_skipped() {
    let harness = Harness::new();
    let pipeline = Pipeline::new("dev", &["planner"]);
    let mut first = harness.executor(ScriptedAgent::new().shared());
    let mut second = harness.executor(ScriptedAgent::new().shared());

    assert!(assert_ok!(first.register_pipeline(&pipeline).await).is_some());
    assert!(assert_ok!(second.register_pipeline(&pipeline).await).is_none());
    assert!(second.record_id().is_none());
    assert_eq!(assert_ok!(harness.store.list(true)).len(), 1);
}
