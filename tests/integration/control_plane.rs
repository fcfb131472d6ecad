//! Control plane tests.
//!
//! Agents are driven through the runner while control commands write to
//! the same file store, the way a second `swarm` process would.

use std::path::Path;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use swarm::core::Task;
use swarm::orchestration::{LaunchOutcome, StaticPrompts, UnitOutcome, AGENT_SUBCOMMAND};
use swarm::state::control::{self, WaitOptions, WaitState};
use swarm::state::{
    AgentId, AgentRecord, AgentStatus, AgentStore, ExitReason, FileStore, Scope, TerminateMode,
};
use swarm::Error;

use crate::fixtures::{capture_group, Harness, RecordingSpawner, ScriptedAgent};

fn finished(outcomes: Vec<UnitOutcome>) -> AgentRecord {
    match outcomes.into_iter().next() {
        Some(UnitOutcome::Finished(record)) => record,
        other => panic!("expected a finished unit, got {other:?}"),
    }
}

/// Test: Records are visible to other store handles
/// Given a foreground task with three iterations
/// When it completes
/// Then a second handle on the same directory reads the final record
#[tokio::test]
async fn test_foreground_record_is_shared_through_disk() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new().shared();
    let runner = harness.runner(agent.clone());
    let (buf, mut group) = capture_group(&["coder"]);

    let outcomes = assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("coder", "Implement it.").with_iterations(3)],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    );
    let record = finished(outcomes);

    let other = assert_ok!(FileStore::open(
        &harness.root().join("state"),
        Scope::project(harness.root())
    ));
    let on_disk = assert_ok!(other.get(&record.id));
    assert_eq!(on_disk.status, AgentStatus::Terminated);
    assert_eq!(on_disk.exit_reason, Some(ExitReason::Completed));
    assert_eq!(on_disk.successful_iterations, 3);
    assert_eq!(on_disk.failed_iterations, 0);
    assert_eq!(on_disk.model, "test-model");
    assert!(other.dir().join(format!("{}.json", record.id)).exists());

    assert_eq!(agent.calls().len(), 3);
    assert!(buf.contents().contains("coder | [swarm] === Iteration 3/3 ==="));
}

/// Test: Duplicate start is skipped
/// Given a running agent named coder
/// When coder is started again in the foreground
/// Then it is skipped without invoking the agent
#[tokio::test]
async fn test_duplicate_foreground_start_is_skipped() {
    let harness = Harness::new();
    let existing = AgentRecord::new(AgentId::generate(), "coder", harness.root());
    assert_ok!(harness.store.register(&existing));
    let agent = ScriptedAgent::new().shared();
    let runner = harness.runner(agent.clone());
    let (buf, mut group) = capture_group(&["coder", "tester"]);

    let outcomes = assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("coder", "x"), Task::inline("tester", "y")],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    );

    assert!(matches!(&outcomes[0], UnitOutcome::Skipped { name } if name == "coder"));
    assert_eq!(outcomes[1].name(), "tester");
    assert_eq!(agent.calls(), vec!["tester"]);
    assert!(buf
        .contents()
        .contains("Skipped: agent 'coder' is already running"));
    assert_eq!(assert_ok!(harness.store.list(false)).len(), 2);
}

/// Test: After-iteration kill lets the current iteration finish
/// Given a five-iteration agent
/// When an after-iteration kill arrives during iteration 3
/// Then exactly three iterations run
#[tokio::test]
async fn test_after_iteration_kill_during_third_iteration() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |_, nth| {
            if nth == 3 {
                control::kill(&*store, "worker", TerminateMode::AfterIteration).unwrap();
            }
        })
        .shared();
    let runner = harness.runner(agent.clone());
    let (_, mut group) = capture_group(&["worker"]);

    let record = finished(assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("worker", "w").with_iterations(5)],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    ));

    assert_eq!(agent.calls().len(), 3);
    assert_eq!(record.exit_reason, Some(ExitReason::Killed));
    assert_eq!(record.successful_iterations, 3);
}

/// Test: After-iteration kill in the first iteration
/// Given a five-iteration agent
/// When an after-iteration kill arrives during iteration 1
/// Then only that iteration runs
#[tokio::test]
async fn test_after_iteration_kill_during_first_iteration() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |_, nth| {
            if nth == 1 {
                control::kill(&*store, "worker", TerminateMode::AfterIteration).unwrap();
            }
        })
        .shared();
    let runner = harness.runner(agent.clone());
    let (_, mut group) = capture_group(&["worker"]);

    let record = finished(assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("worker", "w").with_iterations(5)],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    ));

    assert_eq!(agent.calls().len(), 1);
    assert_eq!(record.exit_reason, Some(ExitReason::Killed));
}

/// Test: Immediate kill stops at the next boundary
/// Given a ten-iteration agent
/// When an immediate kill arrives during iteration 2
/// Then iteration 3 never starts
#[tokio::test]
async fn test_immediate_kill_stops_at_next_boundary() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |_, nth| {
            if nth == 2 {
                control::kill(&*store, "worker", TerminateMode::Immediate).unwrap();
            }
        })
        .shared();
    let runner = harness.runner(agent.clone());
    let (_, mut group) = capture_group(&["worker"]);

    let record = finished(assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("worker", "w").with_iterations(10)],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    ));

    assert_eq!(agent.calls().len(), 2);
    assert_eq!(record.exit_reason, Some(ExitReason::Killed));
    assert_eq!(record.terminate_mode, TerminateMode::Immediate);
}

/// Test: Iteration and model updates are picked up while running
/// Given a one-iteration agent
/// When its iteration count and model are changed during iteration 1
/// Then it runs the new count and later iterations use the new model
#[tokio::test]
async fn test_updates_apply_at_next_boundary() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let agent = ScriptedAgent::new()
        .on_call(move |_, nth| {
            if nth == 1 {
                control::set_iterations(&*store, "grow", 3).unwrap();
                control::set_model(&*store, "grow", "opus").unwrap();
            }
        })
        .shared();
    let runner = harness.runner(agent.clone());
    let (buf, mut group) = capture_group(&["grow"]);

    let record = finished(assert_ok!(
        runner
            .run_foreground(
                &[Task::inline("grow", "g")],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    ));

    let models: Vec<String> = agent.requests().into_iter().map(|r| r.model).collect();
    assert_eq!(models, vec!["test-model", "opus", "opus"]);
    assert_eq!(record.successful_iterations, 3);
    let out = buf.contents();
    assert!(out.contains("[swarm] Iterations updated to 3"));
    assert!(out.contains("[swarm] Model updated to opus"));
}

/// Test: Failed iterations fail the foreground run
/// Given two tasks where one agent always exits non-zero
/// When both run in the foreground
/// Then the run fails naming only that task and its record keeps the error
#[tokio::test]
async fn test_failing_task_is_reported_by_name() {
    let harness = Harness::new();
    let agent = ScriptedAgent::new().failing("broken").shared();
    let runner = harness.runner(agent.clone());
    let (_, mut group) = capture_group(&["broken", "fine"]);

    let err = assert_err!(
        runner
            .run_foreground(
                &[
                    Task::inline("broken", "b").with_iterations(2),
                    Task::inline("fine", "f"),
                ],
                &StaticPrompts::new(),
                &mut group,
            )
            .await
    );
    match err {
        Error::TasksFailed(names) => assert_eq!(names, vec!["broken"]),
        other => panic!("expected TasksFailed, got {other:?}"),
    }

    let broken = assert_ok!(control::resolve(&*harness.store, "broken"));
    assert_eq!(broken.failed_iterations, 2);
    assert_eq!(broken.last_error.as_deref(), Some("agent exited with code 1"));
    let fine = assert_ok!(control::resolve(&*harness.store, "fine"));
    assert_eq!(fine.exit_reason, Some(ExitReason::Completed));
}

/// Test: Detached launch hands the record to the spawned process
/// Given a recording spawner
/// When a task is launched detached and the child side resumes it
/// Then the record carries the child pid and log file, and completes
#[tokio::test]
async fn test_detached_launch_and_child_resume() {
    let harness = Harness::new();
    let spawner = RecordingSpawner::new(4242);
    let agent = ScriptedAgent::new().shared();
    let runner = harness.runner_with(agent.clone(), spawner.clone());
    let task = Task::inline("bg", "Run in the background.").with_iterations(2);

    let launched = assert_ok!(runner.launch_detached(&task, &StaticPrompts::new()).await);
    let (id, pid, log_file) = match launched {
        LaunchOutcome::Started { id, pid, log_file } => (id, pid, log_file),
        other => panic!("expected a started launch, got {other:?}"),
    };
    assert_eq!(pid, 4242);
    assert!(agent.calls().is_empty(), "launcher must not run the agent itself");

    let record = assert_ok!(harness.store.get(&id));
    assert!(record.is_running());
    assert_eq!(record.pid, 4242);
    assert_eq!(record.log_file.as_deref(), Some(log_file.as_path()));

    let requests = spawner.requests();
    assert_eq!(requests.len(), 1);
    let args = &requests[0].args;
    assert_eq!(args[0], AGENT_SUBCOMMAND);
    assert_eq!(args[2], id.to_string());
    let prompt_file = Path::new(&args[4]).to_path_buf();
    assert_eq!(
        assert_ok!(std::fs::read_to_string(&prompt_file)),
        "Run in the background."
    );
    assert!(requests[0]
        .env
        .contains(&("SWARM_AGENT_ID".to_string(), id.to_string())));

    let again = assert_ok!(runner.launch_detached(&task, &StaticPrompts::new()).await);
    assert_eq!(again, LaunchOutcome::Skipped { name: "bg".into() });
    assert_eq!(spawner.requests().len(), 1);

    let mut log = Vec::new();
    let done = assert_ok!(runner.resume_detached(&id, &prompt_file, &mut log).await);
    assert_eq!(done.exit_reason, Some(ExitReason::Completed));
    assert_eq!(done.successful_iterations, 2);
    assert_eq!(agent.calls(), vec!["bg", "bg"]);
    assert!(!prompt_file.exists());
    assert!(String::from_utf8_lossy(&log).contains("[swarm] === Iteration 2/2 ==="));
}

/// Test: Spawn failure leaves a failed record behind
/// Given a spawner that cannot start processes
/// When a task is launched detached
/// Then the launch errors and the record is terminated as failed
#[tokio::test]
async fn test_spawn_failure_marks_record_failed() {
    let harness = Harness::new();
    let runner = harness.runner_with(ScriptedAgent::new().shared(), RecordingSpawner::broken());

    let err = assert_err!(
        runner
            .launch_detached(&Task::inline("bg", "x"), &StaticPrompts::new())
            .await
    );
    assert!(matches!(err, Error::TaskLaunch { .. }));

    let records = assert_ok!(harness.store.list(false));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, AgentStatus::Terminated);
    assert_eq!(records[0].exit_reason, Some(ExitReason::Failed));
    assert!(records[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("exec format error")));
}

/// Test: Wait returns once every agent has terminated
/// Given two running records
/// When another thread terminates them
/// Then wait reports both as terminated
#[tokio::test]
async fn test_wait_for_all_agents() {
    let harness = Harness::new();
    let a = AgentRecord::new(AgentId::generate(), "a", harness.root());
    let b = AgentRecord::new(AgentId::generate(), "b", harness.root());
    assert_ok!(harness.store.register(&a));
    assert_ok!(harness.store.register(&b));

    let store = harness.store.clone();
    let ids = (a.id.clone(), b.id.clone());
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        store.modify(&ids.0, &mut |r| r.terminate(ExitReason::Completed)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        store.modify(&ids.1, &mut |r| r.terminate(ExitReason::Killed)).unwrap();
    });

    let options = WaitOptions {
        timeout: Some(Duration::from_secs(5)),
        interval: Duration::from_millis(10),
        any: false,
    };
    let states = assert_ok!(
        control::wait(
            harness.shared_store(),
            &["a".to_string(), "b".to_string()],
            &options,
            &harness.cancel,
        )
        .await
    );
    assert_eq!(states.len(), 2);
    assert!(states.iter().all(|(_, s)| s.is_done()));
    match &states[1].1 {
        WaitState::Terminated(record) => assert_eq!(record.exit_reason, Some(ExitReason::Killed)),
        other => panic!("expected b terminated, got {other:?}"),
    }
}

/// Test: Wait gives up after its timeout
#[tokio::test]
async fn test_wait_times_out_on_running_agent() {
    let harness = Harness::new();
    let record = AgentRecord::new(AgentId::generate(), "forever", harness.root());
    assert_ok!(harness.store.register(&record));

    let options = WaitOptions {
        timeout: Some(Duration::from_millis(60)),
        interval: Duration::from_millis(10),
        any: false,
    };
    let err = assert_err!(
        control::wait(
            harness.shared_store(),
            &["forever".to_string()],
            &options,
            &harness.cancel,
        )
        .await
    );
    assert!(matches!(err, Error::Timeout(_)));
}

/// Test: Project scope hides other projects
/// Given records from two working directories in one state directory
/// When each project's store lists
/// Then it sees only its own, while a global store sees both
#[test]
fn test_project_scope_is_a_view() {
    let harness = Harness::new();
    let elsewhere = tempfile::tempdir().unwrap();
    let state = harness.root().join("state");
    let here = AgentRecord::new(AgentId::generate(), "here", harness.root());
    let there = AgentRecord::new(AgentId::generate(), "there", elsewhere.path());

    let global = FileStore::open(&state, Scope::Global).unwrap();
    global.register(&here).unwrap();
    global.register(&there).unwrap();

    let names: Vec<String> = harness
        .store
        .list(false)
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(names, vec!["here"]);
    assert_eq!(global.list(false).unwrap().len(), 2);
    assert!(matches!(
        harness.store.get(&there.id),
        Err(Error::ScopeMismatch { .. })
    ));
}

/// Test: Agents whose process vanished are reconciled as crashed
#[test]
fn test_reconcile_stale_marks_crashed() {
    let harness = Harness::new();
    let gone = AgentRecord::new(AgentId::generate(), "gone", harness.root()).with_pid(0);
    let alive = AgentRecord::new(AgentId::generate(), "alive", harness.root());
    harness.store.register(&gone).unwrap();
    harness.store.register(&alive).unwrap();

    let reconciled = harness.store.reconcile_stale().unwrap();

    assert_eq!(reconciled, vec![gone.id.clone()]);
    let record = harness.store.get(&gone.id).unwrap();
    assert_eq!(record.exit_reason, Some(ExitReason::Crashed));
    assert!(harness.store.get(&alive.id).unwrap().is_running());
}
