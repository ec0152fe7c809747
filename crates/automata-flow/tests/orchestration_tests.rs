//! End-to-end coordination scenarios over the in-memory store and broker.
//!
//! Each test runs the real orchestrator and worker loops and drives a run
//! from PENDING to a terminal status. Tests use paused time, so poll
//! intervals, delays and backoffs fast-forward.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use automata_flow::broker::{Publisher, TaskCompletedPayload};
use automata_flow::run::RunStatus;
use automata_flow::spec::StepType;
use automata_flow::store::Store;
use automata_flow::task::TaskStatus;

use common::{assert_status, parallel, spec, step, step_with_config, Harness};

/// Spawns the orchestrator and worker loops, returning the kill switch.
fn start_services(harness: &Harness) -> CancellationToken {
    let cancel = CancellationToken::new();

    let orchestrator = harness.orchestrator.clone();
    let orchestrator_cancel = cancel.clone();
    tokio::spawn(async move { orchestrator.run(orchestrator_cancel).await });

    let worker = harness.worker.clone();
    let worker_cancel = cancel.clone();
    tokio::spawn(async move { worker.run(worker_cancel).await });

    cancel
}

#[tokio::test(start_paused = true)]
async fn linear_chain_succeeds_in_order() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            step_with_config("A", StepType::Transform, &[], json!({"x": 1})),
            step_with_config("B", StepType::Delay, &["A"], json!({"duration_sec": 1})),
            step("C", StepType::Transform, &["B"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Succeeded);

    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    // Tasks are created in dependency order.
    let order: Vec<&str> = tasks.iter().map(|t| t.step_id.as_str()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Succeeded));
    assert_eq!(tasks[1].outputs["delayed_sec"], json!(1.0));
}

#[tokio::test(start_paused = true)]
async fn step_outputs_flow_through_templates() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            step_with_config("seed", StepType::Transform, &[], json!({"region": "eu"})),
            step_with_config(
                "format",
                StepType::Transform,
                &["seed"],
                json!({"greeting": "hello {{ .Steps.seed.Outputs.region }} from {{ .Inputs.name }}"}),
            ),
        ]))
        .await;

    let inputs = json!({"name": "automata"}).as_object().cloned().unwrap();
    let run = harness.create_run(&version, inputs).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Succeeded);
    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    let format_task = tasks.iter().find(|t| t.step_id == "format").unwrap();
    assert_eq!(
        format_task.outputs["greeting"],
        json!("hello eu from automata")
    );
}

#[tokio::test(start_paused = true)]
async fn diamond_joins_both_sides() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            step("A", StepType::Transform, &[]),
            step_with_config("B", StepType::Delay, &["A"], json!({"duration_sec": 2})),
            step("C", StepType::Transform, &["A"]),
            step("D", StepType::Transform, &["B", "C"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Succeeded);

    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 4);
    let d_task = tasks.iter().find(|t| t.step_id == "D").unwrap();
    let b_task = tasks.iter().find(|t| t.step_id == "B").unwrap();
    let c_task = tasks.iter().find(|t| t.step_id == "C").unwrap();
    // D is created only after the slower side (B) finished.
    assert!(d_task.created_at >= b_task.finished_at.unwrap());
    assert!(d_task.created_at >= c_task.finished_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn failure_short_circuits_downstream_steps() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            // Nothing listens on port 1; the step fails on its only attempt.
            step_with_config(
                "A",
                StepType::Http,
                &[],
                json!({"url": "http://127.0.0.1:1", "timeout_sec": 1}),
            ),
            step("B", StepType::Transform, &["A"]),
            step("C", StepType::Transform, &["B"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Failed);
    assert!(finished.error.contains("A"), "error: {}", finished.error);

    // No task was ever created for B or C.
    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_id, "A");
    assert_eq!(tasks[0].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn parallel_branches_join_before_the_tail() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            step("start", StepType::Transform, &[]),
            parallel(
                "par",
                &["start"],
                vec![
                    (
                        "branch_a",
                        vec![
                            step("s1", StepType::Transform, &[]),
                            step_with_config(
                                "s2",
                                StepType::Delay,
                                &[],
                                json!({"duration_sec": 3}),
                            ),
                        ],
                    ),
                    ("branch_b", vec![step("s1", StepType::Transform, &[])]),
                ],
            ),
            step("end", StepType::Transform, &["par"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Succeeded);

    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    let step_ids: HashSet<&str> = tasks.iter().map(|t| t.step_id.as_str()).collect();
    let expected: HashSet<&str> = [
        "start",
        "par.branch_a.s1",
        "par.branch_a.s2",
        "par.branch_b.s1",
        "end",
    ]
    .into_iter()
    .collect();
    assert_eq!(step_ids, expected);

    // Virtual nodes never become tasks.
    assert!(!step_ids.contains("par"));
    assert!(!step_ids.contains("par.join"));

    // The tail only starts after the slowest branch endpoint finished.
    let end_task = tasks.iter().find(|t| t.step_id == "end").unwrap();
    let slow_branch = tasks.iter().find(|t| t.step_id == "par.branch_a.s2").unwrap();
    assert!(end_task.created_at >= slow_branch.finished_at.unwrap());
}

#[tokio::test(start_paused = true)]
async fn falsy_condition_skips_the_step() {
    let harness = Harness::new();
    let mut conditional = step("maybe", StepType::Transform, &["seed"]);
    conditional.condition = ".Steps.seed.Outputs.enabled".to_string();
    let version = harness
        .store_version(spec(vec![
            step_with_config("seed", StepType::Transform, &[], json!({"enabled": false})),
            conditional,
            step("after", StepType::Transform, &["maybe"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Succeeded);

    // The skipped step produced no task, yet unblocked its dependents.
    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    let step_ids: Vec<&str> = tasks.iter().map(|t| t.step_id.as_str()).collect();
    assert!(step_ids.contains(&"seed"));
    assert!(step_ids.contains(&"after"));
    assert!(!step_ids.contains(&"maybe"));
}

#[tokio::test(start_paused = true)]
async fn invalid_spec_fails_the_run_immediately() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![step("A", StepType::Http, &["ghost"])]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();

    assert_status(&finished, RunStatus::Failed);
    assert!(
        finished.error.contains("initialization failed"),
        "error: {}",
        finished.error
    );
    assert_eq!(harness.store.task_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_continues_a_run_after_restart() {
    // First orchestrator instance starts the run and dispatches step A,
    // then "crashes" (we never deliver the completion to it).
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![
            step_with_config("A", StepType::Transform, &[], json!({"x": 7})),
            step("B", StepType::Transform, &["A"]),
        ]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    harness.orchestrator.process_run(run.id).await.unwrap();
    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task_a = &tasks[0];

    // The worker completes A while no orchestrator holds the run in memory.
    let cancel = CancellationToken::new();
    harness.worker.process_task(task_a.id, &cancel).await.unwrap();

    // A fresh orchestrator (empty active set) receives the completion and
    // must restore the run from persisted tasks before advancing.
    let restarted = Harness::new_with_backends(&harness);
    restarted
        .orchestrator
        .process_task_completed(TaskCompletedPayload {
            task_id: task_a.id,
            run_id: run.id,
            step_id: "A".to_string(),
            status: TaskStatus::Succeeded,
            error: String::new(),
            attempt: 1,
        })
        .await
        .unwrap();

    // Restoration fed A's outputs back in and dispatched B.
    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    let task_b = tasks.iter().find(|t| t.step_id == "B").unwrap();
    assert_eq!(task_b.status, TaskStatus::Queued);

    // Completing B finalizes the run on the restored state.
    restarted
        .worker
        .process_task(task_b.id, &cancel)
        .await
        .unwrap();
    restarted
        .orchestrator
        .process_task_completed(TaskCompletedPayload {
            task_id: task_b.id,
            run_id: run.id,
            step_id: "B".to_string(),
            status: TaskStatus::Succeeded,
            error: String::new(),
            attempt: 1,
        })
        .await
        .unwrap();

    let finished = harness.store.get_run(run.id).await.unwrap().unwrap();
    assert_status(&finished, RunStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn late_completion_for_terminal_run_is_ignored() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![step("A", StepType::Transform, &[])]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);
    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();
    assert_status(&finished, RunStatus::Succeeded);

    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    let task_a = &tasks[0];

    // A duplicate completion after finalization is a no-op: restore sees a
    // terminal run and refuses.
    let restarted = Harness::new_with_backends(&harness);
    restarted
        .orchestrator
        .process_task_completed(TaskCompletedPayload {
            task_id: task_a.id,
            run_id: run.id,
            step_id: "A".to_string(),
            status: TaskStatus::Failed,
            error: "late duplicate".to_string(),
            attempt: 1,
        })
        .await
        .unwrap();

    let still = harness.store.get_run(run.id).await.unwrap().unwrap();
    assert_status(&still, RunStatus::Succeeded);
    assert_eq!(restarted.orchestrator.active_run_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_pending_event_drives_pickup_without_polling() {
    let harness = Harness::new();
    let version = harness
        .store_version(spec(vec![step("A", StepType::Transform, &[])]))
        .await;
    let run = harness.create_run(&version, Map::new()).await;

    let cancel = start_services(&harness);

    // Announce the run the way the API/scheduler would.
    let publisher = Publisher::new(harness.bus.clone());
    publisher.publish_run_pending(run.id).await.unwrap();

    let finished = harness.await_terminal(run.id, Duration::from_secs(60)).await;
    cancel.cancel();
    assert_status(&finished, RunStatus::Succeeded);
}
