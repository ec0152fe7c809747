//! Worker behavior against a live HTTP server: retry policies, attempt
//! numbering, completion events.
//!
//! These tests use real time (wiremock does real socket I/O), so retry
//! delays are kept in the low hundreds of milliseconds.

mod common;

use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use automata_flow::broker::{EventBus, EventKind, Message, QueueName, TaskCompletedPayload};
use automata_flow::spec::{RetryPolicy, StepType};
use automata_flow::store::Store;
use automata_flow::task::TaskStatus;

use common::{spec, step_with_config, Harness};

/// Builds the run + queued task for a single-step spec and returns the task.
async fn queued_task(harness: &Harness, spec: automata_flow::spec::FlowSpec) -> automata_flow::task::Task {
    let version = harness.store_version(spec).await;
    let run = harness.create_run(&version, serde_json::Map::new()).await;
    harness.orchestrator.process_run(run.id).await.unwrap();

    let tasks = harness.store.list_tasks_by_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    tasks.into_iter().next().unwrap()
}

#[tokio::test]
async fn http_retry_on_503_succeeds_on_third_attempt() {
    let server = MockServer::start().await;
    // Two 503s, then a 200.
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let mut flaky = step_with_config(
        "flaky",
        StepType::Http,
        &[],
        json!({"url": format!("{}/flaky", server.uri()), "method": "GET"}),
    );
    flaky.retry = Some(RetryPolicy {
        max_attempts: 3,
        backoff: "exponential".to_string(),
        initial_delay_ms: 100,
        max_delay_ms: 1000,
        on_status: vec![503],
    });

    let task = queued_task(&harness, spec(vec![flaky])).await;

    let started = Instant::now();
    harness
        .worker
        .process_task(task.id, &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt, 3);
    assert_eq!(task.outputs["status_code"], json!(200));
    assert_eq!(task.outputs["body"], json!({"ok": true}));
    // Backoff slept 100ms then 200ms between the attempts.
    assert!(elapsed >= Duration::from_millis(300), "elapsed: {elapsed:?}");
}

#[tokio::test]
async fn status_outside_on_status_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let mut call = step_with_config("call", StepType::Http, &[], json!({"url": server.uri()}));
    call.retry = Some(RetryPolicy {
        max_attempts: 5,
        backoff: "fixed".to_string(),
        initial_delay_ms: 50,
        max_delay_ms: 1000,
        on_status: vec![503],
    });

    let task = queued_task(&harness, spec(vec![call])).await;
    harness
        .worker
        .process_task(task.id, &CancellationToken::new())
        .await
        .unwrap();

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    // 404 is not in on_status: one attempt only.
    assert_eq!(task.attempt, 1);
    assert!(task.error.starts_with("HTTP 404:"), "error: {}", task.error);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn no_policy_means_a_single_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let call = step_with_config("call", StepType::Http, &[], json!({"url": server.uri()}));
    let task = queued_task(&harness, spec(vec![call])).await;

    harness
        .worker
        .process_task(task.id, &CancellationToken::new())
        .await
        .unwrap();

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn spec_defaults_supply_the_retry_policy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let mut flow_spec = spec(vec![step_with_config(
        "call",
        StepType::Http,
        &[],
        json!({"url": server.uri()}),
    )]);
    flow_spec.defaults = Some(automata_flow::spec::StepDefaults {
        retry: Some(RetryPolicy {
            max_attempts: 2,
            backoff: "fixed".to_string(),
            initial_delay_ms: 50,
            max_delay_ms: 1000,
            on_status: vec![],
        }),
        timeout_sec: None,
    });

    let task = queued_task(&harness, flow_spec).await;
    harness
        .worker
        .process_task(task.id, &CancellationToken::new())
        .await
        .unwrap();

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempt, 2);
}

#[tokio::test]
async fn completion_event_carries_status_and_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let call = step_with_config("call", StepType::Http, &[], json!({"url": server.uri()}));
    let task = queued_task(&harness, spec(vec![call])).await;

    harness
        .worker
        .process_task(task.id, &CancellationToken::new())
        .await
        .unwrap();

    let mut subscription = harness
        .bus
        .subscribe(QueueName::TasksCompleted, 1)
        .await
        .unwrap();
    let delivery = subscription.recv().await.unwrap();
    let message: Message = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(message.kind, EventKind::TaskCompleted);

    let payload: TaskCompletedPayload = message.parse_payload().unwrap();
    assert_eq!(payload.task_id, task.id);
    assert_eq!(payload.step_id, "call");
    assert_eq!(payload.status, TaskStatus::Succeeded);
    assert_eq!(payload.attempt, 1);
}

#[tokio::test]
async fn non_queued_task_is_left_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let harness = Harness::new();
    let call = step_with_config("call", StepType::Http, &[], json!({"url": server.uri()}));
    let task = queued_task(&harness, spec(vec![call])).await;

    let cancel = CancellationToken::new();
    harness.worker.process_task(task.id, &cancel).await.unwrap();

    // A redelivered task.ready for the finished task is a no-op.
    let err = harness
        .worker
        .process_task(task.id, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, automata_flow::error::Error::TaskNotQueued));

    let task = harness.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.attempt, 1);
}
