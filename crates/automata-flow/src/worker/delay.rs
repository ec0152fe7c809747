//! Delay executor: a cancellable sleep.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::executor::{payload_f64, ExecutionResult, Executor};
use crate::error::{Error, Result};
use crate::task::Task;

/// Executor for `delay` steps.
///
/// Config:
/// - `duration_sec` (number, float or int): seconds to sleep, default 1
///
/// Outputs: `{ "delayed_sec": <n> }`
pub struct DelayExecutor;

#[async_trait]
impl Executor for DelayExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let mut duration_sec = payload_f64(&task.payload, "duration_sec").unwrap_or(1.0);
        if duration_sec <= 0.0 {
            duration_sec = 1.0;
        }

        let duration = Duration::from_secs_f64(duration_sec);
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = cancel.cancelled() => return Err(Error::Cancelled),
        }

        let mut outputs = Map::new();
        outputs.insert(
            "delayed_sec".to_string(),
            serde_json::Number::from_f64(duration_sec).map_or(Value::Null, Value::Number),
        );
        Ok(ExecutionResult::success(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automata_core::RunId;
    use crate::spec::StepType;

    fn delay_task(config: serde_json::Value) -> Task {
        Task::new(
            RunId::generate(),
            "wait",
            "",
            StepType::Delay,
            config.as_object().cloned().unwrap_or_default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_configured_duration() {
        let task = delay_task(serde_json::json!({"duration_sec": 3}));
        let started = tokio::time::Instant::now();

        let result = DelayExecutor
            .execute(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(result.is_success());
        assert_eq!(result.outputs["delayed_sec"], serde_json::json!(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn defaults_to_one_second() {
        let task = delay_task(serde_json::json!({}));
        let started = tokio::time::Instant::now();

        DelayExecutor
            .execute(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn non_positive_duration_falls_back_to_one_second() {
        let task = delay_task(serde_json::json!({"duration_sec": -5}));
        let result = DelayExecutor
            .execute(&task, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.outputs["delayed_sec"], serde_json::json!(1.0));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_sleep() {
        let task = delay_task(serde_json::json!({"duration_sec": 60}));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = DelayExecutor.execute(&task, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
