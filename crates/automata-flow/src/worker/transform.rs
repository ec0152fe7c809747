//! Transform executor: template expansion pass-through.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::executor::{ExecutionResult, Executor};
use crate::error::Result;
use crate::task::Task;

/// Executor for `transform` steps.
///
/// The orchestrator already rendered the step config through the template
/// engine at dispatch time, so the payload holds the fully expanded values.
/// Returning it as outputs is what makes transform a data-reshaping step:
/// downstream steps read the expansion through `.Steps.<id>.Outputs`.
pub struct TransformExecutor;

#[async_trait]
impl Executor for TransformExecutor {
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Result<ExecutionResult> {
        Ok(ExecutionResult::success(task.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automata_core::RunId;
    use crate::spec::StepType;

    #[tokio::test]
    async fn outputs_echo_the_rendered_payload() {
        let payload = serde_json::json!({"total": 12, "region": "eu"})
            .as_object()
            .cloned()
            .unwrap();
        let task = Task::new(RunId::generate(), "reshape", "", StepType::Transform, payload);

        let result = TransformExecutor
            .execute(&task, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.outputs, task.payload);
    }

    #[tokio::test]
    async fn empty_payload_yields_empty_outputs() {
        let task = Task::new(
            RunId::generate(),
            "reshape",
            "",
            StepType::Transform,
            serde_json::Map::new(),
        );
        let result = TransformExecutor
            .execute(&task, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.outputs.is_empty());
    }
}
