//! Stage execution through the job queue

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{StageContext, StageRegistry};
use crate::stage::StageId;
use crate::worker::{JobHandler, JobOutcome};
use async_trait::async_trait;
use bookforge_storage::JobRecord;
use serde::{Deserialize, Serialize};

/// Payload of a queued stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub stage: StageId,
    pub context: StageContext,
}

impl StageJob {
    pub fn from_record(job: &JobRecord) -> Result<Self> {
        serde_json::from_value(job.data.clone()).map_err(|e| {
            OrchestratorError::fatal("queue", format!("job {} is not a stage job: {}", job.id, e))
        })
    }
}

/// Runs queued stage jobs with the registered stage handlers.
///
/// The ack result is the serialized `StageOutput`; the orchestrator waiting
/// on the job reads it back and applies the stage's quality gate.
pub struct StageJobHandler {
    registry: StageRegistry,
}

impl StageJobHandler {
    pub fn new(registry: StageRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl JobHandler for StageJobHandler {
    fn service(&self, job: &JobRecord) -> Option<String> {
        let payload = StageJob::from_record(job).ok()?;
        let handler = self.registry.get(payload.stage).ok()?;
        handler.service().map(str::to_string)
    }

    fn run_id(&self, job: &JobRecord) -> Option<String> {
        StageJob::from_record(job).ok().map(|p| p.context.run_id)
    }

    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome> {
        let payload = StageJob::from_record(job)?;
        // A missing handler cannot be fixed by retrying
        let handler = self
            .registry
            .get(payload.stage)
            .map_err(|e| OrchestratorError::fatal(payload.stage, e))?;

        let output = handler.execute(&payload.context).await?;
        Ok(JobOutcome {
            usage: output.usage.clone(),
            result: Some(serde_json::to_value(&output)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StageHandler, StageOutput, Usage};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Illustrate;

    #[async_trait]
    impl StageHandler for Illustrate {
        fn stage_id(&self) -> StageId {
            StageId::Illustrate
        }

        fn service(&self) -> Option<&str> {
            Some("images")
        }

        async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
            Ok(StageOutput::new(serde_json::json!({ "topic": ctx.topic }))
                .with_usage(Usage::new("images", 0.04)))
        }
    }

    fn record(stage: StageId) -> JobRecord {
        let payload = StageJob {
            stage,
            context: StageContext {
                run_id: "run-7".to_string(),
                topic: "Kites".to_string(),
                stage,
                attempt: 1,
                outputs: BTreeMap::new(),
            },
        };
        JobRecord::new("stages", serde_json::to_value(payload).unwrap(), 0, 3)
    }

    fn handler() -> StageJobHandler {
        let mut registry = StageRegistry::new();
        registry.register(Arc::new(Illustrate)).unwrap();
        StageJobHandler::new(registry)
    }

    #[tokio::test]
    async fn test_handle_returns_stage_output() {
        let handler = handler();
        let job = record(StageId::Illustrate);

        assert_eq!(handler.service(&job).as_deref(), Some("images"));
        assert_eq!(handler.run_id(&job).as_deref(), Some("run-7"));

        let outcome = handler.handle(&job).await.unwrap();
        assert_eq!(outcome.usage, vec![Usage::new("images", 0.04)]);

        let output: StageOutput = serde_json::from_value(outcome.result.unwrap()).unwrap();
        assert_eq!(output.data["topic"], "Kites");
    }

    #[tokio::test]
    async fn test_unregistered_stage_is_fatal() {
        let err = handler().handle(&record(StageId::Plan)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_foreign_payload_is_fatal() {
        let job = JobRecord::new("stages", serde_json::json!({ "hello": 1 }), 0, 3);
        assert!(handler().service(&job).is_none());
        let err = handler().handle(&job).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
