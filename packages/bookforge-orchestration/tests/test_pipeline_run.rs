//! Integration tests for driving runs end to end
//!
//! Covers:
//! - Retry accounting and attempt reset
//! - Quality gates
//! - Abort, reopen and resume without re-executing completed stages
//! - Budget refusal
//! - Exclusive run ownership

use async_trait::async_trait;
use bookforge_orchestration::{
    BackoffPolicy, Budgets, CostLedger, OrchestratorError, OrchestratorSettings,
    PipelineOrchestrator, QualityGate, RateLimiter, Result, RunOptions, RunOutcome, ServiceLimits,
    StageContext, StageHandler, StageId, StageOutput, StageRegistry, Usage, Usd, WindowLimit,
};
use bookforge_storage::{InMemoryLedger, InMemoryManifestStore, JsonFileManifestStore, ManifestStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Script = dyn Fn(u32, &StageContext) -> Result<StageOutput> + Send + Sync;

/// Stage whose behavior depends on how often it has been called
struct ScriptedStage {
    stage: StageId,
    service: Option<String>,
    calls: AtomicU32,
    script: Box<Script>,
}

impl ScriptedStage {
    fn new(
        stage: StageId,
        script: impl Fn(u32, &StageContext) -> Result<StageOutput> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            stage,
            service: None,
            calls: AtomicU32::new(0),
            script: Box::new(script),
        })
    }

    fn ok(stage: StageId) -> Arc<Self> {
        Self::new(stage, move |_, ctx| {
            Ok(StageOutput::new(serde_json::json!({ "by": ctx.stage.as_str() })))
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for ScriptedStage {
    fn stage_id(&self) -> StageId {
        self.stage
    }

    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(call, ctx)
    }
}

struct Harness {
    stages: HashMap<StageId, Arc<ScriptedStage>>,
}

impl Harness {
    /// Every stage succeeds unless overridden
    fn new(overrides: Vec<Arc<ScriptedStage>>) -> Self {
        let mut stages: HashMap<StageId, Arc<ScriptedStage>> = StageId::PIPELINE
            .iter()
            .map(|s| (*s, ScriptedStage::ok(*s)))
            .collect();
        for stage in overrides {
            stages.insert(stage.stage, stage);
        }
        Self { stages }
    }

    fn registry(&self) -> StageRegistry {
        let mut registry = StageRegistry::new();
        for stage in self.stages.values() {
            registry.register(stage.clone()).unwrap();
        }
        registry
    }

    fn calls(&self, stage: StageId) -> u32 {
        self.stages[&stage].calls()
    }
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_attempts_per_state: 3,
        backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
        ..OrchestratorSettings::default()
    }
}

fn orchestrator(
    harness: &Harness,
    manifests: Arc<dyn ManifestStore>,
    ledger: Arc<CostLedger>,
    settings: OrchestratorSettings,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        harness.registry(),
        manifests,
        Arc::new(RateLimiter::default()),
        ledger,
        settings,
    )
}

fn unlimited_ledger() -> Arc<CostLedger> {
    Arc::new(CostLedger::new(
        Arc::new(InMemoryLedger::new()),
        Budgets::default(),
    ))
}

fn named(run_id: &str) -> RunOptions {
    RunOptions {
        run_id: Some(run_id.to_string()),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn test_write_fails_twice_then_succeeds() {
    let write = ScriptedStage::new(StageId::Write, |call, _| {
        if call <= 2 {
            Err(OrchestratorError::stage_failed("WRITE", format!("draft {} rejected", call)))
        } else {
            Ok(StageOutput::new(serde_json::json!({ "words": 1200 })))
        }
    });
    let harness = Harness::new(vec![write]);
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        unlimited_ledger(),
        fast_settings(),
    );

    let result = orch.start("T1", named("run-a")).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    let manifest = result.manifest;
    assert_eq!(manifest.errors_for("WRITE").count(), 2);
    assert_eq!(manifest.steps.iter().filter(|s| *s == "WRITE").count(), 1);
    assert_eq!(manifest.attempts, 0);
    assert_eq!(manifest.outputs["WRITE"]["words"], 1200);
    assert_eq!(harness.calls(StageId::Write), 3);
    assert_eq!(harness.calls(StageId::Polish), 1);
}

#[tokio::test]
async fn test_quality_gate_retries_until_score_passes() {
    let qa = ScriptedStage::new(StageId::QaHtml, |call, _| {
        let score = if call == 1 { 85.0 } else { 92.0 };
        Ok(StageOutput::new(serde_json::json!({})).with_score(score))
    });
    let harness = Harness::new(vec![qa]);
    let mut settings = fast_settings();
    settings
        .gates
        .insert(StageId::QaHtml, QualityGate::new("html_qa", 90.0));
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        unlimited_ledger(),
        settings,
    );

    let result = orch.start("T1", named("run-b")).await.unwrap();

    assert!(result.is_final());
    assert_eq!(result.manifest.current_state, "DONE");
    assert_eq!(result.manifest.steps.last().map(String::as_str), Some("QA_HTML"));
    assert_eq!(result.manifest.qa["html_qa"], 92.0);
    assert_eq!(result.manifest.errors_for("QA_HTML").count(), 1);
    assert_eq!(harness.calls(StageId::QaHtml), 2);
}

#[tokio::test]
async fn test_missing_score_never_passes_gate() {
    let harness = Harness::new(vec![]);
    let mut settings = fast_settings();
    settings.max_attempts_per_state = 2;
    settings
        .gates
        .insert(StageId::QaFact, QualityGate::new("fact_qa", 70.0));
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        unlimited_ledger(),
        settings,
    );

    let result = orch.start("T1", named("run-gate")).await.unwrap();

    assert_eq!(
        result.outcome,
        RunOutcome::Aborted {
            stage: StageId::QaFact,
            error: OrchestratorError::MaxAttemptsExceeded {
                stage: "QA_FACT".to_string(),
                attempts: 2
            }
            .to_string(),
        }
    );
    assert!(!result.manifest.qa.contains_key("fact_qa"));
}

#[tokio::test]
async fn test_fatal_error_aborts_without_retry() {
    let plan = ScriptedStage::new(StageId::Plan, |_, _| {
        Err(OrchestratorError::fatal("PLAN", "topic is empty"))
    });
    let harness = Harness::new(vec![plan]);
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        unlimited_ledger(),
        fast_settings(),
    );

    let result = orch.start("", named("run-fatal")).await.unwrap();

    assert!(matches!(result.outcome, RunOutcome::Aborted { stage: StageId::Plan, .. }));
    assert!(result.error().unwrap().contains("topic is empty"));
    assert!(result.manifest.aborted);
    assert!(!result.manifest.is_final);
    assert_eq!(harness.calls(StageId::Plan), 1);
    assert_eq!(harness.calls(StageId::Research), 0);
}

#[tokio::test]
async fn test_resume_skips_completed_stages() {
    let dir = tempfile::tempdir().unwrap();
    let manifests: Arc<dyn ManifestStore> =
        Arc::new(JsonFileManifestStore::new(dir.path()).unwrap());

    // First process: FORMAT keeps failing until the attempt ceiling
    let format = ScriptedStage::new(StageId::Format, |_, _| {
        Err(OrchestratorError::stage_failed("FORMAT", "renderer crashed"))
    });
    let first = Harness::new(vec![format]);
    let mut settings = fast_settings();
    settings.max_attempts_per_state = 2;
    let result = orchestrator(&first, manifests.clone(), unlimited_ledger(), settings)
        .start("Kites", named("run-r"))
        .await
        .unwrap();
    assert!(matches!(result.outcome, RunOutcome::Aborted { stage: StageId::Format, .. }));
    assert_eq!(result.manifest.steps.len(), 5);

    // Second process: everything works
    let second = Harness::new(vec![]);
    let manifests: Arc<dyn ManifestStore> =
        Arc::new(JsonFileManifestStore::new(dir.path()).unwrap());
    let result = orchestrator(&second, manifests.clone(), unlimited_ledger(), fast_settings())
        .resume("run-r")
        .await
        .unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    for stage in [StageId::Plan, StageId::Research, StageId::Write, StageId::Polish, StageId::Illustrate] {
        assert_eq!(second.calls(stage), 0, "{} re-executed", stage);
    }
    for stage in [StageId::Format, StageId::QaFact, StageId::Affiliate, StageId::QaHtml] {
        assert_eq!(second.calls(stage), 1);
    }

    let stored = manifests.load("run-r").await.unwrap().unwrap();
    assert!(stored.is_final);
    assert!(!stored.aborted);
    assert_eq!(stored.steps.len(), 9);
    assert_eq!(stored.errors_for("FORMAT").count(), 2);
    // Earlier outputs survive the restart
    assert_eq!(stored.outputs["PLAN"]["by"], "PLAN");
}

#[tokio::test]
async fn test_resume_of_final_run_is_noop() {
    let harness = Harness::new(vec![]);
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        unlimited_ledger(),
        fast_settings(),
    );
    orch.start("T1", named("run-f")).await.unwrap();

    let result = orch.resume("run-f").await.unwrap();
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(harness.calls(StageId::Plan), 1);
}

#[tokio::test]
async fn test_per_run_budget_refusal_aborts_run() {
    let research = ScriptedStage::new(StageId::Research, |_, _| {
        Ok(StageOutput::new(serde_json::json!({})).with_usage(Usage::new("search", 0.6)))
    });
    let write = ScriptedStage::new(StageId::Write, |_, _| {
        Ok(StageOutput::new(serde_json::json!({})).with_usage(Usage::new("llm", 0.6)))
    });
    let harness = Harness::new(vec![research, write]);
    let ledger = Arc::new(CostLedger::new(
        Arc::new(InMemoryLedger::new()),
        Budgets {
            per_run: Some(Usd::from_dollars(1.0)),
            ..Budgets::default()
        },
    ));
    let orch = orchestrator(
        &harness,
        Arc::new(InMemoryManifestStore::new()),
        ledger.clone(),
        fast_settings(),
    );

    let result = orch.start("T1", named("run-c")).await.unwrap();

    assert!(matches!(result.outcome, RunOutcome::Aborted { stage: StageId::Write, .. }));
    assert!(result.error().unwrap().contains("budget exceeded"));
    // Refused calls are not charged
    assert_eq!(ledger.run_spend("run-c").await.unwrap(), Usd::from_dollars(0.6));
    assert_eq!(harness.calls(StageId::Write), 1);
}

#[tokio::test]
async fn test_daily_budget_refuses_second_call() {
    let ledger = CostLedger::new(
        Arc::new(InMemoryLedger::new()),
        Budgets {
            daily: Some(Usd::from_dollars(5.0)),
            ..Budgets::default()
        },
    );
    ledger.init().await.unwrap();

    let first = ledger
        .record_cost("llm", Usd::from_dollars(3.0), None)
        .await
        .unwrap();
    let second = ledger
        .record_cost("llm", Usd::from_dollars(3.0), None)
        .await
        .unwrap();

    assert!(first.is_accepted());
    assert!(!second.is_accepted());
    assert_eq!(ledger.status().await.daily, Usd::from_dollars(3.0));
}

#[tokio::test]
async fn test_throttled_stage_is_retried_and_trips_breaker() {
    let illustrate = Arc::new(ScriptedStage {
        stage: StageId::Illustrate,
        service: Some("images".to_string()),
        calls: AtomicU32::new(0),
        script: Box::new(|call, _| {
            if call == 1 {
                Err(OrchestratorError::RateLimited {
                    service: "images".to_string(),
                    retry_after: Duration::from_millis(1),
                })
            } else {
                Ok(StageOutput::new(serde_json::json!({ "images": 4 })))
            }
        }),
    });
    let harness = Harness::new(vec![illustrate]);
    let limiter = Arc::new(RateLimiter::default());
    limiter.configure(
        "images",
        &ServiceLimits {
            windows: vec![WindowLimit::per_minute(100)],
            throttle_threshold: 5,
            cooldown: Duration::from_secs(60),
        },
    );
    let orch = PipelineOrchestrator::new(
        harness.registry(),
        Arc::new(InMemoryManifestStore::new()),
        limiter.clone(),
        unlimited_ledger(),
        fast_settings(),
    );

    let result = orch.start("T1", named("run-t")).await.unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(harness.calls(StageId::Illustrate), 2);
    let status = limiter.status("images").unwrap();
    assert_eq!(status.windows[0].consumed, 2);
    assert_eq!(status.paused_for_ms, None);
}

#[tokio::test]
async fn test_same_run_cannot_be_driven_twice() {
    let harness = Harness::new(vec![]);
    let mut registry = harness.registry();
    registry.register(Arc::new(SlowStage)).unwrap();

    let orch = Arc::new(PipelineOrchestrator::new(
        registry,
        Arc::new(InMemoryManifestStore::new()),
        Arc::new(RateLimiter::default()),
        unlimited_ledger(),
        fast_settings(),
    ));

    let driver = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.start("T1", named("run-x")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = orch.resume("run-x").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunActive(_)));

    let result = driver.await.unwrap().unwrap();
    assert_eq!(result.outcome, RunOutcome::Completed);
    // Ownership is released once the driver returns
    assert!(orch.resume("run-x").await.is_ok());
}

struct SlowStage;

#[async_trait]
impl StageHandler for SlowStage {
    fn stage_id(&self) -> StageId {
        StageId::Research
    }

    async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(StageOutput::default())
    }
}

#[tokio::test]
async fn test_stage_timeout_is_retryable() {
    let harness = Harness::new(vec![]);
    let mut registry = harness.registry();
    registry.register(Arc::new(SlowStage)).unwrap();

    let settings = OrchestratorSettings {
        stage_timeout: Duration::from_millis(20),
        max_attempts_per_state: 2,
        ..fast_settings()
    };
    let orch = PipelineOrchestrator::new(
        registry,
        Arc::new(InMemoryManifestStore::new()),
        Arc::new(RateLimiter::default()),
        unlimited_ledger(),
        settings,
    );

    let result = orch.start("T1", named("run-slow")).await.unwrap();

    assert!(matches!(result.outcome, RunOutcome::Aborted { stage: StageId::Research, .. }));
    let errors: Vec<_> = result.manifest.errors_for("RESEARCH").collect();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].error.contains("Timeout"));
}
