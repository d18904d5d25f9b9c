//! Integration tests for the worker pool and queued stage dispatch

use async_trait::async_trait;
use bookforge_orchestration::{
    BackoffPolicy, Budgets, CostLedger, Dispatch, EnqueueOptions, JobHandler, JobOutcome, JobQueue,
    OrchestratorError, OrchestratorSettings, PipelineOrchestrator, PoolSettings, QualityGate,
    QueueSettings, RateLimiter, Result, RunOptions, RunOutcome, ServiceLimits, StageContext,
    StageHandler, StageId, StageJobHandler, StageOutput, StageRegistry, Usage, Usd, WindowLimit,
    WorkerPool,
};
use bookforge_storage::{
    InMemoryLedger, InMemoryManifestStore, InMemoryQueue, JobRecord, JobStatus, LedgerBackend,
};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn queue() -> Arc<JobQueue> {
    Arc::new(JobQueue::new(
        Arc::new(InMemoryQueue::new()),
        QueueSettings {
            retry: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            ..QueueSettings::default()
        },
    ))
}

fn pool_settings(queue: &str, total: usize) -> PoolSettings {
    let mut shares = BTreeMap::new();
    shares.insert(queue.to_string(), 1);
    PoolSettings {
        total_concurrency: total,
        shares,
        idle_poll: Duration::from_millis(5),
        job_timeout: Duration::from_secs(5),
        drain_timeout: Duration::from_secs(1),
    }
}

fn ledger(budgets: Budgets) -> Arc<CostLedger> {
    Arc::new(CostLedger::new(Arc::new(InMemoryLedger::new()), budgets))
}

/// Poll `check` until it holds or two seconds pass
async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn status_of(queue: &JobQueue, id: uuid::Uuid) -> JobStatus {
    queue.get(id).await.unwrap().unwrap().status
}

/// Test job handler
struct TestHandler {
    service: Option<String>,
    delay: Duration,
    fail: bool,
    usage: Vec<Usage>,
    calls: AtomicU32,
}

impl TestHandler {
    fn new() -> Self {
        Self {
            service: None,
            delay: Duration::ZERO,
            fail: false,
            usage: Vec::new(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for TestHandler {
    fn service(&self, _job: &JobRecord) -> Option<String> {
        self.service.clone()
    }

    fn run_id(&self, job: &JobRecord) -> Option<String> {
        job.data["run_id"].as_str().map(str::to_string)
    }

    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(OrchestratorError::stage_failed("job", "handler failed"));
        }
        Ok(JobOutcome {
            result: Some(serde_json::json!({ "echo": job.data })),
            usage: self.usage.clone(),
        })
    }
}

fn start_pool(
    queue: &Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<CostLedger>,
    handler: Arc<dyn JobHandler>,
    total: usize,
) -> Arc<WorkerPool> {
    let mut pool = WorkerPool::new(queue.clone(), limiter, ledger, pool_settings("work", total));
    pool.register_handler("work", handler);
    let pool = Arc::new(pool);
    pool.start().unwrap();
    pool
}

#[tokio::test]
async fn test_jobs_are_acked_and_costs_recorded() {
    let queue = queue();
    let costs = ledger(Budgets::default());
    let handler = Arc::new(TestHandler {
        usage: vec![Usage::new("llm", 0.5)],
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), costs.clone(), handler.clone(), 2);

    let a = queue.enqueue("work", serde_json::json!({ "run_id": "r1" }), 0).await.unwrap();
    let b = queue.enqueue("work", serde_json::json!({ "run_id": "r1" }), 0).await.unwrap();

    assert!(wait_until(|| async {
        status_of(&queue, a).await == JobStatus::Completed
            && status_of(&queue, b).await == JobStatus::Completed
    })
    .await);

    let job = queue.get(a).await.unwrap().unwrap();
    assert_eq!(job.result.unwrap()["echo"]["run_id"], "r1");
    assert_eq!(costs.run_spend("r1").await.unwrap(), Usd::from_dollars(1.0));

    let report = pool.shutdown(Duration::from_secs(1)).await;
    assert!(report.drained);
}

#[tokio::test]
async fn test_rate_limited_job_is_deferred_without_attempt() {
    let queue = queue();
    let limiter = Arc::new(RateLimiter::new(HashMap::from([(
        "images".to_string(),
        ServiceLimits::new(vec![WindowLimit::per_minute(1)]),
    )])));
    let handler = Arc::new(TestHandler {
        service: Some("images".to_string()),
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, limiter, ledger(Budgets::default()), handler.clone(), 1);

    let first = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    let second = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();

    assert!(wait_until(|| async { status_of(&queue, first).await == JobStatus::Completed }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deferred = queue.get(second).await.unwrap().unwrap();
    assert_eq!(deferred.status, JobStatus::Waiting);
    assert_eq!(deferred.attempts, 0);
    assert!(deferred.available_at > chrono::Utc::now());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failing_job_dead_lettered_then_replayed() {
    let queue = queue();
    let handler = Arc::new(TestHandler {
        fail: true,
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), ledger(Budgets::default()), handler.clone(), 1);

    let id = queue
        .enqueue_with(
            "work",
            serde_json::json!({}),
            EnqueueOptions {
                max_attempts: Some(2),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(wait_until(|| async { status_of(&queue, id).await == JobStatus::Dead }).await);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.dead_letters("work").await.unwrap().len(), 1);

    pool.shutdown(Duration::from_secs(1)).await;

    let replayed = queue.replay(id).await.unwrap();
    assert_eq!(replayed.status, JobStatus::Waiting);
    assert_eq!(replayed.attempts, 0);
}

#[tokio::test]
async fn test_exhausted_budget_fails_job() {
    let queue = queue();
    let costs = ledger(Budgets {
        per_run: Some(Usd::from_dollars(1.0)),
        ..Budgets::default()
    });
    costs
        .record_cost("llm", Usd::from_dollars(1.0), Some("r9"))
        .await
        .unwrap();
    let handler = Arc::new(TestHandler::new());
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), costs, handler.clone(), 1);

    let id = queue.enqueue("work", serde_json::json!({ "run_id": "r9" }), 0).await.unwrap();

    assert!(wait_until(|| async { status_of(&queue, id).await == JobStatus::Failed }).await);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_paused_pool_leases_nothing() {
    let queue = queue();
    let handler = Arc::new(TestHandler::new());
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), ledger(Budgets::default()), handler.clone(), 2);
    pool.pause();
    assert!(pool.is_paused());

    let id = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(status_of(&queue, id).await, JobStatus::Waiting);

    pool.resume();
    assert!(wait_until(|| async { status_of(&queue, id).await == JobStatus::Completed }).await);

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_drains_active_jobs() {
    let queue = queue();
    let handler = Arc::new(TestHandler {
        delay: Duration::from_millis(100),
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), ledger(Budgets::default()), handler, 1);

    let id = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    assert!(wait_until(|| async { pool.active_jobs() == 1 }).await);

    let report = pool.shutdown(Duration::from_secs(2)).await;
    assert!(report.drained);
    assert_eq!(status_of(&queue, id).await, JobStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_timeout_abandons_lease() {
    let queue = queue();
    let handler = Arc::new(TestHandler {
        delay: Duration::from_secs(30),
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), ledger(Budgets::default()), handler, 1);

    let id = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    assert!(wait_until(|| async { pool.active_jobs() == 1 }).await);

    let report = pool.shutdown(Duration::from_millis(50)).await;
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);
    // Neither acked nor nacked: the lease expiry hands it back
    assert_eq!(status_of(&queue, id).await, JobStatus::Active);
}

#[tokio::test]
async fn test_long_job_keeps_its_lease() {
    let queue = Arc::new(JobQueue::new(
        Arc::new(InMemoryQueue::new()),
        QueueSettings {
            lease: Duration::from_millis(300),
            reap_interval: Duration::from_millis(50),
            ..QueueSettings::default()
        },
    ));
    queue.init().await.unwrap();

    // Runs for several lease lengths; the reaper must not hand it to a second worker
    let handler = Arc::new(TestHandler {
        delay: Duration::from_secs(1),
        ..TestHandler::new()
    });
    let pool = start_pool(&queue, Arc::new(RateLimiter::default()), ledger(Budgets::default()), handler.clone(), 2);

    let id = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    assert!(wait_until(|| async { status_of(&queue, id).await == JobStatus::Completed }).await);

    let job = queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.stalls, 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    pool.shutdown(Duration::from_secs(1)).await;
    queue.shutdown().await;
}

/// Panics on jobs marked `"panic": true`
struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome> {
        if job.data["panic"] == true {
            panic!("handler blew up");
        }
        Ok(JobOutcome::default())
    }
}

#[tokio::test]
async fn test_panicking_handler_releases_its_slot() {
    let queue = queue();
    let pool = start_pool(
        &queue,
        Arc::new(RateLimiter::default()),
        ledger(Budgets::default()),
        Arc::new(PanickingHandler),
        1,
    );

    let bad = queue
        .enqueue_with(
            "work",
            serde_json::json!({ "panic": true }),
            EnqueueOptions {
                max_attempts: Some(1),
                ..EnqueueOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(wait_until(|| async { status_of(&queue, bad).await == JobStatus::Dead }).await);
    let dead = queue.get(bad).await.unwrap().unwrap();
    assert!(dead.last_error.unwrap().contains("handler blew up"));

    // The only permit came back, so the next job still runs
    let good = queue.enqueue("work", serde_json::json!({}), 0).await.unwrap();
    assert!(wait_until(|| async { status_of(&queue, good).await == JobStatus::Completed }).await);

    assert!(wait_until(|| async { pool.active_jobs() == 0 }).await);
    assert!(pool.slot_stats().iter().all(|slot| slot.active == 0));

    let report = pool.shutdown(Duration::from_secs(1)).await;
    assert!(report.drained);
}

// ═══════════════════════════════════════════════════════════════════════════
// Queued stage dispatch
// ═══════════════════════════════════════════════════════════════════════════

struct MeteredStage(StageId);

#[async_trait]
impl StageHandler for MeteredStage {
    fn stage_id(&self) -> StageId {
        self.0
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let mut output = StageOutput::new(serde_json::json!({ "attempt": ctx.attempt }))
            .with_usage(Usage::new("llm", 0.1));
        if self.0 == StageId::QaHtml {
            output = output.with_score(95.0);
        }
        Ok(output)
    }
}

#[tokio::test]
async fn test_queued_dispatch_runs_pipeline_through_workers() {
    let queue = queue();
    let limiter = Arc::new(RateLimiter::default());
    let costs = ledger(Budgets::default());

    let mut registry = StageRegistry::new();
    for stage in StageId::PIPELINE {
        registry.register(Arc::new(MeteredStage(stage))).unwrap();
    }

    let mut pool = WorkerPool::new(
        queue.clone(),
        limiter.clone(),
        costs.clone(),
        pool_settings("stages", 2),
    );
    pool.register_handler("stages", Arc::new(StageJobHandler::new(registry)));
    let pool = Arc::new(pool);
    pool.start().unwrap();

    let mut settings = OrchestratorSettings {
        dispatch: Dispatch::Queued {
            queue: "stages".to_string(),
            poll_interval: Duration::from_millis(5),
        },
        ..OrchestratorSettings::default()
    };
    settings
        .gates
        .insert(StageId::QaHtml, QualityGate::new("html_qa", 90.0));

    // Executors live with the workers; the orchestrator holds none
    let orch = PipelineOrchestrator::new(
        StageRegistry::new(),
        Arc::new(InMemoryManifestStore::new()),
        limiter,
        costs.clone(),
        settings,
    )
    .with_queue(queue.clone());

    let result = orch
        .start(
            "Kites",
            RunOptions {
                run_id: Some("run-q".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(result.manifest.steps.len(), 9);
    assert_eq!(result.manifest.qa["html_qa"], 95.0);
    assert_eq!(result.manifest.outputs["PLAN"]["attempt"], 1);

    let counts = queue.counts("stages").await.unwrap();
    assert_eq!(counts.completed, 9);
    // Usage is charged once, by the worker
    assert_eq!(costs.run_spend("run-q").await.unwrap(), Usd::from_micros(900_000));

    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_queued_dispatch_without_queue_is_rejected() {
    let orch = PipelineOrchestrator::new(
        StageRegistry::new(),
        Arc::new(InMemoryManifestStore::new()),
        Arc::new(RateLimiter::default()),
        ledger(Budgets::default()),
        OrchestratorSettings {
            dispatch: Dispatch::Queued {
                queue: "stages".to_string(),
                poll_interval: Duration::from_millis(5),
            },
            ..OrchestratorSettings::default()
        },
    );

    let err = orch.start("Kites", RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Config(_)));
}

/// PLAN outlasts the orchestrator's stage timeout; every stage charges $0.10
struct SlowPlanStage {
    stage: StageId,
    executions: Arc<AtomicU32>,
}

#[async_trait]
impl StageHandler for SlowPlanStage {
    fn stage_id(&self) -> StageId {
        self.stage
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        if self.stage == StageId::Plan {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(StageOutput::new(serde_json::json!({ "attempt": ctx.attempt }))
            .with_usage(Usage::new("llm", 0.1)))
    }
}

#[tokio::test]
async fn test_timed_out_stage_job_is_not_run_twice() {
    let queue = queue();
    let limiter = Arc::new(RateLimiter::default());
    let entries = Arc::new(InMemoryLedger::new());
    let costs = Arc::new(CostLedger::new(entries.clone(), Budgets::default()));

    let executions = Arc::new(AtomicU32::new(0));
    let mut registry = StageRegistry::new();
    for stage in StageId::PIPELINE {
        registry
            .register(Arc::new(SlowPlanStage {
                stage,
                executions: executions.clone(),
            }))
            .unwrap();
    }

    let mut pool = WorkerPool::new(
        queue.clone(),
        limiter.clone(),
        costs.clone(),
        pool_settings("stages", 2),
    );
    pool.register_handler("stages", Arc::new(StageJobHandler::new(registry)));
    let pool = Arc::new(pool);
    pool.start().unwrap();

    let orch = PipelineOrchestrator::new(
        StageRegistry::new(),
        Arc::new(InMemoryManifestStore::new()),
        limiter,
        costs.clone(),
        OrchestratorSettings {
            max_attempts_per_state: 10,
            backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
            stage_timeout: Duration::from_millis(100),
            dispatch: Dispatch::Queued {
                queue: "stages".to_string(),
                poll_interval: Duration::from_millis(5),
            },
            ..OrchestratorSettings::default()
        },
    )
    .with_queue(queue.clone());

    let result = orch
        .start(
            "Kites",
            RunOptions {
                run_id: Some("run-t".to_string()),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.outcome, RunOutcome::Completed);
    // PLAN timed out at least once on the orchestrator side
    assert!(result
        .manifest
        .errors
        .iter()
        .any(|e| e.state == "PLAN" && e.error.contains("not finished within")));

    // One execution, one job and one charge per stage
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let counts = queue.counts("stages").await.unwrap();
    assert_eq!(counts.completed, 9);
    assert_eq!(counts.waiting + counts.active, 0);
    assert_eq!(entries.entries_for_run("run-t").await.unwrap().len(), 9);
    assert_eq!(costs.run_spend("run-t").await.unwrap(), Usd::from_micros(900_000));

    pool.shutdown(Duration::from_secs(1)).await;
}
