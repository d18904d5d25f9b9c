/*
 * Bookforge Orchestration - Resumable Content Pipeline Engine
 *
 * Drives a topic through a fixed sequence of stages
 * (PLAN -> RESEARCH -> WRITE -> POLISH -> ILLUSTRATE -> FORMAT ->
 * QA_FACT -> AFFILIATE -> QA_HTML -> DONE), persisting a manifest after
 * every transition so any interrupted run can be resumed.
 *
 * Architecture:
 * - Run State Machine (manifest-backed, resumable)
 * - Durable Job Queue (lease / ack / nack / stall reclaim / dead letters)
 * - Worker Pool (weighted per-queue concurrency, optional autoscaling)
 * - Rate Limiter (multi-window admission, throttle circuit breaker)
 * - Cost Ledger (daily / monthly / per-run budgets)
 * - Health Monitor (periodic checks, throttled alerts)
 */

// Public modules
pub mod autoscale;
pub mod backoff;
pub mod config;
pub mod cost;
pub mod error;
pub mod health;
pub mod manifest;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod stage;
pub mod stages;
pub mod worker;

// Re-exports
pub use autoscale::{AutoScaler, AutoscaleSettings, Resize};
pub use backoff::BackoffPolicy;
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use cost::{
    BudgetBucket, BudgetExceeded, Budgets, CostDecision, CostLedger, CostStatus, ExportFormat, Usd,
};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use health::{
    AlertSink, HealthCheck, HealthMonitor, HealthReport, HealthStatus, HealthThresholds,
    ResourceProbe, SystemProbe, TracingAlertSink,
};
pub use manifest::RunStateMachine;
#[cfg(feature = "metrics")]
pub use metrics::EngineMetrics;
pub use orchestrator::{
    Dispatch, OrchestratorSettings, PipelineOrchestrator, RunOptions, RunOutcome, RunResult,
};
pub use pipeline::{QualityGate, StageContext, StageHandler, StageOutput, StageRegistry, Usage};
pub use queue::{EnqueueOptions, JobQueue, Nack, QueueSettings};
pub use rate_limit::{
    Admission, DenyReason, RateLimiter, ServiceLimits, ServiceStatus, WindowLimit, WindowStatus,
};
pub use stage::StageId;
pub use stages::{registry_from_commands, CommandStage, StageJob, StageJobHandler};
pub use worker::{
    allocate_shares, JobHandler, JobOutcome, PoolSettings, ShutdownReport, SlotStats, WorkerPool,
};
