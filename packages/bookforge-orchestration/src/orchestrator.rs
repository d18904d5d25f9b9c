use crate::backoff::BackoffPolicy;
use crate::cost::CostLedger;
use crate::error::{OrchestratorError, Result};
use crate::manifest::RunStateMachine;
use crate::pipeline::{QualityGate, StageContext, StageHandler, StageOutput, StageRegistry};
use crate::queue::JobQueue;
use crate::rate_limit::{Admission, RateLimiter};
use crate::stage::StageId;
use crate::stages::StageJob;
use bookforge_storage::{JobStatus, ManifestStore, RunManifest};
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How stage executors are reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Call the registered handler in-process
    Direct,
    /// Enqueue a stage job and wait for a worker to finish it
    Queued {
        queue: String,
        poll_interval: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Failed attempts of one state before the run aborts
    pub max_attempts_per_state: u32,
    pub backoff: BackoffPolicy,
    /// Per-invocation timeout
    pub stage_timeout: Duration,
    pub gates: HashMap<StageId, QualityGate>,
    pub dispatch: Dispatch,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts_per_state: 3,
            backoff: BackoffPolicy::default(),
            stage_timeout: Duration::from_secs(600),
            gates: HashMap::new(),
            dispatch: Dispatch::Direct,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Generated when absent
    pub run_id: Option<String>,
    /// Overrides the configured ceiling for this invocation
    pub max_attempts_per_state: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every stage succeeded; the manifest is final
    Completed,
    /// The run gave up on `stage`; the manifest stays resumable
    Aborted { stage: StageId, error: String },
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub manifest: RunManifest,
}

impl RunResult {
    pub fn is_final(&self) -> bool {
        self.manifest.is_final
    }

    /// Error that ended an aborted run
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed => None,
            RunOutcome::Aborted { error, .. } => Some(error),
        }
    }
}

/// Removes a run from the active set when the driving call ends
struct RunGuard<'a> {
    active: &'a DashSet<String>,
    run_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Pipeline orchestrator.
///
/// Drives one run at a time per run id through the fixed stage order,
/// persisting the manifest after every transition. Different runs may be
/// driven concurrently from the same orchestrator.
pub struct PipelineOrchestrator {
    registry: StageRegistry,
    manifests: Arc<dyn ManifestStore>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<CostLedger>,
    queue: Option<Arc<JobQueue>>,
    settings: OrchestratorSettings,
    active_runs: DashSet<String>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: StageRegistry,
        manifests: Arc<dyn ManifestStore>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<CostLedger>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            manifests,
            limiter,
            ledger,
            queue: None,
            settings,
            active_runs: DashSet::new(),
        }
    }

    /// Job queue used by queued dispatch
    pub fn with_queue(mut self, queue: Arc<JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Register a stage handler
    pub fn register_handler(&mut self, handler: Arc<dyn StageHandler>) -> Result<()> {
        self.registry.register(handler)
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Fail early when a stage cannot be reached
    pub fn ensure_ready(&self) -> Result<()> {
        match &self.settings.dispatch {
            Dispatch::Direct => self.registry.ensure_complete(),
            Dispatch::Queued { .. } if self.queue.is_none() => Err(OrchestratorError::config(
                "queued dispatch requires a job queue",
            )),
            Dispatch::Queued { .. } => Ok(()),
        }
    }

    /// Start a new run for `topic`
    pub async fn start(&self, topic: &str, options: RunOptions) -> Result<RunResult> {
        self.ensure_ready()?;
        let run_id = options
            .run_id
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4().simple()));
        let _guard = self.claim(&run_id)?;

        if self.manifests.load(&run_id).await?.is_some() {
            return Err(OrchestratorError::InvalidManifest(format!(
                "run {} already exists; resume it instead",
                run_id
            )));
        }

        let sm = RunStateMachine::new(run_id.as_str(), topic);
        self.persist(&sm).await?;
        info!(run_id = %run_id, topic, "Run started");

        self.drive(sm, self.max_attempts(options.max_attempts_per_state))
            .await
    }

    /// Continue a run from the stage after its last completed step
    pub async fn resume(&self, run_id: &str) -> Result<RunResult> {
        self.resume_with(run_id, None).await
    }

    pub async fn resume_with(
        &self,
        run_id: &str,
        max_attempts_per_state: Option<u32>,
    ) -> Result<RunResult> {
        let _guard = self.claim(run_id)?;

        let manifest = self
            .manifests
            .load(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        let was_final = manifest.is_final;
        let mut sm = RunStateMachine::from_manifest(manifest)?;

        if sm.is_final() {
            if !was_final {
                self.persist(&sm).await?;
            }
            info!(run_id, "Run already final, nothing to resume");
            return Ok(RunResult {
                run_id: run_id.to_string(),
                outcome: RunOutcome::Completed,
                manifest: sm.into_manifest(),
            });
        }

        self.ensure_ready()?;
        if sm.reopen() {
            info!(run_id, stage = %sm.current(), "Reopening aborted run");
        }
        self.persist(&sm).await?;
        info!(
            run_id,
            stage = %sm.current(),
            completed = sm.manifest().steps.len(),
            "Run resumed"
        );

        self.drive(sm, self.max_attempts(max_attempts_per_state))
            .await
    }

    pub async fn load(&self, run_id: &str) -> Result<Option<RunManifest>> {
        Ok(self.manifests.load(run_id).await?)
    }

    pub async fn runs(&self) -> Result<Vec<String>> {
        Ok(self.manifests.list_runs().await?)
    }

    fn max_attempts(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.settings.max_attempts_per_state)
            .max(1)
    }

    fn claim(&self, run_id: &str) -> Result<RunGuard<'_>> {
        if !self.active_runs.insert(run_id.to_string()) {
            return Err(OrchestratorError::RunActive(run_id.to_string()));
        }
        Ok(RunGuard {
            active: &self.active_runs,
            run_id: run_id.to_string(),
        })
    }

    async fn persist(&self, sm: &RunStateMachine) -> Result<()> {
        self.manifests.save(sm.manifest()).await?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State loop
    // ═══════════════════════════════════════════════════════════════════════

    async fn drive(&self, mut sm: RunStateMachine, max_attempts: u32) -> Result<RunResult> {
        // Queued job of the current state still held by a worker after a timeout
        let mut inflight: Option<Uuid> = None;

        while !sm.is_final() {
            let stage = sm.current();

            if sm.attempts() >= max_attempts {
                let err = OrchestratorError::MaxAttemptsExceeded {
                    stage: stage.to_string(),
                    attempts: sm.attempts(),
                };
                return self.abort(sm, stage, err).await;
            }

            let ctx = StageContext {
                run_id: sm.run_id().to_string(),
                topic: sm.manifest().topic.clone(),
                stage,
                attempt: sm.attempts() + 1,
                outputs: sm.manifest().outputs.clone(),
            };
            info!(run_id = %ctx.run_id, stage = %stage, attempt = ctx.attempt, "Executing stage");

            let result = match self.invoke(&ctx, &mut inflight).await {
                Ok(output) => self.apply_gate(&mut sm, stage, output),
                Err(e) => Err(e),
            };

            match result {
                Ok(output) => {
                    let next = sm.complete_stage(stage, output.data)?;
                    self.persist(&sm).await?;
                    info!(run_id = %ctx.run_id, stage = %stage, next = %next, "Stage completed");
                }
                Err(err) => {
                    let attempts = sm.record_failure(stage, err.to_string())?;
                    self.persist(&sm).await?;

                    if !err.is_retryable() {
                        error!(run_id = %ctx.run_id, stage = %stage, "Non-retryable failure: {}", err);
                        return self.abort(sm, stage, err).await;
                    }
                    if attempts >= max_attempts {
                        error!(
                            run_id = %ctx.run_id,
                            stage = %stage,
                            attempts,
                            "Attempt ceiling reached: {}",
                            err
                        );
                        let err = OrchestratorError::MaxAttemptsExceeded {
                            stage: stage.to_string(),
                            attempts,
                        };
                        return self.abort(sm, stage, err).await;
                    }

                    let delay = self.settings.backoff.delay(attempts);
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %stage,
                        attempts,
                        category = %err.category(),
                        delay_ms = delay.as_millis() as u64,
                        "Stage failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        info!(run_id = %sm.run_id(), "Run completed");
        Ok(RunResult {
            run_id: sm.run_id().to_string(),
            outcome: RunOutcome::Completed,
            manifest: sm.into_manifest(),
        })
    }

    /// Record the gate score, then accept or reject the output
    fn apply_gate(
        &self,
        sm: &mut RunStateMachine,
        stage: StageId,
        output: StageOutput,
    ) -> Result<StageOutput> {
        let Some(gate) = self.settings.gates.get(&stage) else {
            return Ok(output);
        };
        if let Some(score) = output.score {
            sm.record_qa(gate.name.clone(), score);
        }
        gate.evaluate(stage, output.score)?;
        Ok(output)
    }

    async fn abort(
        &self,
        mut sm: RunStateMachine,
        stage: StageId,
        err: OrchestratorError,
    ) -> Result<RunResult> {
        sm.abort()?;
        self.persist(&sm).await?;
        warn!(run_id = %sm.run_id(), stage = %stage, "Run aborted: {}", err);

        Ok(RunResult {
            run_id: sm.run_id().to_string(),
            outcome: RunOutcome::Aborted {
                stage,
                error: err.to_string(),
            },
            manifest: sm.into_manifest(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage invocation
    // ═══════════════════════════════════════════════════════════════════════

    async fn invoke(&self, ctx: &StageContext, inflight: &mut Option<Uuid>) -> Result<StageOutput> {
        match &self.settings.dispatch {
            Dispatch::Direct => self.invoke_direct(ctx).await,
            Dispatch::Queued {
                queue,
                poll_interval,
            } => {
                self.invoke_queued(ctx, queue, *poll_interval, inflight)
                    .await
            }
        }
    }

    async fn invoke_direct(&self, ctx: &StageContext) -> Result<StageOutput> {
        let handler = self.registry.get(ctx.stage)?;

        if let Some(service) = handler.service() {
            self.admit(service).await;
        }
        self.ledger.ensure_headroom(Some(&ctx.run_id)).await?;

        let timeout = self.settings.stage_timeout;
        let result = match tokio::time::timeout(timeout, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "{} exceeded {:?}",
                ctx.stage, timeout
            ))),
        };

        match &result {
            Ok(_) => {
                if let Some(service) = handler.service() {
                    self.limiter.record_success(service);
                }
            }
            Err(OrchestratorError::RateLimited { service, .. }) => {
                self.limiter.record_throttle(service);
            }
            Err(_) => {}
        }

        let output = result?;
        for usage in &output.usage {
            self.ledger
                .record_cost(&usage.service, usage.cost(), Some(&ctx.run_id))
                .await?
                .into_result()?;
        }
        Ok(output)
    }

    /// Wait for admission; denials carry the time until a slot frees up
    async fn admit(&self, service: &str) {
        loop {
            match self.limiter.try_admit(service) {
                Admission::Admitted => return,
                Admission::Denied {
                    retry_after,
                    reason,
                } => {
                    debug!(service, ?reason, retry_after_ms = retry_after.as_millis() as u64, "Waiting for rate limit");
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Run the stage through the job queue and wait for its result.
    ///
    /// A job that outlives `stage_timeout` is withdrawn if no worker has it
    /// yet; otherwise its id stays in `inflight` and the next attempt waits
    /// on that job instead of enqueueing a second one.
    async fn invoke_queued(
        &self,
        ctx: &StageContext,
        queue_name: &str,
        poll_interval: Duration,
        inflight: &mut Option<Uuid>,
    ) -> Result<StageOutput> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| OrchestratorError::config("queued dispatch requires a job queue"))?;

        let resumable = match inflight.take() {
            Some(id) => queue.get(id).await?.filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Waiting | JobStatus::Active | JobStatus::Completed
                )
            }),
            None => None,
        };

        let job_id = match resumable {
            Some(job) => {
                debug!(run_id = %ctx.run_id, stage = %ctx.stage, job_id = %job.id, status = %job.status, "Waiting on earlier stage job");
                job.id
            }
            None => {
                let payload = serde_json::to_value(StageJob {
                    stage: ctx.stage,
                    context: ctx.clone(),
                })?;
                // Later stages first, so runs already in flight finish before new ones advance
                let job_id = queue
                    .enqueue(queue_name, payload, ctx.stage.ordinal() as i32)
                    .await?;
                debug!(run_id = %ctx.run_id, stage = %ctx.stage, job_id = %job_id, "Stage job enqueued");
                job_id
            }
        };

        let wait = async {
            loop {
                tokio::time::sleep(poll_interval).await;
                let job = queue
                    .get(job_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

                match job.status {
                    JobStatus::Waiting | JobStatus::Active => continue,
                    JobStatus::Completed => {
                        let result = job.result.ok_or_else(|| {
                            OrchestratorError::stage_failed(ctx.stage, "job completed without a result")
                        })?;
                        return Ok(serde_json::from_value::<StageOutput>(result)?);
                    }
                    JobStatus::Failed => {
                        return Err(OrchestratorError::fatal(
                            ctx.stage,
                            job.last_error.unwrap_or_else(|| "job failed".to_string()),
                        ));
                    }
                    JobStatus::Dead => {
                        return Err(OrchestratorError::stage_failed(
                            ctx.stage,
                            format!(
                                "job {} dead-lettered: {}",
                                job_id,
                                job.last_error.unwrap_or_default()
                            ),
                        ));
                    }
                }
            }
        };

        let timeout = self.settings.stage_timeout;
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                if !queue.withdraw(job_id).await? {
                    *inflight = Some(job_id);
                }
                Err(OrchestratorError::Timeout(format!(
                    "{} job {} not finished within {:?}",
                    ctx.stage, job_id, timeout
                )))
            }
        }
    }
}
