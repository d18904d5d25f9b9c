//! Worker pool
//!
//! Concurrency is split across queues by weight. Each queue gets a slot: a
//! semaphore sized to its share plus a dispatcher task that leases one job
//! per permit and runs it on the pool's task tracker.
//!
//! Per job: rate-limit admission (deny → deferred, no attempt counted),
//! budget headroom (exhausted → failed), handler under timeout, cost
//! recording, then ack or nack. While the handler runs its lease is renewed
//! every third of the lease length; a job whose lease was lost is dropped
//! without ack. A panicking handler counts as a failed attempt.

use crate::cost::{CostDecision, CostLedger};
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::pipeline::Usage;
use crate::queue::{JobQueue, Nack};
use crate::rate_limit::{Admission, RateLimiter};
use async_trait::async_trait;
use bookforge_storage::{ErrorKind, JobRecord};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a handler produced for one job
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    /// Stored with the ack
    pub result: Option<serde_json::Value>,
    /// Metered calls made while handling the job
    pub usage: Vec<Usage>,
}

/// Per-queue job handler
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Metered service the job will call; checked against the rate limiter
    fn service(&self, _job: &JobRecord) -> Option<String> {
        None
    }

    /// Run the job belongs to, for per-run budgets
    fn run_id(&self, _job: &JobRecord) -> Option<String> {
        None
    }

    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub total_concurrency: usize,
    /// Queue name -> weight
    pub shares: BTreeMap<String, u32>,
    /// Sleep after finding a queue empty
    pub idle_poll: Duration,
    pub job_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let mut shares = BTreeMap::new();
        shares.insert("stages".to_string(), 1);
        Self {
            total_concurrency: num_cpus::get(),
            shares,
            idle_poll: Duration::from_millis(250),
            job_timeout: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Split `total` workers across queues proportionally to their weights.
///
/// Uses largest remainders (ties go to the queue that sorts first) and
/// gives every queue at least one worker.
pub fn allocate_shares(total: usize, shares: &BTreeMap<String, u32>) -> BTreeMap<String, usize> {
    let weight_sum: u64 = shares.values().map(|w| u64::from(*w)).sum();
    if weight_sum == 0 {
        return shares.keys().map(|q| (q.clone(), 1)).collect();
    }

    let mut allocation = BTreeMap::new();
    let mut remainders = Vec::with_capacity(shares.len());
    let mut assigned = 0usize;
    for (queue, weight) in shares {
        let numerator = total as u64 * u64::from(*weight);
        let base = (numerator / weight_sum) as usize;
        assigned += base;
        allocation.insert(queue.clone(), base);
        remainders.push((numerator % weight_sum, queue));
    }

    // Stable sort keeps name order among equal remainders
    remainders.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, queue) in remainders.into_iter().take(total.saturating_sub(assigned)) {
        if let Some(count) = allocation.get_mut(queue) {
            *count += 1;
        }
    }

    for count in allocation.values_mut() {
        *count = (*count).max(1);
    }
    allocation
}

/// Concurrency budget of one queue
#[derive(Debug)]
struct WorkerSlot {
    queue: String,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    active: AtomicUsize,
}

/// One running job's claim on its slot: the permit and the active count are
/// both released on drop, including when the job task unwinds
struct ActiveJob {
    slot: Arc<WorkerSlot>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveJob {
    fn start(slot: Arc<WorkerSlot>, permit: OwnedSemaphorePermit) -> Self {
        slot.active.fetch_add(1, Ordering::AcqRel);
        Self {
            slot,
            _permit: permit,
        }
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStats {
    pub queue: String,
    pub capacity: usize,
    pub active: usize,
}

impl SlotStats {
    /// active / capacity
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.active as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight job finished within the drain timeout
    pub drained: bool,
    /// Jobs stopped without ack; their leases will expire and be reclaimed
    pub abandoned: usize,
}

pub struct WorkerPool {
    id: String,
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<CostLedger>,
    settings: PoolSettings,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    slots: BTreeMap<String, Arc<WorkerSlot>>,
    paused: watch::Sender<bool>,
    /// Stops the dispatchers
    cancel: CancellationToken,
    /// Stops in-flight jobs once the drain timeout is exceeded
    force: CancellationToken,
    tracker: TaskTracker,
    dispatchers: Mutex<Vec<(String, JoinHandle<()>)>>,
    lease_seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<CostLedger>,
        settings: PoolSettings,
    ) -> Self {
        let slots = allocate_shares(settings.total_concurrency, &settings.shares)
            .into_iter()
            .map(|(name, capacity)| {
                let slot = WorkerSlot {
                    queue: name.clone(),
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    capacity: AtomicUsize::new(capacity),
                    active: AtomicUsize::new(0),
                };
                (name, Arc::new(slot))
            })
            .collect();

        let (paused, _) = watch::channel(false);
        let id = Uuid::new_v4().simple().to_string();

        Self {
            id: format!("pool-{}", &id[..8]),
            queue,
            limiter,
            ledger,
            settings,
            handlers: HashMap::new(),
            slots,
            paused,
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
            dispatchers: Mutex::new(Vec::new()),
            lease_seq: AtomicU64::new(0),
        }
    }

    /// Register the handler for a queue
    pub fn register_handler(&mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn one dispatcher per queue
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(missing) = self.slots.keys().find(|q| !self.handlers.contains_key(*q)) {
            return Err(OrchestratorError::config(format!(
                "queue '{}' has workers but no handler",
                missing
            )));
        }

        let mut dispatchers = self.dispatchers.lock();
        if !dispatchers.is_empty() {
            return Err(OrchestratorError::config("worker pool already started"));
        }

        for slot in self.slots.values() {
            let pool = Arc::clone(self);
            let slot = Arc::clone(slot);
            let name = slot.queue.clone();
            let handle = tokio::spawn(async move { pool.dispatch(slot).await });
            dispatchers.push((name, handle));
        }

        info!(
            pool = %self.id,
            queues = self.slots.len(),
            total = self.settings.total_concurrency,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop leasing new jobs; active jobs keep running
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            info!(pool = %self.id, "Worker pool paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            info!(pool = %self.id, "Worker pool resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Pause, wait up to `drain_timeout` for active jobs, then stop the rest.
    ///
    /// Jobs stopped this way are neither acked nor nacked; their leases
    /// expire and the queue reclaims them.
    pub async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        self.pause();
        self.cancel.cancel();

        let dispatchers: Vec<_> = self.dispatchers.lock().drain(..).collect();
        for (queue, handle) in dispatchers {
            if let Err(e) = handle.await {
                warn!(queue = %queue, "Dispatcher ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        let report = match tokio::time::timeout(drain_timeout, self.tracker.wait()).await {
            Ok(()) => ShutdownReport {
                drained: true,
                abandoned: 0,
            },
            Err(_) => {
                let abandoned = self.active_jobs();
                warn!(
                    pool = %self.id,
                    abandoned,
                    "Drain timeout exceeded, stopping in-flight jobs"
                );
                self.force.cancel();
                self.tracker.wait().await;
                ShutdownReport {
                    drained: false,
                    abandoned,
                }
            }
        };

        info!(pool = %self.id, drained = report.drained, "Worker pool stopped");
        report
    }

    pub fn slot_stats(&self) -> Vec<SlotStats> {
        self.slots
            .values()
            .map(|slot| SlotStats {
                queue: slot.queue.clone(),
                capacity: slot.capacity.load(Ordering::Acquire),
                active: slot.active.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn active_jobs(&self) -> usize {
        self.slots
            .values()
            .map(|slot| slot.active.load(Ordering::Acquire))
            .sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.slots
            .values()
            .map(|slot| slot.capacity.load(Ordering::Acquire))
            .sum()
    }

    /// (running dispatchers, started dispatchers)
    pub fn liveness(&self) -> (usize, usize) {
        let dispatchers = self.dispatchers.lock();
        let alive = dispatchers
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count();
        (alive, dispatchers.len())
    }

    /// Change the concurrency of one queue
    pub fn resize(&self, queue: &str, capacity: usize) -> Result<()> {
        let slot = self
            .slots
            .get(queue)
            .ok_or_else(|| OrchestratorError::config(format!("no workers for queue '{}'", queue)))?;
        let capacity = capacity.max(1);
        let previous = slot.capacity.swap(capacity, Ordering::AcqRel);

        if capacity > previous {
            slot.semaphore.add_permits(capacity - previous);
        } else if capacity < previous {
            // Retire permits as running jobs hand them back
            let shrink = (previous - capacity) as u32;
            let semaphore = Arc::clone(&slot.semaphore);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    permits = semaphore.acquire_many_owned(shrink) => {
                        if let Ok(permits) = permits {
                            permits.forget();
                        }
                    }
                }
            });
        }

        info!(queue, from = previous, to = capacity, "Worker slot resized");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    async fn dispatch(self: Arc<Self>, slot: Arc<WorkerSlot>) {
        let mut paused = self.paused.subscribe();
        debug!(queue = %slot.queue, "Dispatcher started");

        loop {
            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&slot.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Pausing while waiting for a permit must not lease another job
            if *paused.borrow() || self.cancel.is_cancelled() {
                drop(permit);
                continue;
            }

            let worker = format!(
                "{}:{}:{}",
                self.id,
                slot.queue,
                self.lease_seq.fetch_add(1, Ordering::Relaxed)
            );

            match self.queue.lease(&slot.queue, &worker).await {
                Ok(Some(job)) => {
                    let claim = ActiveJob::start(Arc::clone(&slot), permit);
                    let pool = Arc::clone(&self);
                    self.tracker.spawn(async move {
                        let _claim = claim;
                        pool.process(&job, &worker).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.idle().await;
                }
                Err(e) => {
                    warn!(queue = %slot.queue, "Lease failed: {}", e);
                    drop(permit);
                    self.idle().await;
                }
            }
        }

        debug!(queue = %slot.queue, "Dispatcher stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settings.idle_poll) => {}
        }
    }

    async fn process(&self, job: &JobRecord, worker: &str) {
        let Some(handler) = self.handlers.get(&job.queue).cloned() else {
            self.settle(job, worker, Nack::Fail {
                reason: format!("no handler for queue '{}'", job.queue),
            })
            .await;
            return;
        };

        let service = handler.service(job);
        if let Some(service) = &service {
            if let Admission::Denied { retry_after, reason } = self.limiter.try_admit(service) {
                debug!(job_id = %job.id, service = %service, ?reason, "Rate limited, deferring job");
                self.settle(job, worker, Nack::Defer { wait: retry_after }).await;
                return;
            }
        }

        let run_id = handler.run_id(job);
        if let Err(e) = self.ledger.ensure_headroom(run_id.as_deref()).await {
            self.settle(job, worker, failure_nack(&e)).await;
            return;
        }

        let handled = AssertUnwindSafe(handler.handle(job))
            .catch_unwind()
            .map(|result| {
                result.unwrap_or_else(|panic| {
                    Err(OrchestratorError::stage_failed(
                        &job.queue,
                        format!("handler panicked: {}", panic_message(panic.as_ref())),
                    ))
                })
            });

        let outcome = tokio::select! {
            _ = self.force.cancelled() => {
                warn!(job_id = %job.id, "Job abandoned at shutdown, lease will expire");
                return;
            }
            lost = self.keep_leased(job, worker) => {
                warn!(job_id = %job.id, worker, "Lease lost while running, dropping job: {}", lost);
                return;
            }
            outcome = tokio::time::timeout(self.settings.job_timeout, handled) => outcome,
        };

        let nack = match outcome {
            Ok(Ok(outcome)) => {
                if let Some(service) = &service {
                    self.limiter.record_success(service);
                }
                match self.record_usage(&outcome.usage, run_id.as_deref()).await {
                    Ok(()) => {
                        if let Err(e) = self.queue.ack(job.id, worker, outcome.result).await {
                            warn!(job_id = %job.id, "Ack failed: {}", e);
                        }
                        return;
                    }
                    Err(e) => failure_nack(&e),
                }
            }
            Ok(Err(OrchestratorError::RateLimited {
                service,
                retry_after,
            })) => {
                self.limiter.record_throttle(&service);
                Nack::Defer { wait: retry_after }
            }
            Ok(Err(e)) => failure_nack(&e),
            Err(_) => Nack::Retry {
                reason: format!("timed out after {:?}", self.settings.job_timeout),
            },
        };

        self.settle(job, worker, nack).await;
    }

    /// Renew the lease until the backend says `worker` no longer holds it
    async fn keep_leased(&self, job: &JobRecord, worker: &str) -> OrchestratorError {
        let period = (self.queue.settings().lease / 3).max(Duration::from_millis(10));
        loop {
            tokio::time::sleep(period).await;
            match self.queue.extend_lease(job.id, worker).await {
                Ok(()) => {}
                Err(OrchestratorError::Storage(e))
                    if matches!(e.kind, ErrorKind::JobConflict | ErrorKind::JobNotFound) =>
                {
                    return e.into();
                }
                Err(e) => warn!(job_id = %job.id, "Lease renewal failed: {}", e),
            }
        }
    }

    async fn record_usage(&self, usage: &[Usage], run_id: Option<&str>) -> Result<()> {
        for call in usage {
            match self.ledger.record_cost(&call.service, call.cost(), run_id).await? {
                CostDecision::Accepted => {}
                CostDecision::Refused(refusal) => return Err(refusal.into()),
            }
        }
        Ok(())
    }

    async fn settle(&self, job: &JobRecord, worker: &str, nack: Nack) {
        if let Err(e) = self.queue.nack(job.id, worker, nack).await {
            warn!(job_id = %job.id, "Nack failed: {}", e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

fn failure_nack(err: &OrchestratorError) -> Nack {
    if err.category() == ErrorCategory::Permanent {
        Nack::Fail {
            reason: err.to_string(),
        }
    } else {
        Nack::Retry {
            reason: err.to_string(),
        }
    }
}
