//! Durable job queue service
//!
//! Thin policy layer over a `QueueBackend`: lease lengths, retry backoff,
//! dead-lettering and retention live here; atomicity lives in the backend.

use crate::backoff::BackoffPolicy;
use crate::error::{OrchestratorError, Result};
use bookforge_storage::{JobRecord, JobStatus, QueueBackend, QueueCounts, ReclaimOutcome, Release};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    /// How long a lease lasts before the job counts as stalled
    pub lease: Duration,
    /// Stalls tolerated before a job is dead-lettered
    pub stall_ceiling: u32,
    pub default_max_attempts: u32,
    /// Delay before a nacked job is leasable again
    pub retry: BackoffPolicy,
    /// Completed and failed jobs are purged after this long
    pub retention: Duration,
    pub reap_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(15 * 60),
            stall_ceiling: 2,
            default_max_attempts: 3,
            retry: BackoffPolicy::default(),
            retention: Duration::from_secs(7 * 24 * 3_600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Negative acknowledgement of a leased job
#[derive(Debug, Clone, PartialEq)]
pub enum Nack {
    /// Handler failed; retried with backoff until `max_attempts`
    Retry { reason: String },
    /// Not attempted; leasable again after `wait` with no attempt counted
    Defer { wait: Duration },
    /// Non-retryable failure
    Fail { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Defaults to the queue's `default_max_attempts`
    pub max_attempts: Option<u32>,
    pub delay: Option<Duration>,
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3_650))
}

pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    settings: QueueSettings,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, settings: QueueSettings) -> Self {
        Self {
            backend,
            settings,
            cancel: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Verify the backend, reclaim leases left behind by a previous process
    /// and start the background reaper.
    pub async fn init(self: &Arc<Self>) -> Result<ReclaimOutcome> {
        self.backend.ping().await?;
        let reclaimed = self.reclaim_stalled().await?;

        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move { queue.reap_loop().await });
        if let Some(previous) = self.reaper.lock().replace(handle) {
            previous.abort();
        }

        info!(
            requeued = reclaimed.requeued.len(),
            dead_lettered = reclaimed.dead_lettered.len(),
            "Job queue initialized"
        );
        Ok(reclaimed)
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.reaper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Queue reaper ended abnormally: {}", e);
            }
        }
        info!("Job queue stopped");
    }

    async fn reap_loop(&self) {
        let mut interval = tokio::time::interval(self.settings.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.reclaim_stalled().await {
                error!("Stall reclaim failed: {}", e);
            }

            let cutoff = Utc::now() - chrono_duration(self.settings.retention);
            match self.backend.purge_finished(cutoff).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "Purged finished jobs"),
                Err(e) => error!("Retention purge failed: {}", e),
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.backend.ping().await?)
    }

    pub async fn enqueue(&self, queue: &str, payload: serde_json::Value, priority: i32) -> Result<Uuid> {
        self.enqueue_with(
            queue,
            payload,
            EnqueueOptions {
                priority,
                ..EnqueueOptions::default()
            },
        )
        .await
    }

    pub async fn enqueue_with(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.settings.default_max_attempts);
        let mut job = JobRecord::new(queue, payload, options.priority, max_attempts);
        if let Some(delay) = options.delay {
            job.available_at = job.available_at + chrono_duration(delay);
        }

        let job = self.backend.insert(job).await?;
        debug!(job_id = %job.id, queue, priority = job.priority, "Job enqueued");
        Ok(job.id)
    }

    /// Lease the next available job of `queue` to `worker`
    pub async fn lease(&self, queue: &str, worker: &str) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(self.settings.lease);
        let job = self.backend.lease_next(queue, worker, now, lease_until).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, queue, worker, "Job leased");
        }
        Ok(job)
    }

    /// Push the lease of a running job one full lease length past now.
    ///
    /// Fails when `worker` no longer holds the lease.
    pub async fn extend_lease(&self, id: Uuid, worker: &str) -> Result<()> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(self.settings.lease);
        self.backend.extend_lease(id, worker, lease_until, now).await?;
        Ok(())
    }

    /// Remove a job that no worker has picked up yet.
    ///
    /// Returns `false` when the job is already leased or finished.
    pub async fn withdraw(&self, id: Uuid) -> Result<bool> {
        let removed = self.backend.remove_pending(id).await?;
        if removed {
            debug!(job_id = %id, "Job withdrawn");
        }
        Ok(removed)
    }

    pub async fn ack(&self, id: Uuid, worker: &str, result: Option<serde_json::Value>) -> Result<()> {
        self.backend.complete(id, worker, result, Utc::now()).await?;
        debug!(job_id = %id, worker, "Job acknowledged");
        Ok(())
    }

    /// Hand a leased job back; returns the state the job ended up in
    pub async fn nack(&self, id: Uuid, worker: &str, nack: Nack) -> Result<JobStatus> {
        let now = Utc::now();
        let release = match nack {
            Nack::Defer { wait } => Release::Defer {
                available_at: now + chrono_duration(wait),
            },
            Nack::Fail { reason } => Release::Fail { reason },
            Nack::Retry { reason } => {
                let job = self
                    .backend
                    .get(id)
                    .await?
                    .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))?;
                let failures = job.attempts + 1;
                if failures >= job.max_attempts {
                    Release::DeadLetter {
                        reason: format!("{} (attempt {} of {})", reason, failures, job.max_attempts),
                    }
                } else {
                    Release::Retry {
                        available_at: now + chrono_duration(self.settings.retry.delay(failures)),
                        reason,
                    }
                }
            }
        };

        let job = self.backend.release(id, worker, release, now).await?;
        match job.status {
            JobStatus::Dead => warn!(
                job_id = %id,
                queue = %job.queue,
                attempts = job.attempts,
                "Job dead-lettered: {}",
                job.last_error.as_deref().unwrap_or("")
            ),
            JobStatus::Failed => warn!(
                job_id = %id,
                queue = %job.queue,
                "Job failed: {}",
                job.last_error.as_deref().unwrap_or("")
            ),
            _ => debug!(job_id = %id, status = %job.status, "Job released"),
        }
        Ok(job.status)
    }

    /// Requeue (or dead-letter) every job whose lease has expired
    pub async fn reclaim_stalled(&self) -> Result<ReclaimOutcome> {
        self.reclaim_stalled_at(Utc::now()).await
    }

    pub async fn reclaim_stalled_at(&self, now: DateTime<Utc>) -> Result<ReclaimOutcome> {
        let outcome = self
            .backend
            .reclaim_expired(now, self.settings.stall_ceiling)
            .await?;

        for id in &outcome.requeued {
            warn!(job_id = %id, "Stalled job requeued");
        }
        for id in &outcome.dead_lettered {
            let stall = OrchestratorError::QueueStall {
                job_id: *id,
                stalls: self.settings.stall_ceiling + 1,
            };
            error!(job_id = %id, "{}; moved to dead letters", stall);
        }
        Ok(outcome)
    }

    /// Dead jobs retained for inspection
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<JobRecord>> {
        Ok(self.backend.list(queue, JobStatus::Dead).await?)
    }

    /// Move a dead job back to waiting with its counters reset
    pub async fn replay(&self, id: Uuid) -> Result<JobRecord> {
        let job = self.backend.requeue_dead(id, Utc::now()).await?;
        info!(job_id = %id, queue = %job.queue, "Dead job replayed");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.backend.get(id).await?)
    }

    pub async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        Ok(self.backend.counts(queue).await?)
    }

    pub async fn queues(&self) -> Result<Vec<String>> {
        Ok(self.backend.queues().await?)
    }
}
