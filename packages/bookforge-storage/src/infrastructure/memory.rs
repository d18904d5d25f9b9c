//! In-memory adapters
//!
//! Single-process and test use. State lives behind a `parking_lot::Mutex`, so
//! every trait method is atomic with respect to other callers in the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{
    apply_release, apply_stall, JobRecord, JobStatus, LedgerBackend, LedgerEntry, ManifestStore,
    QueueBackend, QueueCounts, ReclaimOutcome, Release, RunManifest,
};
use crate::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Manifests
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryManifestStore {
    manifests: Mutex<HashMap<String, RunManifest>>,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn save(&self, manifest: &RunManifest) -> Result<()> {
        self.manifests
            .lock()
            .insert(manifest.run_id.clone(), manifest.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunManifest>> {
        Ok(self.manifests.lock().get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs: Vec<String> = self.manifests.lock().keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, JobRecord>,
    next_seq: i64,
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn leased_mut<'a>(
        state: &'a mut QueueState,
        id: Uuid,
        worker: &str,
    ) -> Result<&'a mut JobRecord> {
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::job_not_found(id))?;
        job.ensure_leased_by(worker)?;
        Ok(job)
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, mut job: JobRecord) -> Result<JobRecord> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        job.seq = state.next_seq;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn lease_next(
        &self,
        queue: &str,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let mut state = self.state.lock();
        let next = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.status == JobStatus::Waiting && j.available_at <= now)
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|j| j.id);

        Ok(next.and_then(|id| state.jobs.get_mut(&id)).map(|job| {
            job.status = JobStatus::Active;
            job.lease_owner = Some(worker.to_string());
            job.lease_expiry = Some(lease_until);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn complete(
        &self,
        id: Uuid,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let mut state = self.state.lock();
        let job = Self::leased_mut(&mut state, id, worker)?;
        job.status = JobStatus::Completed;
        job.lease_owner = None;
        job.lease_expiry = None;
        job.result = result;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn release(
        &self,
        id: Uuid,
        worker: &str,
        release: Release,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let mut state = self.state.lock();
        let job = Self::leased_mut(&mut state, id, worker)?;
        apply_release(job, release, now);
        Ok(job.clone())
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
        stall_ceiling: u32,
    ) -> Result<ReclaimOutcome> {
        let mut state = self.state.lock();
        let mut outcome = ReclaimOutcome::default();
        for job in state.jobs.values_mut() {
            let expired = job.status == JobStatus::Active
                && job.lease_expiry.map_or(false, |expiry| expiry < now);
            if !expired {
                continue;
            }
            if apply_stall(job, stall_ceiling, now) {
                outcome.dead_lettered.push(job.id);
            } else {
                outcome.requeued.push(job.id);
            }
        }
        Ok(outcome)
    }

    async fn extend_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let mut state = self.state.lock();
        let job = Self::leased_mut(&mut state, id, worker)?;
        job.lease_expiry = Some(lease_until);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn remove_pending(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock();
        let waiting = state
            .jobs
            .get(&id)
            .is_some_and(|job| job.status == JobStatus::Waiting);
        if waiting {
            state.jobs.remove(&id);
        }
        Ok(waiting)
    }

    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<JobRecord> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StorageError::job_not_found(id))?;
        if job.status != JobStatus::Dead {
            return Err(StorageError::job_conflict(
                id,
                format_args!("is {}, not dead", job.status),
            ));
        }
        job.status = JobStatus::Waiting;
        job.attempts = 0;
        job.stalls = 0;
        job.available_at = now;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn list(&self, queue: &str, status: JobStatus) -> Result<Vec<JobRecord>> {
        let state = self.state.lock();
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        Ok(jobs)
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let state = self.state.lock();
        let mut counts = QueueCounts::default();
        for job in state.jobs.values().filter(|j| j.queue == queue) {
            counts.add(job.status);
        }
        Ok(counts)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.jobs.values().map(|j| j.queue.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock();
        let len = state.jobs.len();
        state.jobs.retain(|_, j| {
            !(matches!(j.status, JobStatus::Completed | JobStatus::Failed) && j.updated_at < before)
        });
        Ok(len - state.jobs.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct InMemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerBackend for InMemoryLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    async fn entries_for_run(&self, run_id: &str) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.run_id.as_deref() == Some(run_id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }
}
