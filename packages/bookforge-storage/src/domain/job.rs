//! Durable job records
//!
//! A job is owned by at most one worker at a time. Ownership is a lease with
//! an expiry; a lease that runs out without an ack or nack is a stall.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    /// Non-retryable failure
    Failed,
    /// Retry or stall budget exhausted; retained for inspection
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            _ => Err(StorageError::serialization(format!(
                "Invalid job status: {}",
                s
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dead
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Enqueue order, assigned by the backend on insert
    pub seq: i64,
    pub queue: String,
    pub data: serde_json::Value,
    /// Larger values are leased first
    pub priority: i32,
    pub status: JobStatus,
    /// Failed handler executions so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Leases that expired without ack/nack
    pub stalls: u32,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Earliest time the job may be leased
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(
        queue: impl Into<String>,
        data: serde_json::Value,
        priority: i32,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            queue: queue.into(),
            data,
            priority,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            stalls: 0,
            lease_owner: None,
            lease_expiry: None,
            available_at: now,
            enqueued_at: now,
            updated_at: now,
            last_error: None,
            result: None,
        }
    }

    /// Check that `worker` still holds the lease on this job
    pub fn ensure_leased_by(&self, worker: &str) -> Result<()> {
        if self.status == JobStatus::Active && self.lease_owner.as_deref() == Some(worker) {
            Ok(())
        } else {
            Err(StorageError::job_conflict(
                self.id,
                format_args!(
                    "not leased by {} (status: {}, owner: {:?})",
                    worker, self.status, self.lease_owner
                ),
            ))
        }
    }
}

/// How a leased job is handed back to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    /// Handler failed; back to waiting, attempt counted
    Retry {
        available_at: DateTime<Utc>,
        reason: String,
    },
    /// Not attempted (e.g. rate limited); back to waiting, no attempt counted
    Defer { available_at: DateTime<Utc> },
    /// Non-retryable failure
    Fail { reason: String },
    /// Retry budget exhausted
    DeadLetter { reason: String },
}

/// Result of reclaiming expired leases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimOutcome {
    pub requeued: Vec<Uuid>,
    pub dead_lettered: Vec<Uuid>,
}

impl ReclaimOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.dead_lettered.is_empty()
    }
}

/// Per-queue job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Dead => self.dead += 1,
        }
    }
}

/// Apply a release decision to a leased job.
///
/// Shared by the backends so they agree on counter semantics.
pub fn apply_release(job: &mut JobRecord, release: Release, now: DateTime<Utc>) {
    job.lease_owner = None;
    job.lease_expiry = None;
    job.updated_at = now;
    match release {
        Release::Retry {
            available_at,
            reason,
        } => {
            job.attempts += 1;
            job.status = JobStatus::Waiting;
            job.available_at = available_at;
            job.last_error = Some(reason);
        }
        Release::Defer { available_at } => {
            job.status = JobStatus::Waiting;
            job.available_at = available_at;
        }
        Release::Fail { reason } => {
            job.attempts += 1;
            job.status = JobStatus::Failed;
            job.last_error = Some(reason);
        }
        Release::DeadLetter { reason } => {
            job.attempts += 1;
            job.status = JobStatus::Dead;
            job.last_error = Some(reason);
        }
    }
}

/// Apply a stall to a job whose lease expired. Returns `true` when the job
/// was dead-lettered.
pub fn apply_stall(job: &mut JobRecord, stall_ceiling: u32, now: DateTime<Utc>) -> bool {
    job.stalls += 1;
    job.lease_owner = None;
    job.lease_expiry = None;
    job.updated_at = now;
    if job.stalls > stall_ceiling {
        job.status = JobStatus::Dead;
        job.last_error = Some(format!("lease expired {} times", job.stalls));
        true
    } else {
        job.status = JobStatus::Waiting;
        false
    }
}
