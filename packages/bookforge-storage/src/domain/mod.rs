//! Domain layer: persisted records and port traits
//!
//! # Domain Models
//!
//! - `RunManifest`: progress record of one pipeline run
//! - `JobRecord`: durable unit of queued work with lease-based ownership
//! - `LedgerEntry`: one accepted metered call
//!
//! # Port Traits
//!
//! - `ManifestStore`: one record per run, atomically overwritten
//! - `QueueBackend`: durable priority queues with atomic leasing
//! - `LedgerBackend`: append-only cost entries
//!
//! The engine never talks to a database directly; it depends on these traits
//! and receives an adapter from `crate::infrastructure` at construction time.

mod job;
mod ledger;
mod manifest;

pub use job::{
    apply_release, apply_stall, JobRecord, JobStatus, QueueCounts, ReclaimOutcome, Release,
};
pub use ledger::LedgerEntry;
pub use manifest::{ManifestError, RunManifest};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: ManifestStore
// ═══════════════════════════════════════════════════════════════════════════

/// Run manifest persistence.
///
/// `save` must replace the previous record atomically: a reader (or a crash)
/// observes either the old manifest or the new one, never a partial write.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Persist (create or overwrite) the manifest for `manifest.run_id`
    async fn save(&self, manifest: &RunManifest) -> Result<()>;

    /// Load a manifest; `Ok(None)` when the run is unknown
    async fn load(&self, run_id: &str) -> Result<Option<RunManifest>>;

    /// Identifiers of all persisted runs
    async fn list_runs(&self) -> Result<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: QueueBackend
// ═══════════════════════════════════════════════════════════════════════════

/// Durable job storage.
///
/// This is the single source of truth for job ownership. Every method is
/// atomic with respect to concurrent callers, including callers in other
/// processes when the adapter is shared (SQLite).
///
/// # Ordering
///
/// `lease_next` returns the waiting job with the highest `priority`; ties go
/// to the lowest `seq` (oldest enqueue). No ordering exists across queues.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Connectivity probe
    async fn ping(&self) -> Result<()>;

    /// Store a new job; returns it with `seq` assigned
    async fn insert(&self, job: JobRecord) -> Result<JobRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Atomically pick the next available job and lease it to `worker`
    async fn lease_next(
        &self,
        queue: &str,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Mark a leased job completed. Fails if `worker` no longer holds the lease.
    async fn complete(
        &self,
        id: Uuid,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Hand a leased job back. Fails if `worker` no longer holds the lease.
    async fn release(
        &self,
        id: Uuid,
        worker: &str,
        release: Release,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Push the lease expiry of a job `worker` still holds
    async fn extend_lease(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord>;

    /// Delete a job nobody has leased yet; `false` when it is no longer waiting
    async fn remove_pending(&self, id: Uuid) -> Result<bool>;

    /// Requeue (or dead-letter past `stall_ceiling`) every active job whose
    /// lease expired before `now`
    async fn reclaim_expired(&self, now: DateTime<Utc>, stall_ceiling: u32)
        -> Result<ReclaimOutcome>;

    /// Move a dead job back to waiting with counters reset
    async fn requeue_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<JobRecord>;

    async fn list(&self, queue: &str, status: JobStatus) -> Result<Vec<JobRecord>>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    /// Names of all queues holding at least one job
    async fn queues(&self) -> Result<Vec<String>>;

    /// Delete completed and failed jobs last updated before `before`.
    /// Dead jobs are never purged.
    async fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: LedgerBackend
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only persistence for accepted metered calls.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn append(&self, entry: &LedgerEntry) -> Result<()>;

    /// Entries with `timestamp >= since`, oldest first
    async fn entries_since(&self, since: DateTime<Utc>) -> Result<Vec<LedgerEntry>>;

    /// Every entry charged to `run_id`, oldest first
    async fn entries_for_run(&self, run_id: &str) -> Result<Vec<LedgerEntry>>;
}
