//! bookforge-storage - Persistence for the pipeline engine
//!
//! ## Core Principles
//!
//! 1. **Ports, not databases**: the engine depends on `ManifestStore`,
//!    `QueueBackend` and `LedgerBackend`; adapters are chosen at startup
//! 2. **Atomic overwrite**: a manifest is replaced whole or not at all
//! 3. **Single owner**: a job is leased to at most one worker at a time
//!
//! ## Adapters
//!
//! | Port | In-memory | Durable |
//! |------|-----------|---------|
//! | `ManifestStore` | `InMemoryManifestStore` | `JsonFileManifestStore` |
//! | `QueueBackend` | `InMemoryQueue` | `SqliteQueue` |
//! | `LedgerBackend` | `InMemoryLedger` | `SqliteLedger` |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bookforge_storage::{JobRecord, QueueBackend, SqliteDatabase};
//!
//! let db = SqliteDatabase::open("data/engine.db")?;
//! let queue = db.queue();
//! queue.insert(JobRecord::new("stages", payload, 0, 3)).await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    JobRecord, JobStatus, LedgerBackend, LedgerEntry, ManifestError, ManifestStore, QueueBackend,
    QueueCounts, ReclaimOutcome, Release, RunManifest,
};

pub use infrastructure::{InMemoryLedger, InMemoryManifestStore, InMemoryQueue, JsonFileManifestStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::{SqliteDatabase, SqliteLedger, SqliteQueue};
