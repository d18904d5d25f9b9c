//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process adapters for tests and single-run use
//! - `file`: JSON manifest files with atomic overwrite
//! - `sqlite`: durable queue and ledger shared by many workers

pub mod file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::JsonFileManifestStore;
pub use memory::{InMemoryLedger, InMemoryManifestStore, InMemoryQueue};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDatabase, SqliteLedger, SqliteQueue};
