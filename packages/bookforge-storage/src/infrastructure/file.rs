//! JSON file manifest store
//!
//! One `<run_id>.json` file per run under a base directory. Writes go to a
//! temporary file in the same directory which is then renamed over the
//! target, so readers never observe a half-written manifest.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::domain::{ManifestStore, RunManifest};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct JsonFileManifestStore {
    dir: PathBuf,
}

impl JsonFileManifestStore {
    /// Create the store, creating `dir` if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the manifest file for `run_id`
    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(format!("{}.json", run_id)))
    }
}

/// Run ids become file names: restrict them to a safe alphabet
fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id.len() <= 128
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !run_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::invalid_run_id(run_id))
    }
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| StorageError::from(e.error))?;
    Ok(())
}

#[async_trait]
impl ManifestStore for JsonFileManifestStore {
    async fn save(&self, manifest: &RunManifest) -> Result<()> {
        let target = self.path_for(&manifest.run_id)?;
        let bytes = serde_json::to_vec_pretty(manifest)?;
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || write_atomically(&dir, &target, &bytes))
            .await
            .map_err(StorageError::task_failed)?
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunManifest>> {
        let path = self.path_for(run_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                runs.push(stem.to_string());
            }
        }
        runs.sort();
        Ok(runs)
    }
}
