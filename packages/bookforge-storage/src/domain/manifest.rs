//! Run manifest record
//!
//! One manifest exists per pipeline run and is exclusively written by the
//! orchestrator driving that run. External validators read the same JSON to
//! audit a finished run: `steps` must list every stage in order, `final` must
//! be `true`, and `qa` must carry scores meeting the configured gates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted progress record of a single pipeline run.
///
/// # Examples
///
/// ```rust
/// use bookforge_storage::domain::RunManifest;
///
/// let manifest = RunManifest::new("run-1", "Sourdough at altitude", "PLAN");
/// assert!(manifest.steps.is_empty());
/// assert!(!manifest.is_final);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub topic: String,
    /// Stage the run will execute next (or `DONE`)
    pub current_state: String,
    /// Failed attempts of `current_state` since it was entered
    #[serde(default)]
    pub attempts: u32,
    /// Completed stages, in execution order
    pub steps: Vec<String>,
    /// Quality gate name -> most recent score
    #[serde(default)]
    pub qa: BTreeMap<String, f64>,
    #[serde(rename = "final")]
    pub is_final: bool,
    /// Set when the run gave up on `current_state`
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub errors: Vec<ManifestError>,
    /// Stage name -> result data handed to later stages
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub timestamp: DateTime<Utc>,
}

impl RunManifest {
    pub fn new(
        run_id: impl Into<String>,
        topic: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            topic: topic.into(),
            current_state: initial_state.into(),
            attempts: 0,
            steps: Vec::new(),
            qa: BTreeMap::new(),
            is_final: false,
            aborted: false,
            errors: Vec::new(),
            outputs: BTreeMap::new(),
            created_at: now,
            timestamp: now,
        }
    }

    /// Refresh the mutation timestamp
    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }

    /// Errors recorded against one state
    pub fn errors_for<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a ManifestError> {
        self.errors.iter().filter(move |e| e.state == state)
    }
}

/// One failed attempt of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestError {
    pub state: String,
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ManifestError {
    pub fn new(state: impl Into<String>, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attempt,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_uses_final_key() {
        let manifest = RunManifest::new("run-1", "topic", "PLAN");
        let json = serde_json::to_value(&manifest).unwrap();

        assert_eq!(json["final"], serde_json::Value::Bool(false));
        assert!(json.get("is_final").is_none());
        assert_eq!(json["steps"], serde_json::json!([]));
    }

    #[test]
    fn test_manifest_tolerates_minimal_record() {
        // Records written by external tooling may omit the optional fields
        let raw = r#"{
            "run_id": "run-9",
            "topic": "t",
            "current_state": "WRITE",
            "steps": ["PLAN", "RESEARCH"],
            "final": false,
            "created_at": "2026-01-01T00:00:00Z",
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;

        let manifest: RunManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.attempts, 0);
        assert_eq!(manifest.steps, vec!["PLAN", "RESEARCH"]);
        assert!(manifest.errors.is_empty());
        assert!(!manifest.aborted);
    }

    #[test]
    fn test_errors_for_filters_by_state() {
        let mut manifest = RunManifest::new("run-1", "topic", "PLAN");
        manifest.errors.push(ManifestError::new("WRITE", 1, "boom"));
        manifest.errors.push(ManifestError::new("PLAN", 1, "nope"));
        manifest.errors.push(ManifestError::new("WRITE", 2, "boom again"));

        assert_eq!(manifest.errors_for("WRITE").count(), 2);
        assert_eq!(manifest.errors_for("POLISH").count(), 0);
    }
}
