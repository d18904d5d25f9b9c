//! Run state machine
//!
//! Wraps a `RunManifest` and applies every transition the orchestrator is
//! allowed to make. Attempt counters live in the manifest itself so a resumed
//! run continues with the same counts it crashed with.

use crate::error::{OrchestratorError, Result};
use crate::stage::StageId;
use bookforge_storage::{ManifestError, RunManifest};
use tracing::warn;

/// Run state machine (enforces valid transitions)
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    manifest: RunManifest,
    current: StageId,
}

impl RunStateMachine {
    /// Fresh run positioned at the first stage
    pub fn new(run_id: impl Into<String>, topic: impl Into<String>) -> Self {
        let first = StageId::PIPELINE[0];
        Self {
            manifest: RunManifest::new(run_id, topic, first.as_str()),
            current: first,
        }
    }

    /// Rebuild from a persisted manifest.
    ///
    /// The next state is recomputed from `steps`; a persisted
    /// `current_state` that disagrees is overwritten and its attempt counter
    /// reset.
    pub fn from_manifest(mut manifest: RunManifest) -> Result<Self> {
        let next = StageId::after_steps(&manifest.steps)?;

        if manifest.is_final && !next.is_terminal() {
            return Err(OrchestratorError::InvalidManifest(format!(
                "run {} is final with {} of {} steps",
                manifest.run_id,
                manifest.steps.len(),
                StageId::PIPELINE.len()
            )));
        }

        if manifest.current_state != next.as_str() {
            warn!(
                run_id = %manifest.run_id,
                persisted = %manifest.current_state,
                recomputed = %next,
                "Manifest state disagrees with completed steps, using steps"
            );
            manifest.current_state = next.as_str().to_string();
            manifest.attempts = 0;
        }

        if next.is_terminal() {
            manifest.is_final = true;
        }

        Ok(Self {
            manifest,
            current: next,
        })
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn into_manifest(self) -> RunManifest {
        self.manifest
    }

    pub fn run_id(&self) -> &str {
        &self.manifest.run_id
    }

    pub fn current(&self) -> StageId {
        self.current
    }

    /// Failed attempts of the current state
    pub fn attempts(&self) -> u32 {
        self.manifest.attempts
    }

    pub fn is_final(&self) -> bool {
        self.manifest.is_final
    }

    pub fn is_aborted(&self) -> bool {
        self.manifest.aborted
    }

    /// Transition: current stage → next stage (or DONE)
    ///
    /// Appending a stage already in `steps` is a no-op on the list.
    pub fn complete_stage(&mut self, stage: StageId, data: serde_json::Value) -> Result<StageId> {
        self.ensure_runnable(stage, "completed")?;

        let name = stage.as_str();
        if !self.manifest.steps.iter().any(|s| s == name) {
            self.manifest.steps.push(name.to_string());
        }
        self.manifest.outputs.insert(name.to_string(), data);

        let next = stage.next().unwrap_or(StageId::Done);
        self.current = next;
        self.manifest.current_state = next.as_str().to_string();
        self.manifest.attempts = 0;
        if next.is_terminal() {
            self.manifest.is_final = true;
        }
        self.manifest.touch();
        Ok(next)
    }

    /// Record the latest score of a quality gate
    pub fn record_qa(&mut self, gate: impl Into<String>, score: f64) {
        self.manifest.qa.insert(gate.into(), score);
        self.manifest.touch();
    }

    /// Transition: current stage → current stage (self-retry).
    ///
    /// Returns the attempt counter after the increment.
    pub fn record_failure(&mut self, stage: StageId, error: impl Into<String>) -> Result<u32> {
        self.ensure_runnable(stage, "failed")?;

        self.manifest.attempts += 1;
        let attempt = self.manifest.attempts;
        self.manifest
            .errors
            .push(ManifestError::new(stage.as_str(), attempt, error));
        self.manifest.touch();
        Ok(attempt)
    }

    /// Give up on the current state; the manifest stays non-final
    pub fn abort(&mut self) -> Result<()> {
        if self.manifest.is_final {
            return Err(OrchestratorError::InvalidStateTransition {
                from: StageId::Done.to_string(),
                to: "aborted".to_string(),
            });
        }
        self.manifest.aborted = true;
        self.manifest.touch();
        Ok(())
    }

    /// Clear an abort so the run can be tried again. Returns `true` when the
    /// run was aborted.
    pub fn reopen(&mut self) -> bool {
        if !self.manifest.aborted {
            return false;
        }
        self.manifest.aborted = false;
        self.manifest.attempts = 0;
        self.manifest.touch();
        true
    }

    fn ensure_runnable(&self, stage: StageId, to: &str) -> Result<()> {
        if self.manifest.is_final || self.manifest.aborted || stage != self.current {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.current.to_string(),
                to: format!("{} {}", stage, to),
            });
        }
        Ok(())
    }
}
