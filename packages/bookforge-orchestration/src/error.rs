use std::time::Duration;

use bookforge_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::cost::BudgetExceeded;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Retryable stage failure (executor error, bad output)
    #[error("Stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Stage produced a result below its quality threshold
    #[error("Quality gate '{gate}' rejected {stage}: score {} below {min_score}", fmt_score(.score))]
    QualityGateFailed {
        stage: String,
        gate: String,
        score: Option<f64>,
        min_score: f64,
    },

    /// Non-retryable stage failure
    #[error("Fatal error in {stage}: {message}")]
    Fatal { stage: String, message: String },

    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error("Stage {stage} failed {attempts} times, giving up")]
    MaxAttemptsExceeded { stage: String, attempts: u32 },

    #[error("Job {job_id} stalled {stalls} times")]
    QueueStall { job_id: Uuid, stalls: u32 },

    #[error("Rate limited by {service}, retry after {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Duration,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is already being driven")]
    RunActive(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn stage_failed(stage: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::StageFailed {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    pub fn fatal(stage: impl std::fmt::Display, message: impl std::fmt::Display) -> Self {
        Self::Fatal {
            stage: stage.to_string(),
            message: message.to_string(),
        }
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(ConfigError::Custom(e.to_string()))
    }

    /// Retry policy for this error.
    ///
    /// The orchestrator retries the current state on anything that is not
    /// `Permanent`; the worker pool nacks with retry on the same rule and
    /// fails the job otherwise.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StageFailed { .. }
            | Self::QualityGateFailed { .. }
            | Self::QueueStall { .. }
            | Self::RateLimited { .. }
            | Self::Timeout(_)
            | Self::Other(_) => ErrorCategory::Transient,

            Self::Fatal { .. }
            | Self::BudgetExceeded(_)
            | Self::MaxAttemptsExceeded { .. }
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Parse(_)
            | Self::InvalidStateTransition { .. }
            | Self::InvalidManifest(_)
            | Self::RunNotFound(_)
            | Self::RunActive(_)
            | Self::JobNotFound(_)
            | Self::StageNotFound(_) => ErrorCategory::Permanent,

            Self::Storage(_) | Self::Io(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() != ErrorCategory::Permanent
    }
}

fn fmt_score(score: &Option<f64>) -> String {
    score.map_or_else(|| "missing".to_string(), |s| s.to_string())
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, gate miss, throttling)
    Transient,
    /// Permanent error - don't retry (e.g., budget refusal, invalid input)
    Permanent,
    /// Infrastructure error - alert ops (e.g., storage down, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
