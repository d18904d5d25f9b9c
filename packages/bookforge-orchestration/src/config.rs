//! Engine configuration (YAML schema v1)
//!
//! ```yaml
//! version: 1
//! orchestrator:
//!   max_attempts_per_state: 3
//!   gates:
//!     QA_HTML: { name: html_qa, min_score: 90 }
//! budgets:
//!   daily: 5.0
//! rate_limits:
//!   openai:
//!     windows:
//!       - { duration_secs: 60, ceiling: 50 }
//!       - { duration_secs: 86400, ceiling: 10000 }
//! ```
//!
//! Every section and field is optional and falls back to its default.
//! Unknown fields are rejected.

use crate::autoscale::AutoscaleSettings;
use crate::backoff::BackoffPolicy;
use crate::cost::{Budgets, Usd};
use crate::health::HealthThresholds;
use crate::orchestrator::{Dispatch, OrchestratorSettings};
use crate::pipeline::QualityGate;
use crate::queue::QueueSettings;
use crate::rate_limit::{ServiceLimits, WindowLimit};
use crate::stage::StageId;
use crate::worker::PoolSettings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

// ═══════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Missing version field in YAML
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u64, supported: Vec<u32> },

    /// Two settings that cannot hold together
    #[error("Configuration conflict: {issue}. Fix: {fix}")]
    CrossFieldConflict { issue: String, fix: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Custom(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }

    fn conflict(issue: impl Into<String>, fix: impl Into<String>) -> Self {
        Self::CrossFieldConflict {
            issue: issue.into(),
            fix: fix.into(),
        }
    }
}

fn check_range<T>(field: &str, value: T, min: T, max: T, hint: &str) -> ConfigResult<()>
where
    T: PartialOrd + ToString + Copy,
{
    if value < min || value > max {
        return Err(ConfigError::range_with_hint(field, value, min, max, hint));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Schema
// ═══════════════════════════════════════════════════════════════════════════

/// Root of the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Service id -> limits
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub health: HealthConfig,
    /// Stage name -> external command
    #[serde(default)]
    pub stages: BTreeMap<String, StageCommand>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            orchestrator: OrchestratorConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            rate_limits: BTreeMap::new(),
            budgets: BudgetConfig::default(),
            health: HealthConfig::default(),
            stages: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Orchestrator calls the stage executor itself
    Direct,
    /// Orchestrator enqueues stage jobs for the worker pool
    Queued,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OrchestratorConfig {
    pub max_attempts_per_state: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub stage_timeout_ms: u64,
    /// Stage name -> gate
    pub gates: BTreeMap<String, GateConfig>,
    pub dispatch: DispatchMode,
    pub stage_queue: String,
    /// How often a queued stage job is checked for completion
    pub poll_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_state: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            stage_timeout_ms: 600_000,
            gates: BTreeMap::new(),
            dispatch: DispatchMode::Direct,
            stage_queue: "stages".to_string(),
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    pub name: String,
    pub min_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub lease_ms: u64,
    pub stall_ceiling: u32,
    pub default_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Completed and failed jobs older than this are purged
    pub retention_secs: u64,
    pub reap_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ms: 15 * 60 * 1_000,
            stall_ceiling: 2,
            default_max_attempts: 3,
            retry_base_ms: 1_000,
            retry_cap_ms: 60_000,
            retention_secs: 7 * 24 * 3_600,
            reap_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    pub total_concurrency: usize,
    /// Queue name -> weight
    pub shares: BTreeMap<String, u32>,
    pub idle_poll_ms: u64,
    pub drain_timeout_ms: u64,
    pub autoscale: AutoscaleConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut shares = BTreeMap::new();
        shares.insert("stages".to_string(), 1);
        Self {
            total_concurrency: num_cpus::get(),
            shares,
            idle_poll_ms: 250,
            drain_timeout_ms: 30_000,
            autoscale: AutoscaleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoscaleConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub step: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub max_total: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 10_000,
            step: 1,
            high_watermark: 0.8,
            low_watermark: 0.2,
            max_total: num_cpus::get() * 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub windows: Vec<WindowConfig>,
    #[serde(default = "default_throttle_threshold")]
    pub throttle_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_throttle_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    pub duration_secs: u64,
    pub ceiling: u32,
}

/// Spend ceilings in USD; absent means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BudgetConfig {
    pub daily: Option<f64>,
    pub monthly: Option<f64>,
    pub per_run: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub alert_cooldown_secs: u64,
    pub utilization_warning_pct: f64,
    pub utilization_critical_pct: f64,
    pub dead_jobs_warning: usize,
    pub dead_jobs_critical: usize,
    pub memory_warning_pct: f64,
    pub memory_critical_pct: f64,
    pub disk_warning_pct: f64,
    pub disk_critical_pct: f64,
    pub disk_path: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            alert_cooldown_secs: 300,
            utilization_warning_pct: 80.0,
            utilization_critical_pct: 95.0,
            dead_jobs_warning: 1,
            dead_jobs_critical: 10,
            memory_warning_pct: 85.0,
            memory_critical_pct: 95.0,
            disk_warning_pct: 85.0,
            disk_critical_pct: 95.0,
            disk_path: PathBuf::from("."),
        }
    }
}

/// External program implementing one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Metered service the program calls
    #[serde(default)]
    pub service: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════════════════════

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;

        let version = raw
            .get("version")
            .ok_or(ConfigError::MissingVersion)?
            .as_u64()
            .ok_or_else(|| ConfigError::Validation("'version' must be an integer".to_string()))?;

        if !SUPPORTED_VERSIONS.iter().any(|v| u64::from(*v) == version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let config: EngineConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.validate_orchestrator()?;
        self.validate_queue()?;
        self.validate_workers()?;
        self.validate_rate_limits()?;
        self.validate_budgets()?;
        self.validate_health()?;

        for name in self.stages.keys() {
            parse_pipeline_stage(name, "stages")?;
        }
        Ok(())
    }

    fn validate_orchestrator(&self) -> ConfigResult<()> {
        let o = &self.orchestrator;
        check_range(
            "orchestrator.max_attempts_per_state",
            o.max_attempts_per_state,
            1,
            100,
            "Each state needs at least one attempt",
        )?;
        check_range(
            "orchestrator.backoff_base_ms",
            o.backoff_base_ms,
            1,
            3_600_000,
            "Backoff base must be positive",
        )?;
        if o.backoff_cap_ms < o.backoff_base_ms {
            return Err(ConfigError::conflict(
                format!(
                    "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                    o.backoff_cap_ms, o.backoff_base_ms
                ),
                "Raise backoff_cap_ms or lower backoff_base_ms",
            ));
        }
        check_range(
            "orchestrator.stage_timeout_ms",
            o.stage_timeout_ms,
            1,
            u64::MAX,
            "Stage timeout must be positive",
        )?;
        check_range(
            "orchestrator.poll_interval_ms",
            o.poll_interval_ms,
            1,
            60_000,
            "Queued dispatch polls at least once a minute",
        )?;

        for (stage, gate) in &o.gates {
            parse_pipeline_stage(stage, "orchestrator.gates")?;
            if !gate.min_score.is_finite() {
                return Err(ConfigError::Validation(format!(
                    "gate '{}' on {} has a non-finite min_score",
                    gate.name, stage
                )));
            }
        }

        if o.dispatch == DispatchMode::Queued && !self.workers.shares.contains_key(&o.stage_queue) {
            return Err(ConfigError::conflict(
                format!(
                    "queued dispatch uses queue '{}' but no workers are assigned to it",
                    o.stage_queue
                ),
                format!("Add '{}' to workers.shares", o.stage_queue),
            ));
        }
        Ok(())
    }

    fn validate_queue(&self) -> ConfigResult<()> {
        let q = &self.queue;
        check_range("queue.lease_ms", q.lease_ms, 1_000, u64::MAX, "Leases shorter than a second stall constantly")?;
        check_range("queue.stall_ceiling", q.stall_ceiling, 0, 1_000, "")?;
        check_range("queue.default_max_attempts", q.default_max_attempts, 1, 1_000, "Jobs need at least one attempt")?;
        check_range("queue.retry_base_ms", q.retry_base_ms, 1, 3_600_000, "")?;
        if q.retry_cap_ms < q.retry_base_ms {
            return Err(ConfigError::conflict(
                "queue.retry_cap_ms is below queue.retry_base_ms",
                "Raise retry_cap_ms",
            ));
        }
        check_range("queue.reap_interval_ms", q.reap_interval_ms, 100, u64::MAX, "")?;
        Ok(())
    }

    fn validate_workers(&self) -> ConfigResult<()> {
        let w = &self.workers;
        check_range("workers.total_concurrency", w.total_concurrency, 1, 4_096, "At least one worker is required")?;
        if w.shares.is_empty() {
            return Err(ConfigError::Validation(
                "workers.shares must name at least one queue".to_string(),
            ));
        }
        for (queue, weight) in &w.shares {
            check_range(&format!("workers.shares.{}", queue), *weight, 1, 10_000, "Weights are positive")?;
        }
        if w.shares.len() > w.total_concurrency {
            return Err(ConfigError::conflict(
                format!(
                    "{} queues share {} workers",
                    w.shares.len(),
                    w.total_concurrency
                ),
                "Every queue gets at least one worker; raise total_concurrency",
            ));
        }
        check_range("workers.idle_poll_ms", w.idle_poll_ms, 1, 60_000, "")?;

        let a = &w.autoscale;
        if a.enabled {
            check_range("workers.autoscale.step", a.step, 1, 64, "Resize in small increments")?;
            check_range("workers.autoscale.interval_ms", a.interval_ms, 100, u64::MAX, "")?;
            check_range("workers.autoscale.high_watermark", a.high_watermark, 0.0, 1.0, "")?;
            check_range("workers.autoscale.low_watermark", a.low_watermark, 0.0, 1.0, "")?;
            if a.low_watermark >= a.high_watermark {
                return Err(ConfigError::conflict(
                    format!(
                        "low_watermark ({}) is not below high_watermark ({})",
                        a.low_watermark, a.high_watermark
                    ),
                    "Keep a gap between the watermarks to avoid oscillation",
                ));
            }
            if a.max_total < w.total_concurrency {
                return Err(ConfigError::conflict(
                    "workers.autoscale.max_total is below workers.total_concurrency",
                    "Raise max_total",
                ));
            }
        }
        Ok(())
    }

    fn validate_rate_limits(&self) -> ConfigResult<()> {
        for (service, limits) in &self.rate_limits {
            if limits.windows.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "rate_limits.{} has no windows",
                    service
                )));
            }
            for window in &limits.windows {
                if window.ceiling == 0 {
                    return Err(ConfigError::conflict(
                        format!("rate_limits.{} has a window with ceiling 0", service),
                        "Remove the service from the config to block nothing, or set a positive ceiling",
                    ));
                }
                check_range(
                    &format!("rate_limits.{}.windows.duration_secs", service),
                    window.duration_secs,
                    1,
                    366 * 86_400,
                    "",
                )?;
            }
            check_range(
                &format!("rate_limits.{}.throttle_threshold", service),
                limits.throttle_threshold,
                1,
                1_000,
                "",
            )?;
        }
        Ok(())
    }

    fn validate_budgets(&self) -> ConfigResult<()> {
        let b = &self.budgets;
        for (field, value) in [("daily", b.daily), ("monthly", b.monthly), ("per_run", b.per_run)] {
            if let Some(value) = value {
                if !value.is_finite() || value < 0.0 {
                    return Err(ConfigError::range_with_hint(
                        format!("budgets.{}", field),
                        value,
                        0,
                        "inf",
                        "Budgets are non-negative USD amounts",
                    ));
                }
            }
        }
        if let (Some(daily), Some(monthly)) = (b.daily, b.monthly) {
            if daily > monthly {
                return Err(ConfigError::conflict(
                    "budgets.daily exceeds budgets.monthly",
                    "Lower the daily budget",
                ));
            }
        }
        Ok(())
    }

    fn validate_health(&self) -> ConfigResult<()> {
        let h = &self.health;
        check_range("health.interval_secs", h.interval_secs, 1, 86_400, "")?;
        for (name, warning, critical) in [
            ("utilization", h.utilization_warning_pct, h.utilization_critical_pct),
            ("memory", h.memory_warning_pct, h.memory_critical_pct),
            ("disk", h.disk_warning_pct, h.disk_critical_pct),
        ] {
            if warning > critical {
                return Err(ConfigError::conflict(
                    format!("health.{}_warning_pct is above the critical threshold", name),
                    "Warning must not exceed critical",
                ));
            }
        }
        if h.dead_jobs_warning > h.dead_jobs_critical {
            return Err(ConfigError::conflict(
                "health.dead_jobs_warning is above dead_jobs_critical",
                "Warning must not exceed critical",
            ));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Runtime settings
    // ═══════════════════════════════════════════════════════════════════════

    pub fn orchestrator_settings(&self) -> ConfigResult<OrchestratorSettings> {
        let o = &self.orchestrator;
        let mut gates = HashMap::new();
        for (stage, gate) in &o.gates {
            let stage = parse_pipeline_stage(stage, "orchestrator.gates")?;
            gates.insert(stage, QualityGate::new(gate.name.clone(), gate.min_score));
        }

        Ok(OrchestratorSettings {
            max_attempts_per_state: o.max_attempts_per_state,
            backoff: BackoffPolicy::new(
                Duration::from_millis(o.backoff_base_ms),
                Duration::from_millis(o.backoff_cap_ms),
            ),
            stage_timeout: Duration::from_millis(o.stage_timeout_ms),
            gates,
            dispatch: match o.dispatch {
                DispatchMode::Direct => Dispatch::Direct,
                DispatchMode::Queued => Dispatch::Queued {
                    queue: o.stage_queue.clone(),
                    poll_interval: Duration::from_millis(o.poll_interval_ms),
                },
            },
        })
    }

    pub fn queue_settings(&self) -> QueueSettings {
        let q = &self.queue;
        QueueSettings {
            lease: Duration::from_millis(q.lease_ms),
            stall_ceiling: q.stall_ceiling,
            default_max_attempts: q.default_max_attempts,
            retry: BackoffPolicy::new(
                Duration::from_millis(q.retry_base_ms),
                Duration::from_millis(q.retry_cap_ms),
            ),
            retention: Duration::from_secs(q.retention_secs),
            reap_interval: Duration::from_millis(q.reap_interval_ms),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let w = &self.workers;
        PoolSettings {
            total_concurrency: w.total_concurrency,
            shares: w.shares.clone(),
            idle_poll: Duration::from_millis(w.idle_poll_ms),
            job_timeout: Duration::from_millis(self.orchestrator.stage_timeout_ms),
            drain_timeout: Duration::from_millis(w.drain_timeout_ms),
        }
    }

    /// `None` when autoscaling is disabled
    pub fn autoscale_settings(&self) -> Option<AutoscaleSettings> {
        let a = &self.workers.autoscale;
        a.enabled.then(|| AutoscaleSettings {
            interval: Duration::from_millis(a.interval_ms),
            step: a.step,
            high_watermark: a.high_watermark,
            low_watermark: a.low_watermark,
            max_total: a.max_total,
        })
    }

    pub fn service_limits(&self) -> HashMap<String, ServiceLimits> {
        self.rate_limits
            .iter()
            .map(|(service, limits)| {
                let windows = limits
                    .windows
                    .iter()
                    .map(|w| WindowLimit::new(Duration::from_secs(w.duration_secs), w.ceiling))
                    .collect();
                (
                    service.clone(),
                    ServiceLimits {
                        windows,
                        throttle_threshold: limits.throttle_threshold,
                        cooldown: Duration::from_secs(limits.cooldown_secs),
                    },
                )
            })
            .collect()
    }

    pub fn budgets(&self) -> Budgets {
        Budgets {
            daily: self.budgets.daily.map(Usd::from_dollars),
            monthly: self.budgets.monthly.map(Usd::from_dollars),
            per_run: self.budgets.per_run.map(Usd::from_dollars),
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        let h = &self.health;
        HealthThresholds {
            interval: Duration::from_secs(h.interval_secs),
            alert_cooldown: Duration::from_secs(h.alert_cooldown_secs),
            utilization_warning_pct: h.utilization_warning_pct,
            utilization_critical_pct: h.utilization_critical_pct,
            dead_jobs_warning: h.dead_jobs_warning,
            dead_jobs_critical: h.dead_jobs_critical,
            memory_warning_pct: h.memory_warning_pct,
            memory_critical_pct: h.memory_critical_pct,
            disk_warning_pct: h.disk_warning_pct,
            disk_critical_pct: h.disk_critical_pct,
            disk_path: h.disk_path.clone(),
        }
    }
}

fn parse_pipeline_stage(name: &str, section: &str) -> ConfigResult<StageId> {
    match StageId::from_str(name) {
        Ok(stage) if !stage.is_terminal() => Ok(stage),
        _ => Err(ConfigError::conflict(
            format!("{} names unknown stage '{}'", section, name),
            format!(
                "Use one of: {}",
                StageId::PIPELINE
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = EngineConfig::from_yaml_str("version: 1\n").unwrap();
        assert_eq!(config.orchestrator.max_attempts_per_state, 3);
        assert_eq!(config.queue.stall_ceiling, 2);
        assert_eq!(config.workers.shares.get("stages"), Some(&1));
        assert!(config.rate_limits.is_empty());
        assert_eq!(config.budgets(), Budgets::default());
    }

    #[test]
    fn test_yaml_loading_from_file() {
        let yaml = r#"
version: 1
orchestrator:
  max_attempts_per_state: 5
  gates:
    QA_HTML: { name: html_qa, min_score: 90 }
budgets:
  daily: 5.0
rate_limits:
  openai:
    windows:
      - { duration_secs: 60, ceiling: 50 }
      - { duration_secs: 86400, ceiling: 10000 }
    cooldown_secs: 120
stages:
  PLAN: { program: ./plan.sh, service: openai }
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = EngineConfig::from_yaml_file(file.path()).unwrap();
        let settings = config.orchestrator_settings().unwrap();
        assert_eq!(settings.max_attempts_per_state, 5);
        assert_eq!(settings.gates[&StageId::QaHtml].min_score, 90.0);
        assert_eq!(config.budgets().daily, Some(Usd::from_dollars(5.0)));

        let limits = config.service_limits();
        assert_eq!(limits["openai"].windows.len(), 2);
        assert_eq!(limits["openai"].throttle_threshold, 3);
        assert_eq!(limits["openai"].cooldown, Duration::from_secs(120));
        assert_eq!(config.stages["PLAN"].service.as_deref(), Some("openai"));
    }

    #[test]
    fn test_missing_version() {
        let err = EngineConfig::from_yaml_str("budgets: { daily: 1.0 }\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVersion));
    }

    #[test]
    fn test_unsupported_version() {
        let err = EngineConfig::from_yaml_str("version: 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion { found: 2, .. }));
        assert!(err.to_string().contains("Supported versions: 1"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = EngineConfig::from_yaml_str("version: 1\nqueue:\n  lease_secs: 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_range_errors() {
        let err = EngineConfig::from_yaml_str(
            "version: 1\norchestrator:\n  max_attempts_per_state: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Range { .. }));
        assert!(err.to_string().contains("max_attempts_per_state"));
    }

    #[test]
    fn test_cross_field_conflicts() {
        let gate_on_done = "version: 1\norchestrator:\n  gates:\n    DONE: { name: x, min_score: 1 }\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(gate_on_done).unwrap_err(),
            ConfigError::CrossFieldConflict { .. }
        ));

        let zero_ceiling =
            "version: 1\nrate_limits:\n  svc:\n    windows:\n      - { duration_secs: 60, ceiling: 0 }\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(zero_ceiling).unwrap_err(),
            ConfigError::CrossFieldConflict { .. }
        ));

        let watermarks = "version: 1\nworkers:\n  total_concurrency: 4\n  autoscale:\n    enabled: true\n    low_watermark: 0.9\n    high_watermark: 0.5\n    max_total: 8\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(watermarks).unwrap_err(),
            ConfigError::CrossFieldConflict { .. }
        ));

        let queued_without_workers =
            "version: 1\norchestrator:\n  dispatch: queued\n  stage_queue: books\n";
        assert!(matches!(
            EngineConfig::from_yaml_str(queued_without_workers).unwrap_err(),
            ConfigError::CrossFieldConflict { .. }
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = EngineConfig::default();
        config.workers.total_concurrency = 4;
        config.workers.autoscale.max_total = 8;
        config.budgets.daily = Some(5.0);

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));

        let parsed = EngineConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_autoscale_disabled_by_default() {
        let config = EngineConfig::from_yaml_str("version: 1\n").unwrap();
        assert!(config.autoscale_settings().is_none());
    }

    #[test]
    fn test_demo_config_is_valid() {
        let config = EngineConfig::from_yaml_str(include_str!("../../../demos/bookforge.yaml")).unwrap();
        let settings = config.orchestrator_settings().unwrap();

        assert!(matches!(settings.dispatch, Dispatch::Queued { .. }));
        assert_eq!(settings.gates.len(), 2);
        assert_eq!(config.stages.len(), 9);
        assert_eq!(config.autoscale_settings().map(|a| a.max_total), Some(8));
        assert_eq!(config.service_limits()["llm"].windows.len(), 3);
    }
}
