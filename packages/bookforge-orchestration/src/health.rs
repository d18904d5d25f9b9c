//! Periodic health sampling and throttled alerting

use crate::cost::CostLedger;
use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::worker::WorkerPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::EngineMetrics;

/// Severity of one check; ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }

    /// Classify a value that is worse when larger
    pub fn classify(value: f64, warning: f64, critical: f64) -> Self {
        if value >= critical {
            HealthStatus::Critical
        } else if value >= warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub value: Option<f64>,
}

impl HealthCheck {
    fn new(name: impl Into<String>, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            value: None,
        }
    }

    fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Worst status across all checks
    pub fn overall(&self) -> HealthStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
    }
}

/// Destination for health alerts
pub trait AlertSink: Send + Sync {
    fn alert(&self, check: &HealthCheck);
}

/// Emits alerts as tracing events
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, check: &HealthCheck) {
        match check.status {
            HealthStatus::Critical => error!(
                check = %check.name,
                value = ?check.value,
                "Health critical: {}",
                check.message
            ),
            HealthStatus::Warning => warn!(
                check = %check.name,
                value = ?check.value,
                "Health warning: {}",
                check.message
            ),
            HealthStatus::Healthy => {}
        }
    }
}

/// Host resource readings; `None` when unavailable on this platform
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn memory_used_pct(&self) -> Option<f64>;
    async fn disk_used_pct(&self, path: &Path) -> Option<f64>;
}

/// Reads `/proc/meminfo` and `df -Pk`
#[derive(Debug, Default)]
pub struct SystemProbe;

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn memory_used_pct(&self) -> Option<f64> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        parse_meminfo(&meminfo)
    }

    async fn disk_used_pct(&self, path: &Path) -> Option<f64> {
        let output = tokio::process::Command::new("df")
            .arg("-Pk")
            .arg(path)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_df(&String::from_utf8_lossy(&output.stdout))
    }
}

fn meminfo_kb(meminfo: &str, key: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// Used memory percentage from `/proc/meminfo` contents
pub fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let total = meminfo_kb(meminfo, "MemTotal:")?;
    let available = meminfo_kb(meminfo, "MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

/// Used disk percentage from POSIX `df -Pk` output
pub fn parse_df(output: &str) -> Option<f64> {
    let fields: Vec<&str> = output.lines().nth(1)?.split_whitespace().collect();
    let used: u64 = fields.get(2)?.parse().ok()?;
    let available: u64 = fields.get(3)?.parse().ok()?;
    let total = used + available;
    if total == 0 {
        return None;
    }
    Some(used as f64 * 100.0 / total as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub interval: Duration,
    /// Minimum gap between two alerts for the same check at the same status
    pub alert_cooldown: Duration,
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

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            alert_cooldown: Duration::from_secs(300),
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

pub struct HealthMonitor {
    queue: Arc<JobQueue>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<CostLedger>,
    pool: Option<Arc<WorkerPool>>,
    thresholds: HealthThresholds,
    probe: Arc<dyn ResourceProbe>,
    sink: Arc<dyn AlertSink>,
    /// check name -> (last alert, status alerted)
    last_alerts: DashMap<String, (Instant, HealthStatus)>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<EngineMetrics>>,
}

impl HealthMonitor {
    pub fn new(
        queue: Arc<JobQueue>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<CostLedger>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            queue,
            limiter,
            ledger,
            pool: None,
            thresholds,
            probe: Arc::new(SystemProbe),
            sink: Arc::new(TracingAlertSink),
            last_alerts: DashMap::new(),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.thresholds.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let report = monitor.check_and_alert().await;
                debug!(overall = %report.overall(), checks = report.checks.len(), "Health sampled");
            }
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
        info!(
            interval_secs = self.thresholds.interval.as_secs(),
            "Health monitor started"
        );
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Health monitor ended abnormally: {}", e);
            }
        }
    }

    /// Sample every check and alert on the unhealthy ones
    pub async fn check_and_alert(&self) -> HealthReport {
        let report = self.check().await;
        let now = Instant::now();
        for check in &report.checks {
            if self.should_alert(check, now) {
                self.sink.alert(check);
            }
        }
        report
    }

    pub async fn check(&self) -> HealthReport {
        let mut checks = Vec::new();

        match self.queue.ping().await {
            Ok(()) => {
                checks.push(HealthCheck::new(
                    "queue_connectivity",
                    HealthStatus::Healthy,
                    "queue backend reachable",
                ));
                self.check_dead_jobs(&mut checks).await;
            }
            Err(e) => checks.push(HealthCheck::new(
                "queue_connectivity",
                HealthStatus::Critical,
                format!("queue backend unreachable: {}", e),
            )),
        }

        if let Some(pool) = &self.pool {
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.observe_workers(&pool.slot_stats());
            }
            checks.push(Self::check_workers(pool));
        }

        checks.push(self.check_memory().await);
        checks.push(self.check_disk().await);
        self.check_rate_limits(&mut checks);
        checks.push(self.check_budget().await);

        let report = HealthReport {
            checked_at: Utc::now(),
            checks,
        };
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_health(&report);
        }
        report
    }

    async fn check_dead_jobs(&self, checks: &mut Vec<HealthCheck>) {
        let queues = match self.queue.queues().await {
            Ok(queues) => queues,
            Err(e) => {
                checks.push(HealthCheck::new(
                    "dead_jobs",
                    HealthStatus::Warning,
                    format!("cannot list queues: {}", e),
                ));
                return;
            }
        };

        for queue in queues {
            let name = format!("dead_jobs:{}", queue);
            match self.queue.counts(&queue).await {
                Ok(counts) => {
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_queue(&queue, &counts);
                    }
                    let status = if counts.dead >= self.thresholds.dead_jobs_critical {
                        HealthStatus::Critical
                    } else if counts.dead >= self.thresholds.dead_jobs_warning && counts.dead > 0 {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                    checks.push(
                        HealthCheck::new(name, status, format!("{} dead jobs", counts.dead))
                            .with_value(counts.dead as f64),
                    );
                }
                Err(e) => checks.push(HealthCheck::new(
                    name,
                    HealthStatus::Warning,
                    format!("cannot count jobs: {}", e),
                )),
            }
        }
    }

    fn check_workers(pool: &WorkerPool) -> HealthCheck {
        let (alive, started) = pool.liveness();
        let (status, message) = if started == 0 {
            (HealthStatus::Warning, "worker pool not started".to_string())
        } else if alive < started {
            (
                HealthStatus::Critical,
                format!("{} of {} dispatchers stopped", started - alive, started),
            )
        } else if pool.is_paused() {
            (HealthStatus::Warning, "worker pool paused".to_string())
        } else {
            (
                HealthStatus::Healthy,
                format!("{} dispatchers, {} active jobs", alive, pool.active_jobs()),
            )
        };
        HealthCheck::new("worker_liveness", status, message).with_value(alive as f64)
    }

    async fn check_memory(&self) -> HealthCheck {
        match self.probe.memory_used_pct().await {
            Some(pct) => HealthCheck::new(
                "memory",
                HealthStatus::classify(
                    pct,
                    self.thresholds.memory_warning_pct,
                    self.thresholds.memory_critical_pct,
                ),
                format!("{:.1}% memory used", pct),
            )
            .with_value(pct),
            None => HealthCheck::new("memory", HealthStatus::Healthy, "memory usage unavailable"),
        }
    }

    async fn check_disk(&self) -> HealthCheck {
        let path = &self.thresholds.disk_path;
        match self.probe.disk_used_pct(path).await {
            Some(pct) => HealthCheck::new(
                "disk",
                HealthStatus::classify(
                    pct,
                    self.thresholds.disk_warning_pct,
                    self.thresholds.disk_critical_pct,
                ),
                format!("{:.1}% of {} used", pct, path.display()),
            )
            .with_value(pct),
            None => HealthCheck::new("disk", HealthStatus::Healthy, "disk usage unavailable"),
        }
    }

    fn check_rate_limits(&self, checks: &mut Vec<HealthCheck>) {
        for status in self.limiter.snapshot() {
            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.observe_limiter(&status);
            }
            let name = format!("rate_limit:{}", status.service);
            let pct = status.max_utilization_pct();
            let check = match status.paused_for_ms {
                Some(ms) => HealthCheck::new(
                    name,
                    HealthStatus::Critical,
                    format!("paused for another {}s", ms / 1_000),
                ),
                None => HealthCheck::new(
                    name,
                    HealthStatus::classify(
                        pct,
                        self.thresholds.utilization_warning_pct,
                        self.thresholds.utilization_critical_pct,
                    ),
                    format!("{:.0}% of fullest window used", pct),
                ),
            };
            checks.push(check.with_value(pct));
        }
    }

    async fn check_budget(&self) -> HealthCheck {
        let status = self.ledger.status().await;
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.observe_spend(&status);
        }
        match status.max_pct() {
            Some(pct) => HealthCheck::new(
                "budget",
                HealthStatus::classify(
                    pct,
                    self.thresholds.utilization_warning_pct,
                    self.thresholds.utilization_critical_pct,
                ),
                format!("daily {} / monthly {} ({:.0}% of budget)", status.daily, status.monthly, pct),
            )
            .with_value(pct),
            None => HealthCheck::new(
                "budget",
                HealthStatus::Healthy,
                format!("no budgets configured, {} spent today", status.daily),
            ),
        }
    }

    /// Alert on a new problem, an escalation, or a problem that outlived
    /// the cooldown. A healthy check clears its history.
    fn should_alert(&self, check: &HealthCheck, now: Instant) -> bool {
        if check.status == HealthStatus::Healthy {
            self.last_alerts.remove(&check.name);
            return false;
        }

        let alert = match self.last_alerts.get(&check.name) {
            None => true,
            Some(last) => {
                let (at, status) = *last;
                check.status > status || now.saturating_duration_since(at) >= self.thresholds.alert_cooldown
            }
        };
        if alert {
            self.last_alerts
                .insert(check.name.clone(), (now, check.status));
        }
        alert
    }
}
