//! Prometheus metrics for the engine

use crate::cost::CostStatus;
use crate::health::{HealthReport, HealthStatus};
use crate::rate_limit::ServiceStatus;
use crate::worker::SlotStats;
use bookforge_storage::QueueCounts;
use prometheus::{
    register_gauge_vec_with_registry, register_int_gauge_vec_with_registry, GaugeVec,
    IntGaugeVec, Opts, Registry,
};

#[derive(Clone)]
pub struct EngineMetrics {
    /// Jobs per queue and state
    pub queue_jobs: IntGaugeVec,
    /// Capacity and active workers per queue
    pub workers: IntGaugeVec,
    /// Spend per bucket in USD
    pub spend_usd: GaugeVec,
    /// Rate window utilization per service and window length
    pub window_utilization: GaugeVec,
    /// 0 healthy, 1 warning, 2 critical
    pub health: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            queue_jobs: register_int_gauge_vec_with_registry!(
                Opts::new("bookforge_queue_jobs", "Jobs by queue and state"),
                &["queue", "state"],
                registry
            )?,
            workers: register_int_gauge_vec_with_registry!(
                Opts::new("bookforge_workers", "Worker slots by queue"),
                &["queue", "kind"],
                registry
            )?,
            spend_usd: register_gauge_vec_with_registry!(
                Opts::new("bookforge_spend_usd", "Metered spend by bucket"),
                &["bucket"],
                registry
            )?,
            window_utilization: register_gauge_vec_with_registry!(
                Opts::new(
                    "bookforge_rate_window_utilization_pct",
                    "Rate window utilization"
                ),
                &["service", "window_secs"],
                registry
            )?,
            health: register_int_gauge_vec_with_registry!(
                Opts::new("bookforge_health_status", "Health check status"),
                &["check"],
                registry
            )?,
        })
    }

    pub fn observe_queue(&self, queue: &str, counts: &QueueCounts) {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
            ("dead", counts.dead),
        ] {
            self.queue_jobs
                .with_label_values(&[queue, state])
                .set(value as i64);
        }
    }

    pub fn observe_workers(&self, stats: &[SlotStats]) {
        for slot in stats {
            self.workers
                .with_label_values(&[slot.queue.as_str(), "capacity"])
                .set(slot.capacity as i64);
            self.workers
                .with_label_values(&[slot.queue.as_str(), "active"])
                .set(slot.active as i64);
        }
    }

    pub fn observe_spend(&self, status: &CostStatus) {
        for (bucket, spend) in [
            ("session", status.session),
            ("daily", status.daily),
            ("monthly", status.monthly),
        ] {
            self.spend_usd
                .with_label_values(&[bucket])
                .set(spend.as_dollars());
        }
    }

    pub fn observe_limiter(&self, status: &ServiceStatus) {
        for window in &status.windows {
            let window_secs = window.duration_secs.to_string();
            self.window_utilization
                .with_label_values(&[status.service.as_str(), window_secs.as_str()])
                .set(window.utilization_pct);
        }
    }

    pub fn observe_health(&self, report: &HealthReport) {
        for check in &report.checks {
            let level = match check.status {
                HealthStatus::Healthy => 0,
                HealthStatus::Warning => 1,
                HealthStatus::Critical => 2,
            };
            self.health.with_label_values(&[check.name.as_str()]).set(level);
        }
    }
}
