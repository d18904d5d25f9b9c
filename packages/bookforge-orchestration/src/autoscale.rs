//! Utilization-driven worker resizing
//!
//! Each tick compares per-queue utilization with two watermarks and moves
//! capacity by one small step at most, so a burst cannot swing the pool.

use crate::error::Result;
use crate::queue::JobQueue;
use crate::worker::{SlotStats, WorkerPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AutoscaleSettings {
    pub interval: Duration,
    /// Workers added or removed per resize
    pub step: usize,
    /// Grow at or above this utilization (0..=1)
    pub high_watermark: f64,
    /// Shrink at or below this utilization (0..=1)
    pub low_watermark: f64,
    /// Ceiling on the pool's total capacity
    pub max_total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resize {
    pub queue: String,
    pub from: usize,
    pub to: usize,
}

/// Decide which slots to resize.
///
/// A busy queue grows only when it has waiting jobs and the pool stays within
/// `max_total`; an idle queue shrinks but never below one worker.
pub fn plan_resizes(
    stats: &[SlotStats],
    waiting: &HashMap<String, usize>,
    settings: &AutoscaleSettings,
) -> Vec<Resize> {
    let step = settings.step.max(1);
    let mut total: usize = stats.iter().map(|s| s.capacity).sum();
    let mut resizes = Vec::new();

    for slot in stats {
        let utilization = slot.utilization();
        let backlog = waiting.get(&slot.queue).copied().unwrap_or(0);

        if utilization >= settings.high_watermark && backlog > 0 && total + step <= settings.max_total {
            total += step;
            resizes.push(Resize {
                queue: slot.queue.clone(),
                from: slot.capacity,
                to: slot.capacity + step,
            });
        } else if utilization <= settings.low_watermark && slot.capacity > step {
            total -= step;
            resizes.push(Resize {
                queue: slot.queue.clone(),
                from: slot.capacity,
                to: slot.capacity - step,
            });
        }
    }
    resizes
}

pub struct AutoScaler {
    pool: Arc<WorkerPool>,
    queue: Arc<JobQueue>,
    settings: AutoscaleSettings,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutoScaler {
    pub fn new(pool: Arc<WorkerPool>, queue: Arc<JobQueue>, settings: AutoscaleSettings) -> Self {
        Self {
            pool,
            queue,
            settings,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let scaler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(scaler.settings.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = scaler.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = scaler.tick().await {
                    warn!("Autoscale tick failed: {}", e);
                }
            }
        });
        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            max_total = self.settings.max_total,
            "Autoscaler started"
        );
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Autoscaler ended abnormally: {}", e);
            }
        }
    }

    /// Sample utilization once and apply the planned resizes
    pub async fn tick(&self) -> Result<Vec<Resize>> {
        if self.pool.is_paused() {
            return Ok(Vec::new());
        }

        let stats = self.pool.slot_stats();
        let mut waiting = HashMap::with_capacity(stats.len());
        for slot in &stats {
            waiting.insert(slot.queue.clone(), self.queue.counts(&slot.queue).await?.waiting);
        }

        let resizes = plan_resizes(&stats, &waiting, &self.settings);
        for resize in &resizes {
            self.pool.resize(&resize.queue, resize.to)?;
        }
        if resizes.is_empty() {
            debug!("Autoscale: no change");
        }
        Ok(resizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AutoscaleSettings {
        AutoscaleSettings {
            interval: Duration::from_secs(10),
            step: 1,
            high_watermark: 0.8,
            low_watermark: 0.2,
            max_total: 6,
        }
    }

    fn slot(queue: &str, capacity: usize, active: usize) -> SlotStats {
        SlotStats {
            queue: queue.to_string(),
            capacity,
            active,
        }
    }

    fn waiting(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs.iter().map(|(q, n)| (q.to_string(), *n)).collect()
    }

    #[test]
    fn test_busy_queue_with_backlog_grows_by_one_step() {
        let resizes = plan_resizes(&[slot("text", 2, 2)], &waiting(&[("text", 5)]), &settings());
        assert_eq!(
            resizes,
            vec![Resize {
                queue: "text".to_string(),
                from: 2,
                to: 3
            }]
        );
    }

    #[test]
    fn test_busy_queue_without_backlog_stays() {
        let resizes = plan_resizes(&[slot("text", 2, 2)], &waiting(&[]), &settings());
        assert!(resizes.is_empty());
    }

    #[test]
    fn test_growth_capped_by_max_total() {
        let stats = [slot("text", 3, 3), slot("images", 2, 2)];
        let resizes = plan_resizes(&stats, &waiting(&[("text", 1), ("images", 1)]), &settings());
        // 5 + 1 fits, a second step would reach 7
        assert_eq!(resizes.len(), 1);
        assert_eq!(resizes[0].queue, "text");
    }

    #[test]
    fn test_idle_queue_shrinks_but_keeps_one_worker() {
        let resizes = plan_resizes(
            &[slot("text", 3, 0), slot("images", 1, 0)],
            &waiting(&[]),
            &settings(),
        );
        assert_eq!(resizes.len(), 1);
        assert_eq!(resizes[0].to, 2);
    }

    #[test]
    fn test_middle_band_is_stable() {
        let resizes = plan_resizes(&[slot("text", 4, 2)], &waiting(&[("text", 10)]), &settings());
        assert!(resizes.is_empty());
    }
}
