//! Per-service admission control
//!
//! Each service carries one fixed window per configured duration. A call is
//! admitted only when every window has headroom, and admission increments
//! all of them under the same map shard lock, so concurrent callers can never
//! push a window past its ceiling.
//!
//! A circuit breaker sits in front of the windows: `record_throttle` counts
//! consecutive upstream throttling responses and pauses the service for its
//! cooldown once the threshold is reached.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Ceiling for one window duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub duration: Duration,
    pub ceiling: u32,
}

impl WindowLimit {
    pub fn new(duration: Duration, ceiling: u32) -> Self {
        Self { duration, ceiling }
    }

    pub fn per_minute(ceiling: u32) -> Self {
        Self::new(Duration::from_secs(60), ceiling)
    }

    pub fn per_hour(ceiling: u32) -> Self {
        Self::new(Duration::from_secs(3_600), ceiling)
    }

    pub fn per_day(ceiling: u32) -> Self {
        Self::new(Duration::from_secs(86_400), ceiling)
    }
}

/// Limits of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLimits {
    pub windows: Vec<WindowLimit>,
    /// Consecutive throttles that trip the breaker
    pub throttle_threshold: u32,
    pub cooldown: Duration,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            windows: Vec::new(),
            throttle_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl ServiceLimits {
    pub fn new(windows: Vec<WindowLimit>) -> Self {
        Self {
            windows,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// A window is full until it resets
    Window { duration: Duration, ceiling: u32 },
    /// The circuit breaker paused the service
    Paused,
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied {
        retry_after: Duration,
        reason: DenyReason,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowStatus {
    pub duration_secs: u64,
    pub ceiling: u32,
    pub consumed: u32,
    pub utilization_pct: f64,
    pub resets_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub service: String,
    pub windows: Vec<WindowStatus>,
    /// Remaining breaker pause
    pub paused_for_ms: Option<u64>,
}

impl ServiceStatus {
    /// Utilization of the fullest window; 100 while paused
    pub fn max_utilization_pct(&self) -> f64 {
        if self.paused_for_ms.is_some() {
            return 100.0;
        }
        self.windows
            .iter()
            .map(|w| w.utilization_pct)
            .fold(0.0, f64::max)
    }
}

#[derive(Debug)]
struct Window {
    limit: WindowLimit,
    consumed: u32,
    started: Instant,
}

impl Window {
    fn new(limit: WindowLimit, now: Instant) -> Self {
        Self {
            limit,
            consumed: 0,
            started: now,
        }
    }

    fn elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.limit.duration
    }

    fn roll(&mut self, now: Instant) {
        if self.elapsed(now) {
            self.consumed = 0;
            self.started = now;
        }
    }

    /// Consumed count as of `now`, without mutating
    fn consumed_at(&self, now: Instant) -> u32 {
        if self.elapsed(now) {
            0
        } else {
            self.consumed
        }
    }

    fn resets_in(&self, now: Instant) -> Duration {
        (self.started + self.limit.duration).saturating_duration_since(now)
    }

    fn is_full(&self) -> bool {
        self.consumed >= self.limit.ceiling
    }
}

#[derive(Debug)]
struct ServiceState {
    windows: Vec<Window>,
    throttle_threshold: u32,
    cooldown: Duration,
    consecutive_throttles: u32,
    paused_until: Option<Instant>,
}

impl ServiceState {
    fn new(limits: &ServiceLimits, now: Instant) -> Self {
        Self {
            windows: limits
                .windows
                .iter()
                .map(|limit| Window::new(*limit, now))
                .collect(),
            throttle_threshold: limits.throttle_threshold.max(1),
            cooldown: limits.cooldown,
            consecutive_throttles: 0,
            paused_until: None,
        }
    }

    fn paused_for(&self, now: Instant) -> Option<Duration> {
        self.paused_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Multi-window rate limiter with a circuit breaker.
///
/// Services without configured limits are always admitted.
#[derive(Debug, Default)]
pub struct RateLimiter {
    services: DashMap<String, ServiceState>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, ServiceLimits>) -> Self {
        let limiter = Self::default();
        for (service, limits) in limits {
            limiter.configure(service, &limits);
        }
        limiter
    }

    /// Install (or replace) the limits of a service. Counters start empty.
    pub fn configure(&self, service: impl Into<String>, limits: &ServiceLimits) {
        self.services
            .insert(service.into(), ServiceState::new(limits, Instant::now()));
    }

    pub fn init(&self) {
        for entry in self.services.iter() {
            info!(
                service = %entry.key(),
                windows = entry.windows.len(),
                "Rate limits configured"
            );
        }
    }

    pub fn shutdown(&self) {
        for entry in self.services.iter() {
            if entry.paused_until.is_some() {
                info!(service = %entry.key(), "Rate limiter closed with service paused");
            }
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Check every window and consume one slot from each when all have room
    pub fn try_admit(&self, service: &str) -> Admission {
        let Some(mut state) = self.services.get_mut(service) else {
            return Admission::Admitted;
        };
        let now = Instant::now();

        if let Some(until) = state.paused_until {
            if until > now {
                return Admission::Denied {
                    retry_after: until - now,
                    reason: DenyReason::Paused,
                };
            }
            debug!(service, "Rate limiter cooldown elapsed");
            state.paused_until = None;
            state.consecutive_throttles = 0;
        }

        for window in state.windows.iter_mut() {
            window.roll(now);
        }

        if let Some(full) = state
            .windows
            .iter()
            .filter(|w| w.is_full())
            .max_by_key(|w| w.resets_in(now))
        {
            return Admission::Denied {
                retry_after: full.resets_in(now),
                reason: DenyReason::Window {
                    duration: full.limit.duration,
                    ceiling: full.limit.ceiling,
                },
            };
        }

        for window in state.windows.iter_mut() {
            window.consumed += 1;
        }
        Admission::Admitted
    }

    /// Upstream answered with a throttling response. Returns `true` when this
    /// call tripped the breaker.
    pub fn record_throttle(&self, service: &str) -> bool {
        let now = Instant::now();
        let mut state = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceState::new(&ServiceLimits::default(), now));

        if state.paused_for(now).is_some() {
            return false;
        }

        state.consecutive_throttles += 1;
        if state.consecutive_throttles < state.throttle_threshold {
            debug!(
                service,
                throttles = state.consecutive_throttles,
                "Upstream throttle recorded"
            );
            return false;
        }

        state.consecutive_throttles = 0;
        state.paused_until = Some(now + state.cooldown);
        warn!(
            service,
            cooldown_secs = state.cooldown.as_secs(),
            "Service paused after repeated throttling"
        );
        true
    }

    /// Upstream call went through; clears the throttle streak
    pub fn record_success(&self, service: &str) {
        if let Some(mut state) = self.services.get_mut(service) {
            state.consecutive_throttles = 0;
        }
    }

    /// Deny every call to `service` for `duration`
    pub fn pause(&self, service: &str, duration: Duration) {
        let now = Instant::now();
        let mut state = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceState::new(&ServiceLimits::default(), now));
        state.paused_until = Some(now + duration);
        info!(service, pause_secs = duration.as_secs(), "Service paused");
    }

    /// Current utilization; `None` for services without configured limits
    pub fn status(&self, service: &str) -> Option<ServiceStatus> {
        let state = self.services.get(service)?;
        Some(Self::describe(service, &state, Instant::now()))
    }

    pub fn snapshot(&self) -> Vec<ServiceStatus> {
        let now = Instant::now();
        let mut all: Vec<ServiceStatus> = self
            .services
            .iter()
            .map(|entry| Self::describe(entry.key(), entry.value(), now))
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    fn describe(service: &str, state: &ServiceState, now: Instant) -> ServiceStatus {
        let windows = state
            .windows
            .iter()
            .map(|w| {
                let consumed = w.consumed_at(now);
                let resets_in = if w.elapsed(now) {
                    w.limit.duration
                } else {
                    w.resets_in(now)
                };
                WindowStatus {
                    duration_secs: w.limit.duration.as_secs(),
                    ceiling: w.limit.ceiling,
                    consumed,
                    utilization_pct: if w.limit.ceiling == 0 {
                        100.0
                    } else {
                        f64::from(consumed) * 100.0 / f64::from(w.limit.ceiling)
                    },
                    resets_in_ms: resets_in.as_millis() as u64,
                }
            })
            .collect();

        ServiceStatus {
            service: service.to_string(),
            windows,
            paused_for_ms: state.paused_for(now).map(|d| d.as_millis() as u64),
        }
    }
}
