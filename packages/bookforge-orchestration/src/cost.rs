//! Cost ledger and spend budgets
//!
//! Every accepted metered call becomes a `LedgerEntry` in the backend and
//! increments the in-memory aggregates. Checking the budgets, appending the
//! entry and bumping the aggregates happen under one lock, so concurrent
//! callers can never jointly overshoot a budget.
//!
//! Buckets:
//! - session: everything accepted by this process (not persisted)
//! - daily / monthly: calendar UTC day and month, rebuilt from the backend
//!   by `init()`
//! - per run: keyed by run id, loaded from every entry of the run the first
//!   time the run is seen, so runs that span a month keep their history

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bookforge_storage::{LedgerBackend, LedgerEntry};
use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// US dollars, held as integer micro-dollars so sums are exact.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Usd(u64);

impl Usd {
    pub const ZERO: Usd = Usd(0);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Convert from dollars, rounding to the nearest micro-dollar.
    /// Negative and non-finite amounts become zero.
    pub fn from_dollars(dollars: f64) -> Self {
        if dollars.is_finite() && dollars > 0.0 {
            Self((dollars * MICROS_PER_DOLLAR).round() as u64)
        } else {
            Self(0)
        }
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / MICROS_PER_DOLLAR
    }

    pub fn saturating_add(self, rhs: Usd) -> Usd {
        Usd(self.0.saturating_add(rhs.0))
    }

    /// `self` as a percentage of `budget`
    pub fn percent_of(self, budget: Usd) -> f64 {
        if budget.0 == 0 {
            100.0
        } else {
            self.0 as f64 * 100.0 / budget.0 as f64
        }
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.as_dollars())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetBucket {
    Daily,
    Monthly,
    PerRun,
}

impl BudgetBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetBucket::Daily => "daily",
            BudgetBucket::Monthly => "monthly",
            BudgetBucket::PerRun => "per_run",
        }
    }
}

impl fmt::Display for BudgetBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Non-retryable refusal of a metered call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{bucket} budget exceeded: spent {spent} of {budget}, requested {requested}")]
pub struct BudgetExceeded {
    pub bucket: BudgetBucket,
    pub spent: Usd,
    pub requested: Usd,
    pub budget: Usd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CostDecision {
    Accepted,
    Refused(BudgetExceeded),
}

impl CostDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CostDecision::Accepted)
    }

    /// `Err(BudgetExceeded)` when refused
    pub fn into_result(self) -> std::result::Result<(), BudgetExceeded> {
        match self {
            CostDecision::Accepted => Ok(()),
            CostDecision::Refused(refusal) => Err(refusal),
        }
    }
}

/// Enforced spend ceilings. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub daily: Option<Usd>,
    pub monthly: Option<Usd>,
    pub per_run: Option<Usd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostStatus {
    pub session: Usd,
    pub daily: Usd,
    pub monthly: Usd,
    pub budgets: Budgets,
    pub daily_pct: Option<f64>,
    pub monthly_pct: Option<f64>,
}

impl CostStatus {
    /// Highest utilization across the configured calendar budgets
    pub fn max_pct(&self) -> Option<f64> {
        match (self.daily_pct, self.monthly_pct) {
            (Some(d), Some(m)) => Some(d.max(m)),
            (d, m) => d.or(m),
        }
    }
}

#[derive(Debug, Serialize)]
struct LedgerExport<'a> {
    generated_at: DateTime<Utc>,
    budgets: &'a Budgets,
    session: Usd,
    daily: Usd,
    monthly: Usd,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Default)]
struct Aggregates {
    day: Option<NaiveDate>,
    month: Option<(i32, u32)>,
    session: Usd,
    daily: Usd,
    monthly: Usd,
    /// Runs seen since `init`; absent means not loaded yet
    per_run: HashMap<String, Usd>,
}

impl Aggregates {
    /// Reset buckets whose calendar period ended before `now`
    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            if self.day.is_some() {
                debug!(spent = %self.daily, "Daily cost bucket rolled over");
            }
            self.day = Some(today);
            self.daily = Usd::ZERO;
        }
        let month = (today.year(), today.month());
        if self.month != Some(month) {
            self.month = Some(month);
            self.monthly = Usd::ZERO;
        }
    }

    fn check(
        &self,
        budgets: &Budgets,
        run_id: Option<&str>,
        amount: Usd,
    ) -> std::result::Result<(), BudgetExceeded> {
        let run_spent = run_id
            .and_then(|id| self.per_run.get(id).copied())
            .unwrap_or(Usd::ZERO);

        let buckets = [
            (BudgetBucket::Daily, budgets.daily, self.daily),
            (BudgetBucket::Monthly, budgets.monthly, self.monthly),
            (
                BudgetBucket::PerRun,
                budgets.per_run.filter(|_| run_id.is_some()),
                run_spent,
            ),
        ];

        for (bucket, budget, spent) in buckets {
            let Some(budget) = budget else { continue };
            if spent >= budget || spent.saturating_add(amount) > budget {
                return Err(BudgetExceeded {
                    bucket,
                    spent,
                    requested: amount,
                    budget,
                });
            }
        }
        Ok(())
    }

    fn add(&mut self, run_id: Option<&str>, amount: Usd) {
        self.session = self.session.saturating_add(amount);
        self.daily = self.daily.saturating_add(amount);
        self.monthly = self.monthly.saturating_add(amount);
        if let Some(id) = run_id {
            let spent = self.per_run.entry(id.to_string()).or_default();
            *spent = spent.saturating_add(amount);
        }
    }
}

/// Spend tracker with budget enforcement.
pub struct CostLedger {
    backend: Arc<dyn LedgerBackend>,
    budgets: Budgets,
    state: Mutex<Aggregates>,
}

impl CostLedger {
    pub fn new(backend: Arc<dyn LedgerBackend>, budgets: Budgets) -> Self {
        Self {
            backend,
            budgets,
            state: Mutex::new(Aggregates::default()),
        }
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    /// Rebuild the daily and monthly aggregates from persisted entries.
    /// Per-run totals are reloaded on demand.
    pub async fn init(&self) -> Result<()> {
        self.init_at(Utc::now()).await
    }

    pub async fn init_at(&self, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        let month_start = Utc
            .with_ymd_and_hms(today.year(), today.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);

        let entries = self.backend.entries_since(month_start).await?;

        let mut state = self.state.lock().await;
        let session = state.session;
        *state = Aggregates::default();
        state.roll(now);
        state.session = session;
        for entry in &entries {
            let amount = Usd::from_micros(entry.amount_micros);
            state.monthly = state.monthly.saturating_add(amount);
            if entry.timestamp.date_naive() == today {
                state.daily = state.daily.saturating_add(amount);
            }
        }

        info!(
            entries = entries.len(),
            daily = %state.daily,
            monthly = %state.monthly,
            "Cost ledger initialized"
        );
        Ok(())
    }

    /// Make sure `run_id`'s total is in the cache
    async fn load_run(&self, state: &mut Aggregates, run_id: &str) -> Result<()> {
        if state.per_run.contains_key(run_id) {
            return Ok(());
        }
        let spent = self
            .backend
            .entries_for_run(run_id)
            .await?
            .iter()
            .fold(Usd::ZERO, |acc, e| {
                acc.saturating_add(Usd::from_micros(e.amount_micros))
            });
        if spent > Usd::ZERO {
            debug!(run_id, spent = %spent, "Run spend restored");
        }
        state.per_run.insert(run_id.to_string(), spent);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let state = self.state.lock().await;
        info!(session = %state.session, "Cost ledger closed");
    }

    /// Record the cost of one metered call.
    ///
    /// Returns `Refused` without touching any spend when the amount would
    /// push a configured bucket past its budget, or when that bucket is
    /// already exhausted.
    pub async fn record_cost(
        &self,
        service_id: &str,
        amount: Usd,
        run_id: Option<&str>,
    ) -> Result<CostDecision> {
        self.record_cost_at(service_id, amount, run_id, Utc::now())
            .await
    }

    pub async fn record_cost_at(
        &self,
        service_id: &str,
        amount: Usd,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CostDecision> {
        let mut state = self.state.lock().await;
        state.roll(now);
        if let Some(run_id) = run_id {
            self.load_run(&mut state, run_id).await?;
        }

        if let Err(refusal) = state.check(&self.budgets, run_id, amount) {
            warn!(
                service = service_id,
                run_id = run_id.unwrap_or("-"),
                bucket = %refusal.bucket,
                "Metered call refused: {}",
                refusal
            );
            return Ok(CostDecision::Refused(refusal));
        }

        let entry = LedgerEntry::new(
            service_id,
            amount.micros(),
            run_id.map(str::to_string),
            now,
        );
        self.backend.append(&entry).await?;
        state.add(run_id, amount);

        debug!(
            service = service_id,
            amount = %amount,
            daily = %state.daily,
            "Cost recorded"
        );
        Ok(CostDecision::Accepted)
    }

    /// Refuse up front when a bucket is already exhausted
    pub async fn ensure_headroom(&self, run_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.roll(Utc::now());
        if let Some(run_id) = run_id {
            self.load_run(&mut state, run_id).await?;
        }
        state.check(&self.budgets, run_id, Usd::ZERO)?;
        Ok(())
    }

    pub async fn run_spend(&self, run_id: &str) -> Result<Usd> {
        let mut state = self.state.lock().await;
        self.load_run(&mut state, run_id).await?;
        Ok(state.per_run.get(run_id).copied().unwrap_or(Usd::ZERO))
    }

    pub async fn status(&self) -> CostStatus {
        let mut state = self.state.lock().await;
        state.roll(Utc::now());
        CostStatus {
            session: state.session,
            daily: state.daily,
            monthly: state.monthly,
            budgets: self.budgets,
            daily_pct: self.budgets.daily.map(|b| state.daily.percent_of(b)),
            monthly_pct: self.budgets.monthly.map(|b| state.monthly.percent_of(b)),
        }
    }

    /// Audit snapshot of every persisted entry plus current totals
    pub async fn export_ledger(&self, format: ExportFormat) -> Result<String> {
        let entries = self.backend.entries_since(DateTime::<Utc>::default()).await?;
        let status = self.status().await;

        match format {
            ExportFormat::Json => {
                let export = LedgerExport {
                    generated_at: Utc::now(),
                    budgets: &self.budgets,
                    session: status.session,
                    daily: status.daily,
                    monthly: status.monthly,
                    entries,
                };
                Ok(serde_json::to_string_pretty(&export)?)
            }
            ExportFormat::Csv => {
                let mut out = String::from("id,timestamp,service_id,run_id,amount_usd\n");
                for entry in &entries {
                    out.push_str(&format!(
                        "{},{},{},{},{:.6}\n",
                        entry.id,
                        entry.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                        csv_field(&entry.service_id),
                        csv_field(entry.run_id.as_deref().unwrap_or("")),
                        Usd::from_micros(entry.amount_micros).as_dollars()
                    ));
                }
                Ok(out)
            }
        }
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
