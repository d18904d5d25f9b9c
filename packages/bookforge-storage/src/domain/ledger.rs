//! Cost ledger entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One accepted metered call.
///
/// Amounts are integer micro-dollars so bucket sums are exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub service_id: String,
    pub amount_micros: u64,
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        service_id: impl Into<String>,
        amount_micros: u64,
        run_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id: service_id.into(),
            amount_micros,
            run_id,
            timestamp,
        }
    }
}
