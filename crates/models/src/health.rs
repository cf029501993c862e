use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted snapshot of a provider's live health counters. The in-memory
/// tracker is authoritative; rows are written back periodically so that a
/// restart starts from a recent view instead of zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct ProviderHealth {
    pub provider_name: String,
    pub active_calls: i32,
    pub total_calls: i64,
    pub failed_calls: i64,
    pub consecutive_failures: i32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// 0..=100; see the tracker for the scoring formula.
    pub health_score: f64,
    pub is_healthy: bool,
    pub avg_response_time_ms: Option<f64>,
    pub updated_at: DateTime<Utc>,
}
