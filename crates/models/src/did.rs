use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A temporary number from the pool, handed out for the duration of one
/// call and recognized when the transit provider dials it back.
///
/// `in_use` together with `allocated_at` is the durable source of truth:
/// a row left held by a crashed process is repaired by the stale sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct Did {
    pub number: String,
    /// Owning provider; NULL rows may serve any provider.
    pub provider_name: Option<String>,
    pub in_use: bool,
    /// The DNIS this DID is currently standing in for.
    pub destination: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
}
