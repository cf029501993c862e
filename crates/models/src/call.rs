use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "call_status", rename_all = "snake_case")
)]
pub enum CallStatus {
    Initiated,
    Active,
    ReturnedFromTransit,
    RoutingToFinal,
    Completed,
    Failed,
    Abandoned,
    Timeout,
}

impl CallStatus {
    /// Terminal states never transition again; their DID is released.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Abandoned | Self::Timeout
        )
    }
}

/// Which leg of the three-leg dance the call is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "call_step", rename_all = "snake_case")
)]
pub enum CallStep {
    /// Leg 1: origination handed in, dialing out to transit.
    ToTransit,
    /// Leg 2: transit dialed our DID back in.
    ToRouter,
    /// Leg 3: forwarded to the termination provider.
    ToTermination,
}

/// The per-call record. One non-terminal record exists per `call_id`;
/// terminal transitions release the DID before the record update commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct CallRecord {
    /// Unique id supplied by the switch on leg 1.
    pub call_id: String,
    pub original_ani: String,
    pub original_dnis: String,
    /// ANI presented to the transit provider; equals `original_dnis`.
    pub transformed_ani: Option<String>,
    pub assigned_did: Option<String>,
    pub inbound_provider: String,
    pub intermediate_provider: String,
    pub final_provider: String,
    pub route_name: String,
    pub status: CallStatus,
    pub current_step: CallStep,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall-clock seconds from start to end.
    pub duration: Option<i64>,
    pub billable_duration: Option<i64>,
    pub recording_path: Option<String>,
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Which checkpoint a verification row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "verification_step", rename_all = "snake_case")
)]
pub enum VerificationStep {
    /// Leg 2: the transit provider dialing our DID back.
    Return,
    /// Leg 3: the final confirmation.
    Final,
}

impl VerificationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Return => "return",
            Self::Final => "final",
        }
    }
}

/// Append-only audit of one leg verification. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct CallVerification {
    pub call_id: String,
    pub step: VerificationStep,
    pub expected_ani: Option<String>,
    pub received_ani: Option<String>,
    pub expected_dnis: Option<String>,
    pub received_dnis: Option<String>,
    pub expected_ip: Option<String>,
    pub received_ip: Option<String>,
    pub verified: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        for status in [
            CallStatus::Completed,
            CallStatus::Failed,
            CallStatus::Abandoned,
            CallStatus::Timeout,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            CallStatus::Initiated,
            CallStatus::Active,
            CallStatus::ReturnedFromTransit,
            CallStatus::RoutingToFinal,
        ] {
            assert!(!status.is_terminal());
        }
    }
}
