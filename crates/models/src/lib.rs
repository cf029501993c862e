mod call;
mod did;
mod group;
mod health;
mod provider;
mod route;

pub use call::{CallRecord, CallStatus, CallStep, CallVerification, VerificationStep};
pub use did::Did;
pub use group::{GroupKind, GroupMember, GroupRule, MatchOperator, ProviderGroup};
pub use health::ProviderHealth;
pub use provider::{AuthMode, Provider, ProviderKind};
pub use route::{LoadBalanceMode, Route, RouteRef};

/// Error returned when parsing one of the model enums from its wire form.
#[derive(Debug, thiserror::Error)]
#[error("'{value}' is not a valid {kind}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
