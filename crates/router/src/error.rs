/// Stable error kinds of the router. `kind_str` labels metrics and audit
/// rows; `hangup_cause` maps onto the switch cause code used to tear the
/// call down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("no DID available for provider '{0}'")]
    DidUnavailable(String),
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),
    #[error("no route for inbound provider '{0}'")]
    RouteNotFound(String),
    #[error("route '{0}' is at capacity")]
    QuotaExceeded(String),
    #[error("verification failed: {0}")]
    AuthFailed(String),
    #[error("invalid source address '{0}'")]
    InvalidIp(String),
    #[error("unknown call '{0}'")]
    CallNotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid command '{0}'")]
    InvalidCommand(String),
}

impl Error {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Database(_) => "Database",
            Self::Cache(_) => "Cache",
            Self::DidUnavailable(_) => "DIDUnavailable",
            Self::ProviderNotFound(_) => "ProviderNotFound",
            Self::RouteNotFound(_) => "RouteNotFound",
            Self::QuotaExceeded(_) => "QuotaExceeded",
            Self::AuthFailed(_) => "AuthFailed",
            Self::InvalidIp(_) => "InvalidIP",
            Self::CallNotFound(_) => "CallNotFound",
            Self::Timeout(_) => "Timeout",
            Self::Internal(_) => "Internal",
            Self::InvalidCommand(_) => "InvalidCommand",
        }
    }

    /// Switch hangup cause used when this error tears a call down.
    pub fn hangup_cause(&self) -> u32 {
        match self {
            Self::QuotaExceeded(_) => 5,
            // Call rejected.
            _ => 21,
        }
    }
}
