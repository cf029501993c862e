use serde::{Deserialize, Serialize};

/// The role a provider plays in the three-leg call flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "provider_kind", rename_all = "snake_case")
)]
pub enum ProviderKind {
    /// Hands calls to us: the A-side of leg 1.
    Origination,
    /// Carries the call out and dials our DID back in on leg 2.
    Transit,
    /// Receives the final leg of the call.
    Termination,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Origination => "origination",
            Self::Transit => "transit",
            Self::Termination => "termination",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = crate::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "origination" => Ok(Self::Origination),
            "transit" => Ok(Self::Transit),
            "termination" => Ok(Self::Termination),
            other => Err(crate::ParseEnumError::new("provider kind", other)),
        }
    }
}

/// How the switch authenticates traffic from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "auth_mode", rename_all = "snake_case")
)]
pub enum AuthMode {
    Ip,
    Credentials,
    Both,
}

impl AuthMode {
    /// Whether this mode matches inbound traffic by source address.
    pub fn uses_ip(&self) -> bool {
        matches!(self, Self::Ip | Self::Both)
    }

    /// Whether this mode requires a username/password pair.
    pub fn uses_credentials(&self) -> bool {
        matches!(self, Self::Credentials | Self::Both)
    }
}

/// An external voice endpoint: an origination customer, a transit carrier,
/// or a termination carrier. Providers are referenced by routes either
/// directly by name or through a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct Provider {
    pub name: String,
    pub kind: ProviderKind,
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: i32,
    #[serde(default = "defaults::auth_mode")]
    pub auth_mode: AuthMode,
    /// Present iff `auth_mode.uses_credentials()`.
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default = "defaults::codecs")]
    pub codecs: Vec<String>,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_channels: i32,
    #[serde(default = "defaults::priority")]
    pub priority: i32,
    #[serde(default = "defaults::weight")]
    pub weight: i32,
    /// Cost per minute in fractional currency units, used for reporting.
    #[serde(default)]
    pub cost_per_minute: f64,
    #[serde(default = "defaults::enabled")]
    pub active: bool,
    #[serde(default = "defaults::enabled")]
    pub health_check_enabled: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

mod defaults {
    pub fn port() -> i32 {
        5060
    }
    pub fn auth_mode() -> super::AuthMode {
        super::AuthMode::Ip
    }
    pub fn codecs() -> Vec<String> {
        vec!["ulaw".to_string(), "alaw".to_string()]
    }
    pub fn priority() -> i32 {
        100
    }
    pub fn weight() -> i32 {
        1
    }
    pub fn enabled() -> bool {
        true
    }
}

impl Provider {
    /// Validates the credential invariant: any auth mode other than pure IP
    /// requires a username and password.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_mode.uses_credentials()
            && (self.auth_username.is_none() || self.auth_password.is_none())
        {
            return Err(format!(
                "provider '{}' uses credential auth but has no credentials",
                self.name
            ));
        }
        Ok(())
    }

    /// Looks up a named field for group rule evaluation. Dotted paths under
    /// `metadata.` descend into the provider's metadata document.
    pub fn field(&self, name: &str) -> Option<serde_json::Value> {
        use serde_json::json;

        if let Some(path) = name.strip_prefix("metadata.") {
            let mut cur = &self.metadata;
            for part in path.split('.') {
                cur = cur.get(part)?;
            }
            return Some(cur.clone());
        }
        match name {
            "name" => Some(json!(self.name)),
            "kind" | "type" => Some(json!(self.kind.as_str())),
            "host" => Some(json!(self.host)),
            "port" => Some(json!(self.port)),
            "codecs" => Some(json!(self.codecs)),
            "maxChannels" => Some(json!(self.max_channels)),
            "priority" => Some(json!(self.priority)),
            "weight" => Some(json!(self.weight)),
            "costPerMinute" => Some(json!(self.cost_per_minute)),
            "active" => Some(json!(self.active)),
            "metadata" => Some(self.metadata.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Provider {
        Provider {
            name: "tr1".to_string(),
            kind: ProviderKind::Transit,
            host: "10.0.0.2".to_string(),
            port: 5060,
            auth_mode: AuthMode::Ip,
            auth_username: None,
            auth_password: None,
            codecs: vec!["ulaw".to_string(), "alaw".to_string()],
            max_channels: 10,
            priority: 100,
            weight: 1,
            cost_per_minute: 0.004,
            active: true,
            health_check_enabled: true,
            metadata: serde_json::json!({"region": "us-east", "tier": {"level": 2}}),
        }
    }

    #[test]
    fn credential_invariant() {
        let mut p = provider();
        assert!(p.validate().is_ok());

        p.auth_mode = AuthMode::Credentials;
        assert!(p.validate().is_err());

        p.auth_username = Some("user".to_string());
        p.auth_password = Some("pass".to_string());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn field_lookup() {
        let p = provider();
        assert_eq!(p.field("name"), Some(serde_json::json!("tr1")));
        assert_eq!(p.field("kind"), Some(serde_json::json!("transit")));
        assert_eq!(p.field("metadata.region"), Some(serde_json::json!("us-east")));
        assert_eq!(p.field("metadata.tier.level"), Some(serde_json::json!(2)));
        assert_eq!(p.field("metadata.missing"), None);
        assert_eq!(p.field("bogus"), None);
    }
}
