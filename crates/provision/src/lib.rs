//! Provider administration: the provider row and its switch realtime rows
//! are written together, and the switch is asked to reload afterwards.

use models::Provider;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid provider: {0}")]
    Validation(String),
    #[error("provider '{name}' is referenced by {routes} route(s)")]
    InUse { name: String, routes: i64 },
    #[error("provider '{0}' not found")]
    NotFound(String),
}

/// Qualify frequency written to the AOR when health checks are on.
const QUALIFY_FREQUENCY: i64 = 60;

pub struct ProviderAdmin {
    pool: sqlx::PgPool,
    switch: Option<ami::Client>,
}

fn endpoint_id(name: &str) -> String {
    format!("endpoint-{name}")
}

fn auth_id(name: &str) -> String {
    format!("auth-{name}")
}

fn identify_id(name: &str) -> String {
    format!("identify-{name}")
}

impl ProviderAdmin {
    /// `switch` is optional so administrative runs can proceed while the
    /// switch is down; the realtime rows are reloaded on its next start.
    pub fn new(pool: sqlx::PgPool, switch: Option<ami::Client>) -> Self {
        Self { pool, switch }
    }

    /// Creates or updates a provider and its realtime rows in one
    /// transaction, then requests an endpoint reload.
    #[tracing::instrument(level = "info", err(level = "warn"), skip(self, provider), fields(provider = %provider.name))]
    pub async fn upsert(&self, provider: &Provider) -> Result<(), Error> {
        provider.validate().map_err(Error::Validation)?;

        let endpoint = endpoint_id(&provider.name);
        let auth = auth_id(&provider.name);

        let mut txn = self.pool.begin().await?;

        tandem_sql::providers::upsert_provider(&mut txn, provider).await?;

        let contact = format!("sip:{}:{}", provider.host, provider.port);
        let qualify = if provider.health_check_enabled {
            QUALIFY_FREQUENCY
        } else {
            0
        };
        tandem_sql::switch_config::upsert_aor(&mut txn, &endpoint, &contact, qualify).await?;

        let uses_credentials = provider.auth_mode.uses_credentials();
        if uses_credentials {
            tandem_sql::switch_config::upsert_auth(
                &mut txn,
                &auth,
                provider.auth_username.as_deref().unwrap_or_default(),
                provider.auth_password.as_deref().unwrap_or_default(),
            )
            .await?;
        }

        tandem_sql::switch_config::upsert_endpoint(
            &mut txn,
            tandem_sql::switch_config::EndpointRow {
                id: &endpoint,
                transport: "transport-udp",
                aors: &endpoint,
                auth: uses_credentials.then_some(auth.as_str()),
                context: inbound_context(provider),
                allow: &provider.codecs.join(","),
                identify_by: if provider.auth_mode.uses_ip() {
                    "ip"
                } else {
                    "username"
                },
                outbound_auth: uses_credentials.then_some(auth.as_str()),
                from_user: provider.auth_username.as_deref(),
            },
        )
        .await?;

        if provider.auth_mode.uses_ip() {
            tandem_sql::switch_config::upsert_identify(
                &mut txn,
                &identify_id(&provider.name),
                &endpoint,
                &provider.host,
            )
            .await?;
        }

        tandem_sql::audit::record(
            &mut txn,
            "provision",
            "upsert",
            &provider.name,
            serde_json::json!({
                "kind": provider.kind,
                "host": provider.host,
                "authMode": provider.auth_mode,
            }),
        )
        .await?;

        txn.commit().await?;

        self.reload().await;
        Ok(())
    }

    /// Deletes a provider and reverses its realtime rows. Refused while
    /// any route still references the provider directly.
    #[tracing::instrument(level = "info", err(level = "warn"), skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        let routes = tandem_sql::providers::routes_referencing(&self.pool, name).await?;
        if routes > 0 {
            return Err(Error::InUse {
                name: name.to_string(),
                routes,
            });
        }

        let mut txn = self.pool.begin().await?;
        tandem_sql::switch_config::delete_endpoint_rows(
            &mut txn,
            &endpoint_id(name),
            &auth_id(name),
        )
        .await?;
        if !tandem_sql::providers::delete_provider(&mut txn, name).await? {
            return Err(Error::NotFound(name.to_string()));
        }
        tandem_sql::audit::record(
            &mut txn,
            "provision",
            "delete",
            name,
            serde_json::json!({}),
        )
        .await?;
        txn.commit().await?;

        self.reload().await;
        Ok(())
    }

    /// Endpoint reload is best-effort: the rows are durable, and a switch
    /// that is down will read them when it returns.
    async fn reload(&self) {
        let Some(switch) = &self.switch else {
            tracing::debug!("no switch client, skipping reload");
            return;
        };
        if let Err(err) = switch.reload_endpoints().await {
            tracing::warn!(%err, "endpoint reload failed; realtime rows are committed");
        }
    }
}

fn inbound_context(provider: &Provider) -> &'static str {
    match provider.kind {
        models::ProviderKind::Origination => "from-origination",
        models::ProviderKind::Transit | models::ProviderKind::Termination => "from-transit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{AuthMode, ProviderKind};

    #[test]
    fn row_ids() {
        assert_eq!(endpoint_id("tr1"), "endpoint-tr1");
        assert_eq!(auth_id("tr1"), "auth-tr1");
        assert_eq!(identify_id("tr1"), "identify-tr1");
    }

    #[test]
    fn contexts_by_kind() {
        let mut provider = Provider {
            name: "p".to_string(),
            kind: ProviderKind::Origination,
            host: "10.0.0.1".to_string(),
            port: 5060,
            auth_mode: AuthMode::Ip,
            auth_username: None,
            auth_password: None,
            codecs: vec![],
            max_channels: 0,
            priority: 0,
            weight: 0,
            cost_per_minute: 0.0,
            active: true,
            health_check_enabled: true,
            metadata: serde_json::Value::Null,
        };
        assert_eq!(inbound_context(&provider), "from-origination");
        provider.kind = ProviderKind::Transit;
        assert_eq!(inbound_context(&provider), "from-transit");
    }
}
