use models::{Provider, ProviderKind};

const PROVIDER_COLUMNS: &str = r#"
    name, kind, host, port, auth_mode, auth_username, auth_password,
    codecs, max_channels, priority, weight, cost_per_minute,
    active, health_check_enabled, metadata
"#;

pub async fn fetch_provider(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<Option<Provider>> {
    sqlx::query_as::<_, Provider>(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(executor)
    .await
}

/// All active providers, optionally restricted to a kind.
pub async fn fetch_active_providers(
    executor: impl sqlx::PgExecutor<'_>,
    kind: Option<ProviderKind>,
) -> sqlx::Result<Vec<Provider>> {
    sqlx::query_as::<_, Provider>(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers
         WHERE active AND ($1::provider_kind IS NULL OR kind = $1)
         ORDER BY name"
    ))
    .bind(kind)
    .fetch_all(executor)
    .await
}

pub async fn upsert_provider(
    executor: impl sqlx::PgExecutor<'_>,
    provider: &Provider,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO providers (
            name, kind, host, port, auth_mode, auth_username, auth_password,
            codecs, max_channels, priority, weight, cost_per_minute,
            active, health_check_enabled, metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (name) DO UPDATE SET
            kind = EXCLUDED.kind,
            host = EXCLUDED.host,
            port = EXCLUDED.port,
            auth_mode = EXCLUDED.auth_mode,
            auth_username = EXCLUDED.auth_username,
            auth_password = EXCLUDED.auth_password,
            codecs = EXCLUDED.codecs,
            max_channels = EXCLUDED.max_channels,
            priority = EXCLUDED.priority,
            weight = EXCLUDED.weight,
            cost_per_minute = EXCLUDED.cost_per_minute,
            active = EXCLUDED.active,
            health_check_enabled = EXCLUDED.health_check_enabled,
            metadata = EXCLUDED.metadata,
            updated_at = NOW()
        "#,
    )
    .bind(&provider.name)
    .bind(provider.kind)
    .bind(&provider.host)
    .bind(provider.port)
    .bind(provider.auth_mode)
    .bind(&provider.auth_username)
    .bind(&provider.auth_password)
    .bind(&provider.codecs)
    .bind(provider.max_channels)
    .bind(provider.priority)
    .bind(provider.weight)
    .bind(provider.cost_per_minute)
    .bind(provider.active)
    .bind(provider.health_check_enabled)
    .bind(&provider.metadata)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn delete_provider(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<bool> {
    let done = sqlx::query("DELETE FROM providers WHERE name = $1")
        .bind(name)
        .execute(executor)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Number of routes whose inbound, intermediate, or final ref names this
/// provider directly. Deletion is refused while this is non-zero.
pub async fn routes_referencing(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM provider_routes
        WHERE (inbound_name = $1 AND NOT inbound_is_group)
           OR (intermediate_name = $1 AND NOT intermediate_is_group)
           OR (final_name = $1 AND NOT final_is_group)
        "#,
    )
    .bind(name)
    .fetch_one(executor)
    .await
}
