use models::ProviderHealth;

/// Writes back one provider's live counters. The in-memory tracker is
/// authoritative between writes.
pub async fn upsert(
    executor: impl sqlx::PgExecutor<'_>,
    health: &ProviderHealth,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_health (
            provider_name, active_calls, total_calls, failed_calls,
            consecutive_failures, last_success, last_failure,
            health_score, is_healthy, avg_response_time_ms, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
        ON CONFLICT (provider_name) DO UPDATE SET
            active_calls = EXCLUDED.active_calls,
            total_calls = EXCLUDED.total_calls,
            failed_calls = EXCLUDED.failed_calls,
            consecutive_failures = EXCLUDED.consecutive_failures,
            last_success = EXCLUDED.last_success,
            last_failure = EXCLUDED.last_failure,
            health_score = EXCLUDED.health_score,
            is_healthy = EXCLUDED.is_healthy,
            avg_response_time_ms = EXCLUDED.avg_response_time_ms,
            updated_at = NOW()
        "#,
    )
    .bind(&health.provider_name)
    .bind(health.active_calls)
    .bind(health.total_calls)
    .bind(health.failed_calls)
    .bind(health.consecutive_failures)
    .bind(health.last_success)
    .bind(health.last_failure)
    .bind(health.health_score)
    .bind(health.is_healthy)
    .bind(health.avg_response_time_ms)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn fetch(
    executor: impl sqlx::PgExecutor<'_>,
    provider_name: &str,
) -> sqlx::Result<Option<ProviderHealth>> {
    sqlx::query_as::<_, ProviderHealth>(
        r#"
        SELECT provider_name, active_calls, total_calls, failed_calls,
               consecutive_failures, last_success, last_failure,
               health_score, is_healthy, avg_response_time_ms, updated_at
        FROM provider_health
        WHERE provider_name = $1
        "#,
    )
    .bind(provider_name)
    .fetch_optional(executor)
    .await
}
