use models::Route;

const ROUTE_COLUMNS: &str = r#"
    name, inbound_name, inbound_is_group, intermediate_name, intermediate_is_group,
    final_name, final_is_group, load_balance_mode, priority, weight,
    max_concurrent_calls, current_calls, enabled, failover_routes
"#;

pub async fn fetch_route(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<Option<Route>> {
    sqlx::query_as::<_, Route>(&format!(
        "SELECT {ROUTE_COLUMNS} FROM provider_routes WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(executor)
    .await
}

/// Enabled routes whose inbound ref is the provider itself, or a group
/// whose materialized membership contains it. Highest priority first.
pub async fn routes_for_inbound(
    executor: impl sqlx::PgExecutor<'_>,
    provider_name: &str,
) -> sqlx::Result<Vec<Route>> {
    sqlx::query_as::<_, Route>(&format!(
        r#"
        SELECT {ROUTE_COLUMNS} FROM provider_routes
        WHERE enabled AND (
            (NOT inbound_is_group AND inbound_name = $1)
            OR (inbound_is_group AND inbound_name IN (
                SELECT group_name FROM provider_group_members WHERE provider_name = $1))
        )
        ORDER BY priority DESC, name
        "#
    ))
    .bind(provider_name)
    .fetch_all(executor)
    .await
}

pub async fn upsert_route(
    executor: impl sqlx::PgExecutor<'_>,
    route: &Route,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_routes (
            name, inbound_name, inbound_is_group, intermediate_name, intermediate_is_group,
            final_name, final_is_group, load_balance_mode, priority, weight,
            max_concurrent_calls, current_calls, enabled, failover_routes
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (name) DO UPDATE SET
            inbound_name = EXCLUDED.inbound_name,
            inbound_is_group = EXCLUDED.inbound_is_group,
            intermediate_name = EXCLUDED.intermediate_name,
            intermediate_is_group = EXCLUDED.intermediate_is_group,
            final_name = EXCLUDED.final_name,
            final_is_group = EXCLUDED.final_is_group,
            load_balance_mode = EXCLUDED.load_balance_mode,
            priority = EXCLUDED.priority,
            weight = EXCLUDED.weight,
            max_concurrent_calls = EXCLUDED.max_concurrent_calls,
            enabled = EXCLUDED.enabled,
            failover_routes = EXCLUDED.failover_routes,
            updated_at = NOW()
        "#,
    )
    .bind(&route.name)
    .bind(&route.inbound_name)
    .bind(route.inbound_is_group)
    .bind(&route.intermediate_name)
    .bind(route.intermediate_is_group)
    .bind(&route.final_name)
    .bind(route.final_is_group)
    .bind(route.load_balance_mode)
    .bind(route.priority)
    .bind(route.weight)
    .bind(route.max_concurrent_calls)
    .bind(route.current_calls)
    .bind(route.enabled)
    .bind(&route.failover_routes)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn delete_route(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<bool> {
    let done = sqlx::query("DELETE FROM provider_routes WHERE name = $1")
        .bind(name)
        .execute(executor)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Admits one more call, returning false when the route is at capacity.
/// The capacity check and increment are a single statement, so two racing
/// admissions cannot both land on the last slot.
pub async fn try_increment_calls(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        UPDATE provider_routes
        SET current_calls = current_calls + 1, updated_at = NOW()
        WHERE name = $1
          AND (max_concurrent_calls = 0 OR current_calls < max_concurrent_calls)
        "#,
    )
    .bind(name)
    .execute(executor)
    .await?;
    Ok(done.rows_affected() > 0)
}

/// Releases one call slot, clamping at zero.
pub async fn decrement_calls(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE provider_routes
        SET current_calls = GREATEST(current_calls - 1, 0), updated_at = NOW()
        WHERE name = $1
        "#,
    )
    .bind(name)
    .execute(executor)
    .await
    .map(|_| ())
}
