/// Appends one audit row. The log is append-only; there is no update or
/// delete surface.
pub async fn record(
    executor: impl sqlx::PgExecutor<'_>,
    actor: &str,
    action: &str,
    entity: &str,
    detail: serde_json::Value,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (actor, action, entity, detail) VALUES ($1, $2, $3, $4)",
    )
    .bind(actor)
    .bind(action)
    .bind(entity)
    .bind(detail)
    .execute(executor)
    .await
    .map(|_| ())
}
