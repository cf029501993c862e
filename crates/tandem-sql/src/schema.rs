use sqlx::Executor;

/// Idempotent DDL for the router's own tables plus the switch realtime
/// tables written by provisioning.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Applies the schema. Run from the daemon's `--bootstrap` mode; every
/// statement is a no-op when the object already exists.
pub async fn bootstrap(pool: &sqlx::PgPool) -> sqlx::Result<()> {
    let mut conn = pool.acquire().await?;
    conn.execute(SCHEMA).await?;
    Ok(())
}
