use chrono::{DateTime, Utc};
use models::Did;

const DID_COLUMNS: &str = r#"
    number, provider_name, in_use, destination,
    allocated_at, released_at, last_used_at, usage_count
"#;

/// Claims the least-recently-used free DID for `provider_name`, or a
/// provider-agnostic row. Contended rows are skipped rather than waited
/// on, so N concurrent allocations against N free rows all succeed.
/// Ties on `last_used_at` break randomly, which round-robins the pool.
pub async fn allocate(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    provider_name: &str,
    destination: &str,
) -> sqlx::Result<Option<String>> {
    let picked = sqlx::query_scalar::<_, String>(
        r#"
        SELECT number FROM dids
        WHERE NOT in_use AND (provider_name = $1 OR provider_name IS NULL)
        ORDER BY last_used_at ASC NULLS FIRST, random()
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(provider_name)
    .fetch_optional(&mut *txn)
    .await?;

    let Some(number) = picked else {
        return Ok(None);
    };

    sqlx::query(
        r#"
        UPDATE dids SET
            in_use = TRUE,
            destination = $2,
            allocated_at = NOW(),
            usage_count = usage_count + 1
        WHERE number = $1
        "#,
    )
    .bind(&number)
    .bind(destination)
    .execute(&mut *txn)
    .await?;

    Ok(Some(number))
}

/// Returns a DID to the pool. Idempotent: releasing a free row changes
/// nothing but the timestamps it would have set anyway are skipped.
pub async fn release(executor: impl sqlx::PgExecutor<'_>, number: &str) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        UPDATE dids SET
            in_use = FALSE,
            destination = NULL,
            released_at = NOW(),
            last_used_at = NOW()
        WHERE number = $1 AND in_use
        "#,
    )
    .bind(number)
    .execute(executor)
    .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn insert_did(
    executor: impl sqlx::PgExecutor<'_>,
    number: &str,
    provider_name: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO dids (number, provider_name) VALUES ($1, $2)
         ON CONFLICT (number) DO UPDATE SET provider_name = EXCLUDED.provider_name",
    )
    .bind(number)
    .bind(provider_name)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn fetch_did(
    executor: impl sqlx::PgExecutor<'_>,
    number: &str,
) -> sqlx::Result<Option<Did>> {
    sqlx::query_as::<_, Did>(&format!("SELECT {DID_COLUMNS} FROM dids WHERE number = $1"))
        .bind(number)
        .fetch_optional(executor)
        .await
}

/// Releases rows still held past `cutoff`; repairs allocations leaked by
/// a crashed process. Returns the repaired numbers for logging.
pub async fn release_stale(
    executor: impl sqlx::PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        r#"
        UPDATE dids SET
            in_use = FALSE,
            destination = NULL,
            released_at = NOW(),
            last_used_at = NOW()
        WHERE in_use AND allocated_at < $1
        RETURNING number
        "#,
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await
}
