use models::VerificationStep;

/// Appends one verification audit row. Rows are never updated or deleted.
pub struct NewVerification<'a> {
    pub call_id: &'a str,
    pub step: VerificationStep,
    pub expected_ani: Option<&'a str>,
    pub received_ani: Option<&'a str>,
    pub expected_dnis: Option<&'a str>,
    pub received_dnis: Option<&'a str>,
    pub expected_ip: Option<&'a str>,
    pub received_ip: Option<&'a str>,
    pub verified: bool,
    pub failure_reason: Option<&'a str>,
}

pub async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    row: NewVerification<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO call_verifications (
            call_id, step, expected_ani, received_ani, expected_dnis, received_dnis,
            expected_ip, received_ip, verified, failure_reason
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(row.call_id)
    .bind(row.step)
    .bind(row.expected_ani)
    .bind(row.received_ani)
    .bind(row.expected_dnis)
    .bind(row.received_dnis)
    .bind(row.expected_ip)
    .bind(row.received_ip)
    .bind(row.verified)
    .bind(row.failure_reason)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn fetch_for_call(
    executor: impl sqlx::PgExecutor<'_>,
    call_id: &str,
) -> sqlx::Result<Vec<models::CallVerification>> {
    sqlx::query_as::<_, models::CallVerification>(
        r#"
        SELECT call_id, step, expected_ani, received_ani, expected_dnis, received_dnis,
               expected_ip, received_ip, verified, failure_reason, created_at
        FROM call_verifications
        WHERE call_id = $1
        ORDER BY id
        "#,
    )
    .bind(call_id)
    .fetch_all(executor)
    .await
}
