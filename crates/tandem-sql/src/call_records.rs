use chrono::{DateTime, Utc};
use models::{CallRecord, CallStatus, CallStep};

const CALL_COLUMNS: &str = r#"
    call_id, original_ani, original_dnis, transformed_ani, assigned_did,
    inbound_provider, intermediate_provider, final_provider, route_name,
    status, current_step, start_time, answer_time, end_time,
    duration, billable_duration, recording_path, failure_reason, metadata
"#;

pub async fn insert(
    executor: impl sqlx::PgExecutor<'_>,
    record: &CallRecord,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO call_records (
            call_id, original_ani, original_dnis, transformed_ani, assigned_did,
            inbound_provider, intermediate_provider, final_provider, route_name,
            status, current_step, start_time, metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(&record.call_id)
    .bind(&record.original_ani)
    .bind(&record.original_dnis)
    .bind(&record.transformed_ani)
    .bind(&record.assigned_did)
    .bind(&record.inbound_provider)
    .bind(&record.intermediate_provider)
    .bind(&record.final_provider)
    .bind(&record.route_name)
    .bind(record.status)
    .bind(record.current_step)
    .bind(record.start_time)
    .bind(&record.metadata)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn fetch(
    executor: impl sqlx::PgExecutor<'_>,
    call_id: &str,
) -> sqlx::Result<Option<CallRecord>> {
    sqlx::query_as::<_, CallRecord>(&format!(
        "SELECT {CALL_COLUMNS} FROM call_records WHERE call_id = $1"
    ))
    .bind(call_id)
    .fetch_optional(executor)
    .await
}

/// Marks the leg-2 transition: the transit provider dialed our DID back.
pub async fn mark_returned(
    executor: impl sqlx::PgExecutor<'_>,
    call_id: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE call_records SET status = $2, current_step = $3 WHERE call_id = $1",
    )
    .bind(call_id)
    .bind(CallStatus::ReturnedFromTransit)
    .bind(CallStep::ToRouter)
    .execute(executor)
    .await
    .map(|_| ())
}

/// Terminalizes the record with final timing and status. Only a completed
/// call advances to the termination step; failures keep the step they
/// died on.
pub async fn finalize(
    executor: impl sqlx::PgExecutor<'_>,
    call_id: &str,
    status: CallStatus,
    end_time: DateTime<Utc>,
    duration: i64,
    billable_duration: i64,
    failure_reason: Option<&str>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE call_records SET
            status = $2,
            current_step = CASE WHEN $2 = 'completed'::call_status
                                THEN $3 ELSE current_step END,
            end_time = $4,
            duration = $5,
            billable_duration = $6,
            failure_reason = COALESCE($7, failure_reason)
        WHERE call_id = $1
        "#,
    )
    .bind(call_id)
    .bind(status)
    .bind(CallStep::ToTermination)
    .bind(end_time)
    .bind(duration)
    .bind(billable_duration)
    .bind(failure_reason)
    .execute(executor)
    .await
    .map(|_| ())
}

/// Non-terminal records, oldest first; used to rebuild the in-memory map
/// and by the stale sweeper's crash-recovery path.
pub async fn fetch_open_records(
    executor: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<CallRecord>> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE status IN ('initiated', 'active', 'returned_from_transit', 'routing_to_final')
        ORDER BY start_time
        "#
    ))
    .fetch_all(executor)
    .await
}

/// Oldest active record matching the (ani, dnis) pair. Leg-3 falls back
/// to this probe when the switch reports an unknown call id.
pub async fn fetch_oldest_active_by_pair(
    executor: impl sqlx::PgExecutor<'_>,
    ani: &str,
    dnis: &str,
) -> sqlx::Result<Option<CallRecord>> {
    sqlx::query_as::<_, CallRecord>(&format!(
        r#"
        SELECT {CALL_COLUMNS} FROM call_records
        WHERE original_ani = $1 AND original_dnis = $2
          AND status IN ('initiated', 'active', 'returned_from_transit', 'routing_to_final')
        ORDER BY start_time
        LIMIT 1
        "#
    ))
    .bind(ani)
    .bind(dnis)
    .fetch_optional(executor)
    .await
}
