use models::{GroupMember, ProviderGroup};

const GROUP_COLUMNS: &str = r#"
    name, kind, match_pattern, match_field, match_operator, match_value,
    provider_kind_filter, enabled, priority, metadata
"#;

pub async fn fetch_group(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<Option<ProviderGroup>> {
    sqlx::query_as::<_, ProviderGroup>(&format!(
        "SELECT {GROUP_COLUMNS} FROM provider_groups WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(executor)
    .await
}

pub async fn fetch_enabled_groups(
    executor: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<ProviderGroup>> {
    sqlx::query_as::<_, ProviderGroup>(&format!(
        "SELECT {GROUP_COLUMNS} FROM provider_groups WHERE enabled ORDER BY priority DESC, name"
    ))
    .fetch_all(executor)
    .await
}

pub async fn upsert_group(
    executor: impl sqlx::PgExecutor<'_>,
    group: &ProviderGroup,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_groups (
            name, kind, match_pattern, match_field, match_operator, match_value,
            provider_kind_filter, enabled, priority, metadata
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (name) DO UPDATE SET
            kind = EXCLUDED.kind,
            match_pattern = EXCLUDED.match_pattern,
            match_field = EXCLUDED.match_field,
            match_operator = EXCLUDED.match_operator,
            match_value = EXCLUDED.match_value,
            provider_kind_filter = EXCLUDED.provider_kind_filter,
            enabled = EXCLUDED.enabled,
            priority = EXCLUDED.priority,
            metadata = EXCLUDED.metadata,
            updated_at = NOW()
        "#,
    )
    .bind(&group.name)
    .bind(group.kind)
    .bind(&group.match_pattern)
    .bind(&group.match_field)
    .bind(&group.match_operator)
    .bind(&group.match_value)
    .bind(group.provider_kind_filter)
    .bind(group.enabled)
    .bind(group.priority)
    .bind(&group.metadata)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn delete_group(
    executor: impl sqlx::PgExecutor<'_>,
    name: &str,
) -> sqlx::Result<bool> {
    let done = sqlx::query("DELETE FROM provider_groups WHERE name = $1")
        .bind(name)
        .execute(executor)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn fetch_members(
    executor: impl sqlx::PgExecutor<'_>,
    group_name: &str,
) -> sqlx::Result<Vec<GroupMember>> {
    sqlx::query_as::<_, GroupMember>(
        r#"
        SELECT group_name, provider_name, added_manually, matched_by_rule,
               priority_override, weight_override
        FROM provider_group_members
        WHERE group_name = $1
        ORDER BY provider_name
        "#,
    )
    .bind(group_name)
    .fetch_all(executor)
    .await
}

pub async fn upsert_member(
    executor: impl sqlx::PgExecutor<'_>,
    member: &GroupMember,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provider_group_members (
            group_name, provider_name, added_manually, matched_by_rule,
            priority_override, weight_override
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (group_name, provider_name) DO UPDATE SET
            added_manually = provider_group_members.added_manually OR EXCLUDED.added_manually,
            matched_by_rule = EXCLUDED.matched_by_rule,
            priority_override = EXCLUDED.priority_override,
            weight_override = EXCLUDED.weight_override
        "#,
    )
    .bind(&member.group_name)
    .bind(&member.provider_name)
    .bind(member.added_manually)
    .bind(member.matched_by_rule)
    .bind(member.priority_override)
    .bind(member.weight_override)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn delete_member(
    executor: impl sqlx::PgExecutor<'_>,
    group_name: &str,
    provider_name: &str,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        "DELETE FROM provider_group_members WHERE group_name = $1 AND provider_name = $2",
    )
    .bind(group_name)
    .bind(provider_name)
    .execute(executor)
    .await?;
    Ok(done.rows_affected() > 0)
}

/// Removes rule-matched members ahead of repopulation. Members added
/// manually survive.
pub async fn clear_rule_members(
    executor: impl sqlx::PgExecutor<'_>,
    group_name: &str,
) -> sqlx::Result<u64> {
    let done = sqlx::query(
        "DELETE FROM provider_group_members
         WHERE group_name = $1 AND matched_by_rule AND NOT added_manually",
    )
    .bind(group_name)
    .execute(executor)
    .await?;
    Ok(done.rows_affected())
}

/// Group names that contain `provider_name` in their materialized
/// membership. Used by route resolution for group-typed inbound refs.
pub async fn groups_containing(
    executor: impl sqlx::PgExecutor<'_>,
    provider_name: &str,
) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT group_name FROM provider_group_members WHERE provider_name = $1",
    )
    .bind(provider_name)
    .fetch_all(executor)
    .await
}
