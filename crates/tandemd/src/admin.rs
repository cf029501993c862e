//! One-shot administrative commands: routes, groups, and DID pool loads.
//! Each mutation leaves an audit row.

use anyhow::Context;
use std::path::Path;

pub async fn upsert_route(pool: &sqlx::PgPool, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let route: models::Route = serde_yaml::from_str(&raw).context("invalid route definition")?;

    let mut txn = pool.begin().await?;
    tandem_sql::routes::upsert_route(&mut txn, &route).await?;
    tandem_sql::audit::record(
        &mut txn,
        "admin",
        "upsert-route",
        &route.name,
        serde_json::json!({
            "inbound": route.inbound_name,
            "intermediate": route.intermediate_name,
            "final": route.final_name,
            "mode": route.load_balance_mode,
        }),
    )
    .await?;
    txn.commit().await?;

    tracing::info!(route = %route.name, "route upserted");
    Ok(())
}

pub async fn delete_route(pool: &sqlx::PgPool, name: &str) -> anyhow::Result<()> {
    let mut txn = pool.begin().await?;
    if !tandem_sql::routes::delete_route(&mut txn, name).await? {
        anyhow::bail!("route '{name}' does not exist");
    }
    tandem_sql::audit::record(&mut txn, "admin", "delete-route", name, serde_json::json!({}))
        .await?;
    txn.commit().await?;

    tracing::info!(route = %name, "route deleted");
    Ok(())
}

/// Creates or updates a group and materializes its rule membership.
pub async fn upsert_group(pool: &sqlx::PgPool, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let group: models::ProviderGroup =
        serde_yaml::from_str(&raw).context("invalid group definition")?;

    let mut txn = pool.begin().await?;
    tandem_sql::groups::upsert_group(&mut txn, &group).await?;
    tandem_sql::audit::record(
        &mut txn,
        "admin",
        "upsert-group",
        &group.name,
        serde_json::json!({ "kind": group.kind }),
    )
    .await?;
    txn.commit().await?;

    let materialized = refresh_group(pool, &group.name).await?;
    tracing::info!(group = %group.name, materialized, "group upserted");
    Ok(())
}

/// Re-evaluates a group's rules into the membership table. Manual members
/// survive.
pub async fn refresh_group(pool: &sqlx::PgPool, name: &str) -> anyhow::Result<usize> {
    let resolver = router::GroupResolver::new(
        pool.clone(),
        std::sync::Arc::new(cache::Cache::disabled()),
    );
    let count = resolver
        .refresh(name)
        .await
        .with_context(|| format!("failed to refresh group '{name}'"))?;
    tandem_sql::audit::record(
        pool,
        "admin",
        "refresh-group",
        name,
        serde_json::json!({ "members": count }),
    )
    .await?;
    Ok(count)
}

/// Adds a provider to a group by hand. Manual members survive rule
/// repopulation, which is the only way to populate a `manual` group at
/// all.
pub async fn add_group_member(
    pool: &sqlx::PgPool,
    group: &str,
    provider: &str,
    priority: Option<i32>,
    weight: Option<i32>,
) -> anyhow::Result<()> {
    if tandem_sql::groups::fetch_group(pool, group).await?.is_none() {
        anyhow::bail!("group '{group}' does not exist");
    }
    if tandem_sql::providers::fetch_provider(pool, provider)
        .await?
        .is_none()
    {
        anyhow::bail!("provider '{provider}' does not exist");
    }

    let mut txn = pool.begin().await?;
    tandem_sql::groups::upsert_member(
        &mut txn,
        &models::GroupMember {
            group_name: group.to_string(),
            provider_name: provider.to_string(),
            added_manually: true,
            matched_by_rule: false,
            priority_override: priority,
            weight_override: weight,
        },
    )
    .await?;
    tandem_sql::audit::record(
        &mut txn,
        "admin",
        "add-group-member",
        group,
        serde_json::json!({
            "provider": provider,
            "priority": priority,
            "weight": weight,
        }),
    )
    .await?;
    txn.commit().await?;

    tracing::info!(group = %group, provider = %provider, "group member added");
    Ok(())
}

pub async fn remove_group_member(
    pool: &sqlx::PgPool,
    group: &str,
    provider: &str,
) -> anyhow::Result<()> {
    let mut txn = pool.begin().await?;
    if !tandem_sql::groups::delete_member(&mut txn, group, provider).await? {
        anyhow::bail!("provider '{provider}' is not a member of group '{group}'");
    }
    tandem_sql::audit::record(
        &mut txn,
        "admin",
        "remove-group-member",
        group,
        serde_json::json!({ "provider": provider }),
    )
    .await?;
    txn.commit().await?;

    tracing::info!(group = %group, provider = %provider, "group member removed");
    Ok(())
}

pub async fn delete_group(pool: &sqlx::PgPool, name: &str) -> anyhow::Result<()> {
    let mut txn = pool.begin().await?;
    if !tandem_sql::groups::delete_group(&mut txn, name).await? {
        anyhow::bail!("group '{name}' does not exist");
    }
    tandem_sql::audit::record(&mut txn, "admin", "delete-group", name, serde_json::json!({}))
        .await?;
    txn.commit().await?;

    tracing::info!(group = %name, "group deleted");
    Ok(())
}

/// Loads DID numbers into the pool, one per line; blank lines and
/// `#`-comments are skipped. Existing rows are re-owned, not reset.
pub async fn load_dids(
    pool: &sqlx::PgPool,
    file: &Path,
    provider: Option<&str>,
) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let numbers: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    if numbers.is_empty() {
        anyhow::bail!("{} contains no numbers", file.display());
    }

    let mut txn = pool.begin().await?;
    for number in &numbers {
        tandem_sql::dids::insert_did(&mut txn, number, provider).await?;
    }
    tandem_sql::audit::record(
        &mut txn,
        "admin",
        "load-dids",
        provider.unwrap_or("any"),
        serde_json::json!({ "count": numbers.len() }),
    )
    .await?;
    txn.commit().await?;

    tracing::info!(
        count = numbers.len(),
        provider = provider.unwrap_or("any"),
        "DIDs loaded"
    );
    Ok(numbers.len())
}

#[cfg(test)]
mod tests {
    #[test]
    fn did_file_parsing_skips_noise() {
        let raw = "# transit pool\n1000\n\n 1001 \n#1002\n";
        let numbers: Vec<&str> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        assert_eq!(numbers, ["1000", "1001"]);
    }
}
