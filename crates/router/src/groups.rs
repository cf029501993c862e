use crate::Error;
use models::{GroupKind, GroupMember, GroupRule, MatchOperator, Provider, ProviderGroup};
use std::collections::HashMap;
use std::time::Duration;

/// How long resolved membership stays cached.
const MEMBERS_TTL: Duration = Duration::from_secs(60);

/// Resolves a group name into its concrete provider list.
///
/// Rule-driven kinds are evaluated live against the active provider set
/// and unioned with manually-added members; per-member priority/weight
/// overrides from the join table shadow the base provider values.
pub struct GroupResolver {
    pool: sqlx::PgPool,
    cache: std::sync::Arc<cache::Cache>,
}

impl GroupResolver {
    pub fn new(pool: sqlx::PgPool, cache: std::sync::Arc<cache::Cache>) -> Self {
        Self { pool, cache }
    }

    #[tracing::instrument(level = "debug", err(level = "warn"), skip(self))]
    pub async fn members_of(&self, group_name: &str) -> Result<Vec<Provider>, Error> {
        let cache_key = format!("group.members.{group_name}");
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(members) = serde_json::from_str::<Vec<Provider>>(&cached) {
                return Ok(members);
            }
        }

        let Some(group) = tandem_sql::groups::fetch_group(&self.pool, group_name).await? else {
            return Err(Error::ProviderNotFound(format!("group {group_name}")));
        };
        let member_rows = tandem_sql::groups::fetch_members(&self.pool, group_name).await?;
        let providers =
            tandem_sql::providers::fetch_active_providers(&self.pool, group.provider_kind_filter)
                .await?;

        let mut members = evaluate(&group, &member_rows, providers)?;
        apply_overrides(&mut members, &member_rows);

        if let Ok(encoded) = serde_json::to_string(&members) {
            self.cache.set(&cache_key, &encoded, MEMBERS_TTL).await;
        }
        Ok(members)
    }

    /// Re-materializes rule membership into the join table. Rows added
    /// manually survive; rows the rules no longer match are dropped.
    #[tracing::instrument(level = "info", err(level = "warn"), skip(self))]
    pub async fn refresh(&self, group_name: &str) -> Result<usize, Error> {
        let Some(group) = tandem_sql::groups::fetch_group(&self.pool, group_name).await? else {
            return Err(Error::ProviderNotFound(format!("group {group_name}")));
        };
        let providers =
            tandem_sql::providers::fetch_active_providers(&self.pool, group.provider_kind_filter)
                .await?;
        let matched = evaluate(&group, &[], providers)?;

        let mut txn = self.pool.begin().await.map_err(Error::Database)?;
        tandem_sql::groups::clear_rule_members(&mut txn, group_name).await?;
        for provider in &matched {
            tandem_sql::groups::upsert_member(
                &mut txn,
                &GroupMember {
                    group_name: group_name.to_string(),
                    provider_name: provider.name.clone(),
                    added_manually: false,
                    matched_by_rule: true,
                    priority_override: None,
                    weight_override: None,
                },
            )
            .await?;
        }
        txn.commit().await.map_err(Error::Database)?;

        let cache_key = format!("group.members.{group_name}");
        self.cache.delete(&[cache_key.as_str()]).await;
        Ok(matched.len())
    }
}

/// Applies the group's rule to the candidate providers. Manually-added
/// members are honored even when the rule does not match them.
fn evaluate(
    group: &ProviderGroup,
    member_rows: &[GroupMember],
    providers: Vec<Provider>,
) -> Result<Vec<Provider>, Error> {
    let manual: std::collections::HashSet<&str> = member_rows
        .iter()
        .filter(|m| m.added_manually)
        .map(|m| m.provider_name.as_str())
        .collect();

    let keep: Box<dyn Fn(&Provider) -> bool> = match group.kind {
        GroupKind::Manual => {
            let named: std::collections::HashSet<String> = member_rows
                .iter()
                .map(|m| m.provider_name.clone())
                .collect();
            Box::new(move |p| named.contains(&p.name))
        }
        GroupKind::Regex => {
            let Some(pattern) = &group.match_pattern else {
                return Err(Error::Internal(format!(
                    "regex group '{}' has no pattern",
                    group.name
                )));
            };
            let re = regex::Regex::new(pattern).map_err(|err| {
                Error::Internal(format!("group '{}' pattern: {err}", group.name))
            })?;
            Box::new(move |p| re.is_match(&p.name))
        }
        GroupKind::Metadata => {
            let Some(rule) = group.metadata_rule() else {
                return Err(Error::Internal(format!(
                    "metadata group '{}' is missing field, operator, or value",
                    group.name
                )));
            };
            Box::new(move |p| rule_matches(p, &rule))
        }
        GroupKind::Dynamic => {
            let rules = group
                .dynamic_rules()
                .map_err(|err| Error::Internal(format!("group '{}' rules: {err}", group.name)))?;
            Box::new(move |p| rules.iter().all(|rule| rule_matches(p, rule)))
        }
    };

    Ok(providers
        .into_iter()
        .filter(|p| keep(p) || manual.contains(p.name.as_str()))
        .collect())
}

fn apply_overrides(members: &mut [Provider], member_rows: &[GroupMember]) {
    let overrides: HashMap<&str, (&Option<i32>, &Option<i32>)> = member_rows
        .iter()
        .map(|m| {
            (
                m.provider_name.as_str(),
                (&m.priority_override, &m.weight_override),
            )
        })
        .collect();

    for member in members.iter_mut() {
        if let Some((priority, weight)) = overrides.get(member.name.as_str()) {
            if let Some(priority) = priority {
                member.priority = *priority;
            }
            if let Some(weight) = weight {
                member.weight = *weight;
            }
        }
    }
}

/// Evaluates one field/operator/value predicate against a provider.
pub fn rule_matches(provider: &Provider, rule: &GroupRule) -> bool {
    let Some(field) = provider.field(&rule.field) else {
        return false;
    };

    match rule.operator {
        MatchOperator::Equals => field == rule.value,
        MatchOperator::Contains => match (&field, &rule.value) {
            (serde_json::Value::String(hay), serde_json::Value::String(needle)) => {
                hay.contains(needle.as_str())
            }
            (serde_json::Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        MatchOperator::StartsWith => match (as_text(&field), as_text(&rule.value)) {
            (Some(hay), Some(prefix)) => hay.starts_with(&prefix),
            _ => false,
        },
        MatchOperator::EndsWith => match (as_text(&field), as_text(&rule.value)) {
            (Some(hay), Some(suffix)) => hay.ends_with(&suffix),
            _ => false,
        },
        MatchOperator::Regex => match (as_text(&field), as_text(&rule.value)) {
            (Some(hay), Some(pattern)) => regex::Regex::new(&pattern)
                .map(|re| re.is_match(&hay))
                .unwrap_or(false),
            _ => false,
        },
        MatchOperator::In => match &rule.value {
            serde_json::Value::Array(items) => items.contains(&field),
            _ => false,
        },
        MatchOperator::NotIn => match &rule.value {
            serde_json::Value::Array(items) => !items.contains(&field),
            _ => false,
        },
    }
}

fn as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{AuthMode, ProviderKind};

    fn provider(name: &str, metadata: serde_json::Value) -> Provider {
        Provider {
            name: name.to_string(),
            kind: ProviderKind::Transit,
            host: "10.0.0.2".to_string(),
            port: 5060,
            auth_mode: AuthMode::Ip,
            auth_username: None,
            auth_password: None,
            codecs: vec!["ulaw".to_string()],
            max_channels: 0,
            priority: 100,
            weight: 1,
            cost_per_minute: 0.0,
            active: true,
            health_check_enabled: true,
            metadata,
        }
    }

    fn rule(field: &str, operator: MatchOperator, value: serde_json::Value) -> GroupRule {
        GroupRule {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn operators() {
        let p = provider("tr-east-1", serde_json::json!({"region": "us-east", "tier": 2}));

        assert!(rule_matches(&p, &rule("name", MatchOperator::StartsWith, "tr-".into())));
        assert!(rule_matches(&p, &rule("name", MatchOperator::EndsWith, "-1".into())));
        assert!(rule_matches(&p, &rule("name", MatchOperator::Contains, "east".into())));
        assert!(rule_matches(&p, &rule("metadata.region", MatchOperator::Equals, "us-east".into())));
        assert!(rule_matches(&p, &rule("metadata.tier", MatchOperator::Equals, 2.into())));
        assert!(rule_matches(&p, &rule("name", MatchOperator::Regex, "^tr-[a-z]+-\\d$".into())));
        assert!(rule_matches(
            &p,
            &rule("metadata.region", MatchOperator::In, serde_json::json!(["us-east", "us-west"]))
        ));
        assert!(rule_matches(
            &p,
            &rule("metadata.region", MatchOperator::NotIn, serde_json::json!(["eu-west"]))
        ));

        assert!(!rule_matches(&p, &rule("name", MatchOperator::StartsWith, "term".into())));
        assert!(!rule_matches(&p, &rule("metadata.missing", MatchOperator::Equals, "x".into())));
        // An invalid pattern never matches.
        assert!(!rule_matches(&p, &rule("name", MatchOperator::Regex, "[".into())));
    }

    #[test]
    fn codecs_array_contains() {
        let p = provider("tr1", serde_json::json!({}));
        assert!(rule_matches(&p, &rule("codecs", MatchOperator::Contains, "ulaw".into())));
        assert!(!rule_matches(&p, &rule("codecs", MatchOperator::Contains, "g729".into())));
    }

    #[test]
    fn overrides_shadow_base_values() {
        let mut members = vec![provider("tr1", serde_json::json!({}))];
        apply_overrides(
            &mut members,
            &[GroupMember {
                group_name: "g".to_string(),
                provider_name: "tr1".to_string(),
                added_manually: false,
                matched_by_rule: true,
                priority_override: Some(7),
                weight_override: None,
            }],
        );
        assert_eq!(members[0].priority, 7);
        assert_eq!(members[0].weight, 1);
    }

    #[test]
    fn manual_members_survive_rule_groups() {
        let group = ProviderGroup {
            name: "g".to_string(),
            kind: GroupKind::Regex,
            match_pattern: Some("^tr".to_string()),
            match_field: None,
            match_operator: None,
            match_value: None,
            provider_kind_filter: None,
            enabled: true,
            priority: 0,
            metadata: serde_json::Value::Null,
        };
        let member_rows = vec![GroupMember {
            group_name: "g".to_string(),
            provider_name: "special".to_string(),
            added_manually: true,
            matched_by_rule: false,
            priority_override: None,
            weight_override: None,
        }];
        let candidates = vec![
            provider("tr1", serde_json::json!({})),
            provider("special", serde_json::json!({})),
            provider("other", serde_json::json!({})),
        ];

        let members = evaluate(&group, &member_rows, candidates).unwrap();
        let names: Vec<&str> = members.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["tr1", "special"]);
    }

    #[test]
    fn dynamic_rules_and_combine() {
        let group = ProviderGroup {
            name: "g".to_string(),
            kind: GroupKind::Dynamic,
            match_pattern: None,
            match_field: None,
            match_operator: None,
            match_value: None,
            provider_kind_filter: None,
            enabled: true,
            priority: 0,
            metadata: serde_json::json!({
                "rules": [
                    {"field": "name", "operator": "startsWith", "value": "tr"},
                    {"field": "metadata.region", "operator": "equals", "value": "us-east"}
                ]
            }),
        };

        let candidates = vec![
            provider("tr1", serde_json::json!({"region": "us-east"})),
            provider("tr2", serde_json::json!({"region": "eu-west"})),
            provider("xx1", serde_json::json!({"region": "us-east"})),
        ];
        let members = evaluate(&group, &[], candidates).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "tr1");
    }
}
