use super::ProviderKind;
use serde::{Deserialize, Serialize};

/// How a group decides its membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "group_kind", rename_all = "snake_case")
)]
pub enum GroupKind {
    /// Membership is exactly the stored member rows.
    Manual,
    /// Provider names matching a pattern.
    Regex,
    /// A single field/operator/value rule.
    Metadata,
    /// A conjunction of rules carried in the group's metadata.
    Dynamic,
}

/// Comparison operator of a metadata or dynamic rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    In,
    NotIn,
}

/// One field/operator/value predicate over a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRule {
    pub field: String,
    pub operator: MatchOperator,
    pub value: serde_json::Value,
}

/// A named, possibly rule-driven, set of providers that routes may
/// reference as a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct ProviderGroup {
    pub name: String,
    pub kind: GroupKind,
    /// Regex pattern for `Regex` groups.
    #[serde(default)]
    pub match_pattern: Option<String>,
    /// Field name for `Metadata` groups.
    #[serde(default)]
    pub match_field: Option<String>,
    /// Operator for `Metadata` groups, in its wire spelling.
    #[serde(default)]
    pub match_operator: Option<String>,
    /// Value for `Metadata` groups; opaque JSON parsed at evaluation.
    #[serde(default)]
    pub match_value: Option<serde_json::Value>,
    /// Restricts members to providers of this kind, when set.
    #[serde(default)]
    pub provider_kind_filter: Option<ProviderKind>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    /// Dynamic groups carry their rule list under a `rules` key here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

impl ProviderGroup {
    /// The rule list of a `Dynamic` group, decoded from metadata.
    pub fn dynamic_rules(&self) -> Result<Vec<GroupRule>, serde_json::Error> {
        match self.metadata.get("rules") {
            Some(rules) => serde_json::from_value(rules.clone()),
            None => Ok(Vec::new()),
        }
    }

    /// The single rule of a `Metadata` group, if its parts are present.
    pub fn metadata_rule(&self) -> Option<GroupRule> {
        let operator: MatchOperator =
            serde_json::from_value(serde_json::Value::String(self.match_operator.clone()?)).ok()?;
        Some(GroupRule {
            field: self.match_field.clone()?,
            operator,
            value: self.match_value.clone()?,
        })
    }
}

/// Materialized membership row. `added_manually` members survive rule
/// repopulation; `matched_by_rule` members are replaced by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct GroupMember {
    pub group_name: String,
    pub provider_name: String,
    pub added_manually: bool,
    pub matched_by_rule: bool,
    pub priority_override: Option<i32>,
    pub weight_override: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_rules_decode() {
        let group = ProviderGroup {
            name: "us-transit".to_string(),
            kind: GroupKind::Dynamic,
            match_pattern: None,
            match_field: None,
            match_operator: None,
            match_value: None,
            provider_kind_filter: Some(ProviderKind::Transit),
            enabled: true,
            priority: 10,
            metadata: serde_json::json!({
                "rules": [
                    {"field": "metadata.region", "operator": "equals", "value": "us-east"},
                    {"field": "name", "operator": "startsWith", "value": "tr"}
                ]
            }),
        };

        let rules = group.dynamic_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].field, "metadata.region");
        assert!(matches!(rules[1].operator, MatchOperator::StartsWith));
    }

    #[test]
    fn metadata_rule_requires_all_parts() {
        let mut group = ProviderGroup {
            name: "g".to_string(),
            kind: GroupKind::Metadata,
            match_pattern: None,
            match_field: Some("host".to_string()),
            match_operator: Some("contains".to_string()),
            match_value: Some(serde_json::json!("10.0.")),
            provider_kind_filter: None,
            enabled: true,
            priority: 0,
            metadata: serde_json::Value::Null,
        };
        assert!(group.metadata_rule().is_some());

        group.match_operator = None;
        assert!(group.metadata_rule().is_none());
    }
}
