use serde::{Deserialize, Serialize};

/// Discipline used to pick one provider from a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx-support",
    sqlx(type_name = "lb_mode", rename_all = "snake_case")
)]
pub enum LoadBalanceMode {
    RoundRobin,
    Weighted,
    Priority,
    Failover,
    LeastConnections,
    ResponseTime,
    Hash,
}

impl Default for LoadBalanceMode {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// A route endpoint: a provider name, or the name of a group whose
/// membership is resolved at selection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRef {
    pub name: String,
    pub is_group: bool,
}

/// An (inbound, intermediate, final) routing triple with its selection
/// discipline and concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "sqlx-support", derive(sqlx::FromRow))]
pub struct Route {
    pub name: String,
    pub inbound_name: String,
    #[serde(default)]
    pub inbound_is_group: bool,
    pub intermediate_name: String,
    #[serde(default)]
    pub intermediate_is_group: bool,
    pub final_name: String,
    #[serde(default)]
    pub final_is_group: bool,
    #[serde(default)]
    pub load_balance_mode: LoadBalanceMode,
    #[serde(default = "defaults::priority")]
    pub priority: i32,
    #[serde(default = "defaults::weight")]
    pub weight: i32,
    /// Zero means uncapped.
    #[serde(default)]
    pub max_concurrent_calls: i32,
    #[serde(default)]
    pub current_calls: i32,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    /// Provider or group names tried, in order, when the primary
    /// intermediate selection fails.
    #[serde(default)]
    pub failover_routes: Option<Vec<String>>,
}

mod defaults {
    pub fn priority() -> i32 {
        100
    }
    pub fn weight() -> i32 {
        1
    }
    pub fn enabled() -> bool {
        true
    }
}

impl Route {
    pub fn inbound(&self) -> RouteRef {
        RouteRef {
            name: self.inbound_name.clone(),
            is_group: self.inbound_is_group,
        }
    }

    pub fn intermediate(&self) -> RouteRef {
        RouteRef {
            name: self.intermediate_name.clone(),
            is_group: self.intermediate_is_group,
        }
    }

    pub fn final_ref(&self) -> RouteRef {
        RouteRef {
            name: self.final_name.clone(),
            is_group: self.final_is_group,
        }
    }

    /// Whether another call may be admitted right now.
    pub fn has_capacity(&self) -> bool {
        self.max_concurrent_calls == 0 || self.current_calls < self.max_concurrent_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity() {
        let mut route = Route {
            name: "r1".to_string(),
            inbound_name: "orig1".to_string(),
            inbound_is_group: false,
            intermediate_name: "tr1".to_string(),
            intermediate_is_group: false,
            final_name: "term1".to_string(),
            final_is_group: false,
            load_balance_mode: LoadBalanceMode::RoundRobin,
            priority: 100,
            weight: 1,
            max_concurrent_calls: 0,
            current_calls: 0,
            enabled: true,
            failover_routes: None,
        };
        assert!(route.has_capacity());

        route.max_concurrent_calls = 2;
        route.current_calls = 1;
        assert!(route.has_capacity());
        route.current_calls = 2;
        assert!(!route.has_capacity());
    }
}
