use crate::HealthTracker;
use models::{LoadBalanceMode, Provider};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Picks one provider from a candidate list under a discipline.
///
/// Candidates arrive with any per-member priority/weight overrides already
/// applied by group resolution. Unhealthy providers and providers at their
/// channel cap are filtered first; when that leaves nothing, selection
/// degrades to the full list so a fully-unhealthy pool still routes.
pub struct Selector {
    tracker: Arc<HealthTracker>,
    round_robin: Mutex<HashMap<String, usize>>,
}

impl Selector {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self {
            tracker,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    /// `selection_key` scopes the round-robin counter (normally the route
    /// or group name); `call_key` feeds the hash discipline.
    pub fn select<'p>(
        &self,
        mode: LoadBalanceMode,
        candidates: &'p [Provider],
        selection_key: &str,
        call_key: Option<&str>,
    ) -> Option<&'p Provider> {
        if candidates.is_empty() {
            return None;
        }

        let eligible: Vec<&Provider> = candidates
            .iter()
            .filter(|p| {
                self.tracker.is_healthy(&p.name)
                    && (p.max_channels == 0
                        || self.tracker.active_calls(&p.name) < p.max_channels)
            })
            .collect();

        let eligible = if eligible.is_empty() {
            tracing::warn!(
                selection_key,
                candidates = candidates.len(),
                "no healthy provider in set, selecting among all"
            );
            metrics::counter!("router_lb_degraded_total").increment(1);
            candidates.iter().collect()
        } else {
            eligible
        };

        let pick = match mode {
            LoadBalanceMode::RoundRobin => {
                let mut counters = self.round_robin.lock().unwrap();
                let counter = counters.entry(selection_key.to_string()).or_insert(0);
                let index = *counter % eligible.len();
                *counter = counter.wrapping_add(1);
                eligible[index]
            }
            LoadBalanceMode::Weighted => {
                let total: i64 = eligible.iter().map(|p| p.weight.max(0) as i64).sum();
                if total == 0 {
                    eligible[rand::thread_rng().gen_range(0..eligible.len())]
                } else {
                    let mut point = rand::thread_rng().gen_range(0..total);
                    let mut chosen = eligible[0];
                    for &p in &eligible {
                        point -= p.weight.max(0) as i64;
                        if point < 0 {
                            chosen = p;
                            break;
                        }
                    }
                    chosen
                }
            }
            LoadBalanceMode::Priority => {
                // First in list wins a priority tie.
                let mut best = eligible[0];
                for p in &eligible[1..] {
                    if p.priority > best.priority {
                        best = p;
                    }
                }
                best
            }
            LoadBalanceMode::Failover => {
                // Highest priority with a clean failure streak, else the
                // provider with the fewest consecutive failures.
                let mut by_priority = eligible.clone();
                by_priority.sort_by(|a, b| b.priority.cmp(&a.priority));
                by_priority
                    .iter()
                    .find(|p| self.tracker.consecutive_failures(&p.name) == 0)
                    .copied()
                    .unwrap_or_else(|| {
                        *by_priority
                            .iter()
                            .min_by_key(|p| self.tracker.consecutive_failures(&p.name))
                            .expect("eligible is non-empty")
                    })
            }
            LoadBalanceMode::LeastConnections => eligible
                .iter()
                .min_by_key(|p| self.tracker.active_calls(&p.name))
                .copied()
                .expect("eligible is non-empty"),
            LoadBalanceMode::ResponseTime => {
                let tracked: Vec<(&Provider, f64)> = eligible
                    .iter()
                    .filter_map(|p| {
                        self.tracker.mean_response_time(&p.name).map(|m| (*p, m))
                    })
                    .collect();
                match tracked
                    .iter()
                    .min_by(|a, b| a.1.partial_cmp(&b.1).expect("means are finite"))
                {
                    Some((p, _)) => *p,
                    None => eligible[rand::thread_rng().gen_range(0..eligible.len())],
                }
            }
            LoadBalanceMode::Hash => match call_key {
                Some(key) => {
                    let digest = md5::compute(key.as_bytes());
                    let hash = u64::from_be_bytes(digest.0[..8].try_into().expect("md5 is 16 bytes"));
                    eligible[(hash % eligible.len() as u64) as usize]
                }
                None => eligible[rand::thread_rng().gen_range(0..eligible.len())],
            },
        };

        Some(pick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{AuthMode, ProviderKind};

    fn provider(name: &str, priority: i32, weight: i32) -> Provider {
        Provider {
            name: name.to_string(),
            kind: ProviderKind::Transit,
            host: format!("10.0.0.{}", name.len()),
            port: 5060,
            auth_mode: AuthMode::Ip,
            auth_username: None,
            auth_password: None,
            codecs: vec!["ulaw".to_string()],
            max_channels: 0,
            priority,
            weight,
            cost_per_minute: 0.0,
            active: true,
            health_check_enabled: true,
            metadata: serde_json::json!({}),
        }
    }

    fn selector() -> Selector {
        Selector::new(Arc::new(HealthTracker::new()))
    }

    #[test]
    fn round_robin_cycles_per_key() {
        let s = selector();
        let pool = vec![provider("a", 0, 1), provider("b", 0, 1), provider("c", 0, 1)];

        let picks: Vec<String> = (0..6)
            .map(|_| {
                s.select(LoadBalanceMode::RoundRobin, &pool, "r1", None)
                    .unwrap()
                    .name
                    .clone()
            })
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);

        // A different key has its own counter.
        let other = s
            .select(LoadBalanceMode::RoundRobin, &pool, "r2", None)
            .unwrap();
        assert_eq!(other.name, "a");
    }

    #[test]
    fn priority_picks_highest_first_in_list_on_tie() {
        let s = selector();
        let pool = vec![provider("low", 1, 1), provider("hi", 9, 1), provider("hi2", 9, 1)];
        let pick = s.select(LoadBalanceMode::Priority, &pool, "k", None).unwrap();
        assert_eq!(pick.name, "hi");
    }

    #[test]
    fn weighted_all_zero_falls_back_to_uniform() {
        let s = selector();
        let pool = vec![provider("a", 0, 0), provider("b", 0, 0)];
        for _ in 0..20 {
            let pick = s.select(LoadBalanceMode::Weighted, &pool, "k", None).unwrap();
            assert!(pick.name == "a" || pick.name == "b");
        }
    }

    #[test]
    fn weighted_respects_weights() {
        let s = selector();
        let pool = vec![provider("heavy", 0, 100), provider("light", 0, 0)];
        for _ in 0..50 {
            let pick = s.select(LoadBalanceMode::Weighted, &pool, "k", None).unwrap();
            assert_eq!(pick.name, "heavy");
        }
    }

    #[test]
    fn least_connections() {
        let s = selector();
        let pool = vec![provider("a", 0, 1), provider("b", 0, 1)];
        s.tracker().increment_active("a");
        s.tracker().increment_active("a");
        s.tracker().increment_active("b");

        let pick = s
            .select(LoadBalanceMode::LeastConnections, &pool, "k", None)
            .unwrap();
        assert_eq!(pick.name, "b");
    }

    #[test]
    fn failover_prefers_clean_streak() {
        let s = selector();
        let pool = vec![provider("primary", 10, 1), provider("backup", 1, 1)];

        // One failure is enough to route around the primary, even though
        // it is still "healthy".
        s.tracker()
            .record_complete("primary", false, std::time::Duration::ZERO);
        let pick = s.select(LoadBalanceMode::Failover, &pool, "k", None).unwrap();
        assert_eq!(pick.name, "backup");

        // With failures everywhere the fewest-failures provider wins.
        s.tracker()
            .record_complete("backup", false, std::time::Duration::ZERO);
        s.tracker()
            .record_complete("backup", false, std::time::Duration::ZERO);
        let pick = s.select(LoadBalanceMode::Failover, &pool, "k", None).unwrap();
        assert_eq!(pick.name, "primary");
    }

    #[test]
    fn response_time_prefers_fastest_tracked() {
        let s = selector();
        let pool = vec![provider("fast", 0, 1), provider("slow", 0, 1), provider("untracked", 0, 1)];
        s.tracker()
            .record_complete("fast", true, std::time::Duration::from_millis(10));
        s.tracker()
            .record_complete("slow", true, std::time::Duration::from_millis(500));

        let pick = s
            .select(LoadBalanceMode::ResponseTime, &pool, "k", None)
            .unwrap();
        assert_eq!(pick.name, "fast");
    }

    #[test]
    fn hash_is_sticky_per_call() {
        let s = selector();
        let pool = vec![provider("a", 0, 1), provider("b", 0, 1), provider("c", 0, 1)];

        let first = s
            .select(LoadBalanceMode::Hash, &pool, "k", Some("call-42"))
            .unwrap()
            .name
            .clone();
        for _ in 0..10 {
            let again = s
                .select(LoadBalanceMode::Hash, &pool, "k", Some("call-42"))
                .unwrap();
            assert_eq!(again.name, first);
        }
    }

    #[test]
    fn unhealthy_and_full_providers_are_filtered() {
        let s = selector();
        let mut full = provider("full", 0, 1);
        full.max_channels = 1;
        let pool = vec![provider("sick", 0, 1), full, provider("ok", 0, 1)];

        for _ in 0..5 {
            s.tracker()
                .record_complete("sick", false, std::time::Duration::ZERO);
        }
        s.tracker().increment_active("full");

        for _ in 0..6 {
            let pick = s
                .select(LoadBalanceMode::RoundRobin, &pool, "k", None)
                .unwrap();
            assert_eq!(pick.name, "ok");
        }
    }

    #[test]
    fn degraded_mode_selects_among_all_when_none_eligible() {
        let s = selector();
        let pool = vec![provider("sick", 0, 1)];
        for _ in 0..5 {
            s.tracker()
                .record_complete("sick", false, std::time::Duration::ZERO);
        }
        let pick = s.select(LoadBalanceMode::RoundRobin, &pool, "k", None).unwrap();
        assert_eq!(pick.name, "sick");
    }

    #[test]
    fn empty_candidates_yield_none() {
        let s = selector();
        assert!(s.select(LoadBalanceMode::Priority, &[], "k", None).is_none());
    }
}
