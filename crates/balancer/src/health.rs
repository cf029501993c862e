use chrono::{DateTime, Duration as ChronoDuration, Utc};
use models::ProviderHealth;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Consecutive failures at which a provider is marked unhealthy.
const UNHEALTHY_AFTER: u32 = 5;
/// A failing provider recovers after this long without a new failure.
const RECOVER_AFTER_SECS: i64 = 5 * 60;
/// Entries idle this long with no activity are evicted.
const EVICT_AFTER_SECS: i64 = 24 * 60 * 60;
/// Rolling response-time window.
const RESPONSE_SAMPLES: usize = 100;

pub const MONITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug)]
struct ResponseRing {
    samples: Vec<f64>,
    next: usize,
    count: usize,
    sum: f64,
}

impl ResponseRing {
    fn new() -> Self {
        Self {
            samples: vec![0.0; RESPONSE_SAMPLES],
            next: 0,
            count: 0,
            sum: 0.0,
        }
    }

    fn push(&mut self, millis: f64) {
        if self.count == RESPONSE_SAMPLES {
            self.sum -= self.samples[self.next];
        } else {
            self.count += 1;
        }
        self.samples[self.next] = millis;
        self.sum += millis;
        self.next = (self.next + 1) % RESPONSE_SAMPLES;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug)]
struct Stats {
    active_calls: i32,
    total_calls: i64,
    failed_calls: i64,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    is_healthy: bool,
    health_score: f64,
    response: ResponseRing,
}

impl Stats {
    fn new() -> Self {
        Self {
            active_calls: 0,
            total_calls: 0,
            failed_calls: 0,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            is_healthy: true,
            health_score: 100.0,
            response: ResponseRing::new(),
        }
    }

    fn score(&self) -> f64 {
        let failure_rate = if self.total_calls > 0 {
            self.failed_calls as f64 / self.total_calls as f64
        } else {
            0.0
        };
        (100.0 - 10.0 * self.consecutive_failures as f64 - 50.0 * failure_rate).max(0.0)
    }
}

/// Live per-provider health, shared between the call router (writer) and
/// the selector (reader). Entries use per-provider locks; no lock is held
/// across I/O.
pub struct HealthTracker {
    entries: RwLock<HashMap<String, Arc<RwLock<Stats>>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, provider: &str) -> Arc<RwLock<Stats>> {
        if let Some(entry) = self.entries.read().unwrap().get(provider) {
            return entry.clone();
        }
        self.entries
            .write()
            .unwrap()
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Stats::new())))
            .clone()
    }

    pub fn increment_active(&self, provider: &str) {
        let entry = self.entry(provider);
        entry.write().unwrap().active_calls += 1;
        metrics::gauge!("router_provider_active_calls", "provider" => provider.to_string())
            .increment(1.0);
    }

    pub fn decrement_active(&self, provider: &str) {
        let entry = self.entry(provider);
        let mut stats = entry.write().unwrap();
        stats.active_calls = (stats.active_calls - 1).max(0);
        metrics::gauge!("router_provider_active_calls", "provider" => provider.to_string())
            .decrement(1.0);
    }

    /// Records a finished call. Failures count toward the unhealthy
    /// threshold; a success resets it and re-marks the provider healthy.
    pub fn record_complete(&self, provider: &str, success: bool, duration: std::time::Duration) {
        let entry = self.entry(provider);
        let mut stats = entry.write().unwrap();
        let now = Utc::now();

        stats.total_calls += 1;
        if success {
            stats.consecutive_failures = 0;
            stats.last_success = Some(now);
            stats.is_healthy = true;
            stats.response.push(duration.as_secs_f64() * 1_000.0);
        } else {
            stats.failed_calls += 1;
            stats.consecutive_failures += 1;
            stats.last_failure = Some(now);
            if stats.consecutive_failures >= UNHEALTHY_AFTER {
                if stats.is_healthy {
                    tracing::warn!(
                        provider,
                        failures = stats.consecutive_failures,
                        "provider marked unhealthy"
                    );
                }
                stats.is_healthy = false;
            }
        }
        stats.health_score = stats.score();
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        match self.entries.read().unwrap().get(provider) {
            Some(entry) => entry.read().unwrap().is_healthy,
            // Untracked providers have no strikes against them.
            None => true,
        }
    }

    pub fn active_calls(&self, provider: &str) -> i32 {
        match self.entries.read().unwrap().get(provider) {
            Some(entry) => entry.read().unwrap().active_calls,
            None => 0,
        }
    }

    pub fn consecutive_failures(&self, provider: &str) -> u32 {
        match self.entries.read().unwrap().get(provider) {
            Some(entry) => entry.read().unwrap().consecutive_failures,
            None => 0,
        }
    }

    pub fn mean_response_time(&self, provider: &str) -> Option<f64> {
        self.entries
            .read()
            .unwrap()
            .get(provider)?
            .read()
            .unwrap()
            .response
            .mean()
    }

    /// Point-in-time persisted form of one provider's counters.
    pub fn snapshot(&self, provider: &str) -> Option<ProviderHealth> {
        let entry = self.entries.read().unwrap().get(provider)?.clone();
        let stats = entry.read().unwrap();
        Some(ProviderHealth {
            provider_name: provider.to_string(),
            active_calls: stats.active_calls,
            total_calls: stats.total_calls,
            failed_calls: stats.failed_calls,
            consecutive_failures: stats.consecutive_failures as i32,
            last_success: stats.last_success,
            last_failure: stats.last_failure,
            health_score: stats.health_score,
            is_healthy: stats.is_healthy,
            avg_response_time_ms: stats.response.mean(),
            updated_at: Utc::now(),
        })
    }

    pub fn snapshots(&self) -> Vec<ProviderHealth> {
        let names: Vec<String> = self.entries.read().unwrap().keys().cloned().collect();
        names.iter().filter_map(|n| self.snapshot(n)).collect()
    }

    /// Re-marks providers healthy when their last failure is old enough.
    /// Takes `now` so tests can advance time.
    pub fn recover_stale(&self, now: DateTime<Utc>) -> usize {
        let entries: Vec<(String, Arc<RwLock<Stats>>)> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut recovered = 0;
        for (name, entry) in entries {
            let mut stats = entry.write().unwrap();
            if stats.is_healthy {
                continue;
            }
            let quiet = match stats.last_failure {
                Some(at) => now - at >= ChronoDuration::seconds(RECOVER_AFTER_SECS),
                None => true,
            };
            if quiet {
                stats.is_healthy = true;
                stats.consecutive_failures = 0;
                stats.health_score = 100.0;
                recovered += 1;
                tracing::info!(provider = %name, "provider auto-recovered");
            }
        }
        recovered
    }

    /// Drops entries with no active calls and no success in 24 h.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| {
            let stats = entry.read().unwrap();
            if stats.active_calls > 0 {
                return true;
            }
            match stats.last_success {
                Some(at) => now - at < ChronoDuration::seconds(EVICT_AFTER_SECS),
                // Never-successful entries are kept until they age out of
                // failure tracking too.
                None => stats.last_failure.map_or(false, |at| {
                    now - at < ChronoDuration::seconds(EVICT_AFTER_SECS)
                }),
            }
        });
        before - entries.len()
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Background loop: every `interval` it auto-recovers, evicts idle
/// entries, and hands the current snapshots to `persist`.
pub async fn monitor<F, Fut>(
    tracker: Arc<HealthTracker>,
    interval: std::time::Duration,
    shutdown: tokio_util::sync::CancellationToken,
    persist: F,
) where
    F: Fn(Vec<ProviderHealth>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            () = tokio::time::sleep(interval) => (),
            () = shutdown.cancelled() => return,
        }

        let now = Utc::now();
        let recovered = tracker.recover_stale(now);
        let evicted = tracker.evict_idle(now);
        if recovered + evicted > 0 {
            tracing::debug!(recovered, evicted, "health monitor tick");
        }

        persist(tracker.snapshots()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_failures_mark_unhealthy_and_recovery_resets() {
        let tracker = HealthTracker::new();

        for _ in 0..4 {
            tracker.record_complete("tr1", false, std::time::Duration::ZERO);
        }
        assert!(tracker.is_healthy("tr1"));

        tracker.record_complete("tr1", false, std::time::Duration::ZERO);
        assert!(!tracker.is_healthy("tr1"));

        // Not yet: only four minutes of quiet.
        let soon = Utc::now() + ChronoDuration::minutes(4);
        assert_eq!(tracker.recover_stale(soon), 0);
        assert!(!tracker.is_healthy("tr1"));

        let later = Utc::now() + ChronoDuration::minutes(5) + ChronoDuration::seconds(1);
        assert_eq!(tracker.recover_stale(later), 1);
        assert!(tracker.is_healthy("tr1"));
        assert_eq!(tracker.consecutive_failures("tr1"), 0);
        assert_eq!(tracker.snapshot("tr1").unwrap().health_score, 100.0);
    }

    #[test]
    fn score_formula() {
        let tracker = HealthTracker::new();

        // 8 successes, 2 failures: rate 0.2, 2 consecutive.
        for _ in 0..8 {
            tracker.record_complete("p", true, std::time::Duration::from_millis(20));
        }
        for _ in 0..2 {
            tracker.record_complete("p", false, std::time::Duration::ZERO);
        }
        let snap = tracker.snapshot("p").unwrap();
        // 100 - 10*2 - 50*0.2 = 70
        assert_eq!(snap.health_score, 70.0);
        assert!(snap.is_healthy);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record_complete("p", false, std::time::Duration::ZERO);
        }
        tracker.record_complete("p", true, std::time::Duration::from_millis(5));
        assert_eq!(tracker.consecutive_failures("p"), 0);
        assert!(tracker.is_healthy("p"));
    }

    #[test]
    fn response_ring_rolls() {
        let tracker = HealthTracker::new();
        for i in 0..150 {
            tracker.record_complete("p", true, std::time::Duration::from_millis(i));
        }
        // Only the most recent 100 samples (50..149) remain: mean 99.5.
        let mean = tracker.mean_response_time("p").unwrap();
        assert!((mean - 99.5).abs() < 1e-9, "mean was {mean}");
    }

    #[test]
    fn eviction_keeps_active_entries() {
        let tracker = HealthTracker::new();
        tracker.record_complete("idle", true, std::time::Duration::from_millis(5));
        tracker.increment_active("busy");

        let later = Utc::now() + ChronoDuration::hours(25);
        assert_eq!(tracker.evict_idle(later), 1);
        assert!(tracker.snapshot("idle").is_none());
        assert!(tracker.snapshot("busy").is_some());
    }

    #[test]
    fn active_calls_clamp_at_zero() {
        let tracker = HealthTracker::new();
        tracker.decrement_active("p");
        assert_eq!(tracker.active_calls("p"), 0);
    }
}
