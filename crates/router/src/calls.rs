use crate::{DidPool, Error, GroupResolver, RouteResolver};
use balancer::Selector;
use chrono::Utc;
use models::{
    CallRecord, CallStatus, CallStep, LoadBalanceMode, Provider, Route, RouteRef,
    VerificationStep,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tandem_sql::verifications::NewVerification;

/// Router tuning; see the daemon's `router` config section.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub did_allocation_timeout: std::time::Duration,
    pub call_cleanup_interval: std::time::Duration,
    pub stale_call_timeout: std::time::Duration,
    pub max_retries: u32,
    pub verification: VerificationPolicy,
    pub default_lb_mode: LoadBalanceMode,
}

#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    pub enabled: bool,
    /// Strict failures abort the call; lenient ones are recorded and the
    /// call proceeds.
    pub strict: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            did_allocation_timeout: std::time::Duration::from_secs(5),
            call_cleanup_interval: std::time::Duration::from_secs(60),
            stale_call_timeout: std::time::Duration::from_secs(2 * 60 * 60),
            max_retries: 3,
            verification: VerificationPolicy {
                enabled: true,
                strict: false,
            },
            default_lb_mode: LoadBalanceMode::RoundRobin,
        }
    }
}

/// Instructions back to the switch after leg 1.
#[derive(Debug, PartialEq)]
pub struct LegOneReply {
    pub did: String,
    pub next_hop: String,
    pub ani_to_send: String,
    pub dnis_to_send: String,
}

/// Instructions back to the switch after leg 2.
#[derive(Debug, PartialEq)]
pub struct LegTwoReply {
    pub next_hop: String,
    pub ani_to_send: String,
    pub dnis_to_send: String,
}

/// The three-leg state machine. Owns the in-memory active-call map and,
/// through [`DidPool`], the DID↔call index; both are only mutated after
/// the corresponding transaction commits.
pub struct CallRouter {
    pool: sqlx::PgPool,
    dids: DidPool,
    groups: GroupResolver,
    routes: RouteResolver,
    selector: Selector,
    config: RouterConfig,
    active: RwLock<HashMap<String, CallRecord>>,
}

impl CallRouter {
    pub fn new(
        pool: sqlx::PgPool,
        cache: Arc<cache::Cache>,
        tracker: Arc<balancer::HealthTracker>,
        config: RouterConfig,
    ) -> Self {
        Self {
            dids: DidPool::new(cache.clone(), config.did_allocation_timeout),
            groups: GroupResolver::new(pool.clone(), cache.clone()),
            routes: RouteResolver::new(pool.clone(), cache),
            selector: Selector::new(tracker),
            config,
            pool,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn dids(&self) -> &DidPool {
        &self.dids
    }

    pub fn groups(&self) -> &GroupResolver {
        &self.groups
    }

    /// Number of calls currently tracked in memory.
    pub fn active_calls(&self) -> usize {
        self.active.read().unwrap().len()
    }

    /// Rebuilds the in-memory map and DID index from non-terminal records,
    /// so a restarted router keeps serving calls begun by its predecessor.
    pub async fn restore(&self) -> Result<usize, Error> {
        let records = tandem_sql::call_records::fetch_open_records(&self.pool).await?;
        let mut map = self.active.write().unwrap();
        for record in &records {
            if let Some(did) = &record.assigned_did {
                self.dids.register_call(did, &record.call_id);
            }
            map.insert(record.call_id.clone(), record.clone());
        }
        metrics::gauge!("router_active_calls").set(map.len() as f64);
        Ok(records.len())
    }

    /// Leg 1: an origination provider handed us a call. Picks the transit
    /// and termination providers, allocates a DID, and tells the switch to
    /// dial the transit provider with the caller rewritten to the original
    /// DNIS and the called number rewritten to the DID.
    #[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(self))]
    pub async fn process_incoming(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        inbound: &str,
    ) -> Result<LegOneReply, Error> {
        let route = self.routes.route_for(inbound).await?;

        let intermediate = match self.pick(&route.intermediate(), &route, Some(call_id)).await {
            Ok(provider) => provider,
            Err(err) => self.pick_failover(&route, call_id).await.ok_or(err)?,
        };
        let final_provider = self.pick(&route.final_ref(), &route, Some(call_id)).await?;

        let mut txn = self.pool.begin().await?;

        // Any error from here drops `txn`, rolling back the DID claim and
        // the record insert together.
        let did = self.dids.allocate(&mut txn, &intermediate.name, dnis).await?;

        let record = CallRecord {
            call_id: call_id.to_string(),
            original_ani: ani.to_string(),
            original_dnis: dnis.to_string(),
            transformed_ani: Some(dnis.to_string()),
            assigned_did: Some(did.clone()),
            inbound_provider: inbound.to_string(),
            intermediate_provider: intermediate.name.clone(),
            final_provider: final_provider.name.clone(),
            route_name: route.name.clone(),
            status: CallStatus::Active,
            current_step: CallStep::ToTransit,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration: None,
            billable_duration: None,
            recording_path: None,
            failure_reason: None,
            metadata: serde_json::json!({}),
        };
        tandem_sql::call_records::insert(&mut txn, &record).await?;

        if !tandem_sql::routes::try_increment_calls(&mut txn, &route.name).await? {
            return Err(Error::QuotaExceeded(route.name.clone()));
        }

        txn.commit().await?;

        self.dids.register_call(&did, call_id);
        self.active
            .write()
            .unwrap()
            .insert(call_id.to_string(), record);
        self.selector.tracker().increment_active(&intermediate.name);
        self.selector.tracker().increment_active(&final_provider.name);
        metrics::gauge!("router_active_calls").increment(1.0);

        tracing::info!(
            did,
            intermediate = %intermediate.name,
            r#final = %final_provider.name,
            route = %route.name,
            "call admitted"
        );

        Ok(LegOneReply {
            next_hop: format!("endpoint-{}", intermediate.name),
            ani_to_send: dnis.to_string(),
            dnis_to_send: did.clone(),
            did,
        })
    }

    /// Leg 2: the transit provider dialed our DID back. Verifies the
    /// return against the stored expectations and restores the original
    /// ANI/DNIS for the hop to the termination provider.
    #[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(self))]
    pub async fn process_return(
        &self,
        received_ani: &str,
        did: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<LegTwoReply, Error> {
        let call_id = self
            .dids
            .call_id_for(did)
            .ok_or_else(|| Error::CallNotFound(format!("DID {did}")))?;
        let record = self
            .active
            .read()
            .unwrap()
            .get(&call_id)
            .cloned()
            .ok_or_else(|| Error::CallNotFound(call_id.clone()))?;

        if self.config.verification.enabled {
            self.verify_leg(
                VerificationStep::Return,
                &record,
                &record.intermediate_provider,
                &record.original_dnis,
                received_ani,
                record.assigned_did.as_deref(),
                Some(did),
                provider_on_wire,
                source_ip,
            )
            .await?;
        }

        tandem_sql::call_records::mark_returned(&self.pool, &call_id).await?;
        if let Some(record) = self.active.write().unwrap().get_mut(&call_id) {
            record.status = CallStatus::ReturnedFromTransit;
            record.current_step = CallStep::ToRouter;
        }

        tracing::info!(call_id, "transit leg returned, forwarding to termination");

        Ok(LegTwoReply {
            next_hop: format!("endpoint-{}", record.final_provider),
            ani_to_send: record.original_ani.clone(),
            dnis_to_send: record.original_dnis.clone(),
        })
    }

    /// Leg 3: final confirmation. Completes accounting, releases the DID,
    /// and tears down state.
    #[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(self))]
    pub async fn process_final(
        &self,
        call_id: &str,
        ani: &str,
        dnis: &str,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<(), Error> {
        // Leg 3 arrives on its own channel, so the switch-supplied id may
        // be unknown; fall back to the oldest live record for the pair.
        let record = {
            let map = self.active.read().unwrap();
            match map.get(call_id) {
                Some(record) => Some(record.clone()),
                None => map
                    .values()
                    .filter(|r| r.original_ani == ani && r.original_dnis == dnis)
                    .min_by_key(|r| r.start_time)
                    .cloned(),
            }
        }
        .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;

        if self.config.verification.enabled {
            self.verify_leg(
                VerificationStep::Final,
                &record,
                &record.final_provider,
                &record.original_ani,
                ani,
                Some(&record.original_dnis),
                Some(dnis),
                provider_on_wire,
                source_ip,
            )
            .await?;
        }

        let duration = self
            .terminalize(&record, CallStatus::Completed, None)
            .await?;

        let tracker = self.selector.tracker();
        tracker.record_complete(&record.intermediate_provider, true, duration);
        tracker.record_complete(&record.final_provider, true, duration);

        tracing::info!(
            call_id = %record.call_id,
            duration_secs = duration.as_secs(),
            "call completed"
        );
        Ok(())
    }

    /// Hangup: terminalizes a live call. A no-op for unknown or already
    /// terminal calls, so late hangup events are harmless.
    #[tracing::instrument(level = "info", err(Debug, level = "warn"), skip(self))]
    pub async fn process_hangup(&self, call_id: &str) -> Result<(), Error> {
        let record = self.active.read().unwrap().get(call_id).cloned();
        let Some(record) = record else {
            tracing::debug!(call_id, "hangup for unknown call ignored");
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        let status = if record.status == CallStatus::Active {
            CallStatus::Failed
        } else {
            CallStatus::Abandoned
        };
        let duration = self.terminalize(&record, status, Some("hangup")).await?;

        let tracker = self.selector.tracker();
        tracker.record_complete(&record.intermediate_provider, false, duration);
        tracker.record_complete(&record.final_provider, false, duration);

        tracing::info!(call_id, status = ?status, "call hung up");
        Ok(())
    }

    /// One sweeper pass: times out in-memory records past the stale
    /// deadline, then repairs DID rows leaked by a previous process.
    pub async fn sweep_stale(&self) -> Result<usize, Error> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_call_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let stale: Vec<CallRecord> = self
            .active
            .read()
            .unwrap()
            .values()
            .filter(|r| r.start_time < cutoff)
            .cloned()
            .collect();

        for record in &stale {
            tracing::warn!(call_id = %record.call_id, "forcing stale call to timeout");
            let duration = self
                .terminalize(record, CallStatus::Timeout, Some("stale call timeout"))
                .await?;
            let tracker = self.selector.tracker();
            tracker.record_complete(&record.intermediate_provider, false, duration);
            tracker.record_complete(&record.final_provider, false, duration);
            metrics::counter!("router_calls_timed_out_total").increment(1);
        }

        self.dids
            .sweep(&self.pool, self.config.stale_call_timeout)
            .await?;
        Ok(stale.len())
    }

    /// Long-lived sweeper; cancels cooperatively.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.call_cleanup_interval) => (),
                () = shutdown.cancelled() => return,
            }
            if let Err(err) = self.sweep_stale().await {
                tracing::error!(%err, "stale call sweep failed");
            }
        }
    }

    /// Moves a record to a terminal state: releases the DID and decrements
    /// the route inside one transaction, then drops in-memory state.
    async fn terminalize(
        &self,
        record: &CallRecord,
        status: CallStatus,
        reason: Option<&str>,
    ) -> Result<std::time::Duration, Error> {
        let end_time = Utc::now();
        let duration = (end_time - record.start_time)
            .to_std()
            .unwrap_or_default();
        let seconds = duration.as_secs() as i64;
        let billable = if status == CallStatus::Completed {
            seconds
        } else {
            0
        };

        let mut txn = self.pool.begin().await?;
        if let Some(did) = &record.assigned_did {
            self.dids.release(&mut txn, did).await?;
        }
        tandem_sql::call_records::finalize(
            &mut txn,
            &record.call_id,
            status,
            end_time,
            seconds,
            billable,
            reason,
        )
        .await?;
        tandem_sql::routes::decrement_calls(&mut txn, &record.route_name).await?;
        txn.commit().await?;

        if let Some(did) = &record.assigned_did {
            self.dids.unregister_call(did);
        }
        if self
            .active
            .write()
            .unwrap()
            .remove(&record.call_id)
            .is_some()
        {
            metrics::gauge!("router_active_calls").decrement(1.0);
        }
        let tracker = self.selector.tracker();
        tracker.decrement_active(&record.intermediate_provider);
        tracker.decrement_active(&record.final_provider);

        Ok(duration)
    }

    async fn candidates(&self, target: &RouteRef) -> Result<Vec<Provider>, Error> {
        if target.is_group {
            self.groups.members_of(&target.name).await
        } else {
            match tandem_sql::providers::fetch_provider(&self.pool, &target.name).await? {
                Some(provider) if provider.active => Ok(vec![provider]),
                _ => Err(Error::ProviderNotFound(target.name.clone())),
            }
        }
    }

    async fn pick(
        &self,
        target: &RouteRef,
        route: &Route,
        call_key: Option<&str>,
    ) -> Result<Provider, Error> {
        let candidates = self.candidates(target).await?;
        let selection_key = format!("{}.{}", route.name, target.name);
        self.selector
            .select(
                route.load_balance_mode,
                &candidates,
                &selection_key,
                call_key,
            )
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(target.name.clone()))
    }

    /// Walks the route's failover list, trying each entry as a provider
    /// name and then as a group name.
    async fn pick_failover(&self, route: &Route, call_key: &str) -> Option<Provider> {
        for name in route.failover_routes.iter().flatten() {
            for is_group in [false, true] {
                let target = RouteRef {
                    name: name.clone(),
                    is_group,
                };
                if let Ok(provider) = self.pick(&target, route, Some(call_key)).await {
                    tracing::warn!(
                        route = %route.name,
                        failover = %name,
                        provider = %provider.name,
                        "primary intermediate selection failed, using failover"
                    );
                    return Some(provider);
                }
            }
        }
        None
    }

    /// Runs the ordered verification checks for one leg, appending an
    /// audit row per failed check and a single passing row when all three
    /// hold. Strict mode turns the first failure into `AuthFailed`;
    /// lenient mode records it and keeps checking.
    #[allow(clippy::too_many_arguments)]
    async fn verify_leg(
        &self,
        step: VerificationStep,
        record: &CallRecord,
        expected_provider: &str,
        expected_ani: &str,
        received_ani: &str,
        expected_dnis: Option<&str>,
        received_dnis: Option<&str>,
        provider_on_wire: &str,
        source_ip: &str,
    ) -> Result<(), Error> {
        let expected_host = tandem_sql::providers::fetch_provider(&self.pool, expected_provider)
            .await?
            .map(|p| p.host)
            .unwrap_or_default();
        let received_host = strip_port(source_ip);

        let checks: [(bool, String); 3] = [
            (
                received_ani == expected_ani,
                format!("ANI mismatch: expected {expected_ani} got {received_ani}"),
            ),
            (
                provider_on_wire == expected_provider,
                format!("provider mismatch: expected {expected_provider} got {provider_on_wire}"),
            ),
            (
                received_host == expected_host,
                format!("source IP mismatch: expected {expected_host} got {received_host}"),
            ),
        ];

        let mut all_ok = true;
        for (ok, reason) in &checks {
            if *ok {
                continue;
            }
            all_ok = false;

            tandem_sql::verifications::insert(
                &self.pool,
                NewVerification {
                    call_id: &record.call_id,
                    step,
                    expected_ani: Some(expected_ani),
                    received_ani: Some(received_ani),
                    expected_dnis,
                    received_dnis,
                    expected_ip: Some(&expected_host),
                    received_ip: Some(source_ip),
                    verified: false,
                    failure_reason: Some(reason),
                },
            )
            .await?;
            metrics::counter!("router_verification_failed", "stage" => step.as_str())
                .increment(1);

            if self.config.verification.strict {
                return Err(Error::AuthFailed(reason.clone()));
            }
            tracing::warn!(
                call_id = %record.call_id,
                stage = step.as_str(),
                reason,
                "verification failed, continuing (lenient mode)"
            );
        }

        if all_ok {
            tandem_sql::verifications::insert(
                &self.pool,
                NewVerification {
                    call_id: &record.call_id,
                    step,
                    expected_ani: Some(expected_ani),
                    received_ani: Some(received_ani),
                    expected_dnis,
                    received_dnis,
                    expected_ip: Some(&expected_host),
                    received_ip: Some(source_ip),
                    verified: true,
                    failure_reason: None,
                },
            )
            .await?;
        }
        Ok(())
    }
}

/// Drops a trailing `:port` from a socket address. Addresses without a
/// port pass through unchanged.
fn strip_port(addr: &str) -> &str {
    match addr.split_once(':') {
        Some((host, _port)) => host,
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::strip_port;

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("10.0.0.2:5060"), "10.0.0.2");
        assert_eq!(strip_port("10.0.0.77"), "10.0.0.77");
        assert_eq!(strip_port(""), "");
    }
}
