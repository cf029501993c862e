use crate::Error;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// TTL of the per-provider allocation lock.
const LOCK_TTL: Duration = Duration::from_secs(5);
/// Pause between attempts on a busy allocation lock.
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// The DID pool: durable rows in the store, plus the in-process index
/// mapping a held DID to its call. The index is only mutated after the
/// owning transaction commits, so leg 2 can never observe an allocation
/// that later rolled back.
pub struct DidPool {
    cache: std::sync::Arc<cache::Cache>,
    allocation_timeout: Duration,
    index: RwLock<HashMap<String, String>>,
}

impl DidPool {
    pub fn new(cache: std::sync::Arc<cache::Cache>, allocation_timeout: Duration) -> Self {
        Self {
            cache,
            allocation_timeout,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Claims a free DID for `provider_name` inside `txn`. The row stays
    /// locked until the caller commits or rolls back; a rollback returns
    /// the row to the pool untouched.
    ///
    /// The advisory cache lock keeps a thundering herd of allocations for
    /// one provider from churning on the same rows; correctness does not
    /// depend on it, and an unavailable cache grants a pass-through lock.
    pub async fn allocate(
        &self,
        txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        provider_name: &str,
        destination: &str,
    ) -> Result<String, Error> {
        let lock_key = format!("did.alloc.{provider_name}");
        let deadline = Instant::now() + self.allocation_timeout;

        let guard = loop {
            match self.cache.lock(&lock_key, LOCK_TTL).await {
                Ok(guard) => break Some(guard),
                Err(busy) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(%busy, "allocation lock busy past deadline, proceeding on row locks");
                        break None;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
            }
        };

        let allocated = tandem_sql::dids::allocate(txn, provider_name, destination).await;

        if let Some(guard) = guard {
            self.cache.release(guard).await;
        }

        match allocated? {
            Some(number) => {
                metrics::counter!("router_did_allocated_total").increment(1);
                Ok(number)
            }
            None => {
                metrics::counter!("router_did_unavailable_total").increment(1);
                Err(Error::DidUnavailable(provider_name.to_string()))
            }
        }
    }

    /// Returns a DID to the pool. Idempotent.
    pub async fn release(
        &self,
        executor: impl sqlx::PgExecutor<'_>,
        number: &str,
    ) -> Result<(), Error> {
        if tandem_sql::dids::release(executor, number).await? {
            metrics::counter!("router_did_released_total").increment(1);
        }
        Ok(())
    }

    /// Binds a committed allocation to its call for leg-2 lookup.
    pub fn register_call(&self, number: &str, call_id: &str) {
        self.index
            .write()
            .unwrap()
            .insert(number.to_string(), call_id.to_string());
    }

    pub fn unregister_call(&self, number: &str) {
        self.index.write().unwrap().remove(number);
    }

    pub fn call_id_for(&self, number: &str) -> Option<String> {
        self.index.read().unwrap().get(number).cloned()
    }

    /// Releases rows held longer than `age`: crashed processes leak
    /// allocations, and this repairs them. Index entries for repaired
    /// numbers are dropped too.
    pub async fn sweep(&self, pool: &sqlx::PgPool, age: Duration) -> Result<usize, Error> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::hours(1));
        let repaired = tandem_sql::dids::release_stale(pool, cutoff).await?;

        if !repaired.is_empty() {
            tracing::warn!(count = repaired.len(), numbers = ?repaired, "released stale DID allocations");
            metrics::counter!("router_did_released_total").increment(repaired.len() as u64);
            let mut index = self.index.write().unwrap();
            for number in &repaired {
                index.remove(number);
            }
        }
        Ok(repaired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_roundtrip() {
        let pool = DidPool::new(
            std::sync::Arc::new(cache::Cache::memory()),
            Duration::from_secs(1),
        );

        assert_eq!(pool.call_id_for("1000"), None);
        pool.register_call("1000", "c1");
        assert_eq!(pool.call_id_for("1000").as_deref(), Some("c1"));

        pool.unregister_call("1000");
        assert_eq!(pool.call_id_for("1000"), None);
        // Unregistering again is harmless.
        pool.unregister_call("1000");
    }
}
