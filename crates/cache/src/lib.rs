//! TTL key/value cache and named exclusive locks.
//!
//! All cache operations degrade to a miss or no-op when the backend is
//! unreachable: the router must keep serving calls with the cache down.
//! Lock release is fenced by a per-acquisition nonce so an expired holder
//! can never unlock a later one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

mod lock;
pub use lock::{LockBusy, LockGuard};

// Compare-and-delete: only the holder whose nonce is still stored may
// remove the lock key.
const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct Cache {
    inner: Inner,
}

enum Inner {
    Redis {
        conn: redis::aio::ConnectionManager,
        release: redis::Script,
    },
    Memory(Mutex<MemoryStore>),
    Disabled,
}

#[derive(Default)]
struct MemoryStore {
    entries: HashMap<String, (String, Instant)>,
}

impl MemoryStore {
    fn get(&mut self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set_if_absent(&mut self, key: &str, value: &str, ttl: Duration) -> bool {
        if self.get(key).is_some() {
            return false;
        }
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        true
    }
}

impl Cache {
    /// Connects to the given redis URL eagerly so misconfiguration is
    /// caught at startup; later failures degrade to bypass.
    pub async fn redis(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            inner: Inner::Redis {
                conn,
                release: redis::Script::new(RELEASE_SCRIPT),
            },
        })
    }

    /// Process-local store with the same TTL and nonce semantics. Suits
    /// single-node deployments and tests.
    pub fn memory() -> Self {
        Self {
            inner: Inner::Memory(Mutex::new(MemoryStore::default())),
        }
    }

    /// Every get misses, every set is dropped, every lock succeeds.
    pub fn disabled() -> Self {
        Self {
            inner: Inner::Disabled,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        match &self.inner {
            Inner::Redis { conn, .. } => {
                let mut conn = conn.clone();
                match redis::cmd("GET")
                    .arg(key)
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
                {
                    Ok(value) => value,
                    Err(err) => {
                        bypass("get", &err);
                        None
                    }
                }
            }
            Inner::Memory(store) => store.lock().unwrap().get(key),
            Inner::Disabled => None,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        match &self.inner {
            Inner::Redis { conn, .. } => {
                let mut conn = conn.clone();
                if let Err(err) = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async::<_, ()>(&mut conn)
                    .await
                {
                    bypass("set", &err);
                }
            }
            Inner::Memory(store) => {
                let mut store = store.lock().unwrap();
                store
                    .entries
                    .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
            }
            Inner::Disabled => (),
        }
    }

    pub async fn delete(&self, keys: &[&str]) {
        if keys.is_empty() {
            return;
        }
        match &self.inner {
            Inner::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let mut cmd = redis::cmd("DEL");
                for key in keys {
                    cmd.arg(key);
                }
                if let Err(err) = cmd.query_async::<_, ()>(&mut conn).await {
                    bypass("delete", &err);
                }
            }
            Inner::Memory(store) => {
                let mut store = store.lock().unwrap();
                for key in keys {
                    store.entries.remove(*key);
                }
            }
            Inner::Disabled => (),
        }
    }

    /// Acquires the named exclusive lock, or fails with [`LockBusy`] when
    /// another holder's entry is live. On a backend failure the lock is
    /// granted as a no-op guard: exclusion degrades, availability doesn't.
    pub async fn lock(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockBusy> {
        let nonce: u64 = rand::random();
        let nonce = format!("{nonce:016x}");

        match &self.inner {
            Inner::Redis { conn, release } => {
                let mut conn = conn.clone();
                let set: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(key)
                    .arg(&nonce)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await;

                match set {
                    Ok(Some(_)) => Ok(LockGuard::redis(
                        conn,
                        release.clone(),
                        key.to_string(),
                        nonce,
                    )),
                    Ok(None) => Err(LockBusy(key.to_string())),
                    Err(err) => {
                        bypass("lock", &err);
                        Ok(LockGuard::noop())
                    }
                }
            }
            Inner::Memory(store) => {
                let acquired = store.lock().unwrap().set_if_absent(key, &nonce, ttl);
                if acquired {
                    Ok(LockGuard::memory(key.to_string(), nonce))
                } else {
                    Err(LockBusy(key.to_string()))
                }
            }
            Inner::Disabled => Ok(LockGuard::noop()),
        }
    }

    /// Releases a guard acquired from this cache. A no-op unless the
    /// stored nonce still belongs to this guard.
    pub async fn release(&self, guard: LockGuard) {
        guard.release(&self.inner).await
    }
}

fn bypass(op: &'static str, err: &redis::RedisError) {
    metrics::counter!("cache_bypass_total", "op" => op).increment(1);
    tracing::debug!(op, %err, "cache backend unavailable, bypassing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_ttl_and_delete() {
        let cache = Cache::memory();

        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));

        cache.delete(&["k"]).await;
        assert_eq!(cache.get("k").await, None);

        cache.set("gone", "v", Duration::from_millis(0)).await;
        assert_eq!(cache.get("gone").await, None);
    }

    #[tokio::test]
    async fn lock_excludes_second_holder() {
        let cache = Cache::memory();

        let guard = cache.lock("did.alloc.tr1", Duration::from_secs(5)).await.unwrap();
        assert!(cache.lock("did.alloc.tr1", Duration::from_secs(5)).await.is_err());

        cache.release(guard).await;
        assert!(cache.lock("did.alloc.tr1", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn expired_holder_cannot_release_later_owner() {
        let cache = Cache::memory();

        // First holder's entry expires immediately.
        let stale = cache.lock("l", Duration::from_millis(0)).await.unwrap();

        // A later holder takes the lock.
        let _live = cache.lock("l", Duration::from_secs(60)).await.unwrap();

        // The stale release must not unlock the live holder.
        cache.release(stale).await;
        assert!(cache.lock("l", Duration::from_secs(60)).await.is_err());
    }

    #[tokio::test]
    async fn disabled_cache_always_grants() {
        let cache = Cache::disabled();
        assert_eq!(cache.get("k").await, None);
        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, None);

        let a = cache.lock("l", Duration::from_secs(5)).await.unwrap();
        let b = cache.lock("l", Duration::from_secs(5)).await.unwrap();
        cache.release(a).await;
        cache.release(b).await;
    }
}
