use super::Inner;

/// The named lock is currently held by someone else.
#[derive(Debug, thiserror::Error)]
#[error("lock '{0}' is held")]
pub struct LockBusy(pub String);

/// Handle to a held lock. Release it through [`super::Cache::release`];
/// a dropped guard is reclaimed by the key's TTL instead.
pub struct LockGuard {
    kind: GuardKind,
}

enum GuardKind {
    Redis {
        conn: redis::aio::ConnectionManager,
        release: redis::Script,
        key: String,
        nonce: String,
    },
    Memory {
        key: String,
        nonce: String,
    },
    Noop,
}

impl LockGuard {
    pub(crate) fn redis(
        conn: redis::aio::ConnectionManager,
        release: redis::Script,
        key: String,
        nonce: String,
    ) -> Self {
        Self {
            kind: GuardKind::Redis {
                conn,
                release,
                key,
                nonce,
            },
        }
    }

    pub(crate) fn memory(key: String, nonce: String) -> Self {
        Self {
            kind: GuardKind::Memory { key, nonce },
        }
    }

    pub(crate) fn noop() -> Self {
        Self {
            kind: GuardKind::Noop,
        }
    }

    pub(crate) async fn release(self, inner: &Inner) {
        match self.kind {
            GuardKind::Redis {
                mut conn,
                release,
                key,
                nonce,
            } => {
                let result: Result<i64, _> = release
                    .key(&key)
                    .arg(&nonce)
                    .invoke_async(&mut conn)
                    .await;
                if let Err(err) = result {
                    super::bypass("unlock", &err);
                }
            }
            GuardKind::Memory { key, nonce } => {
                // Compare-and-delete against the in-process store.
                if let Inner::Memory(store) = inner {
                    let mut store = store.lock().unwrap();
                    if store.get(&key).as_deref() == Some(&nonce) {
                        store.entries.remove(&key);
                    }
                }
            }
            GuardKind::Noop => (),
        }
    }
}
