//! Keyed renewal cache: lazily created entries with read/write locking and
//! single-flight renewal.
//!
//! Entries are polymorphic over a minimal capability set
//! ([`RenewState`]); the cache treats domain and service states uniformly.
//! The map lock is never held across a renewal; the entry write lock is,
//! which is what guarantees at most one renewer per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Error;
use crate::otid::Otid;

/// The capability set a cached state must provide.
pub(crate) trait RenewState: Clone + Send + Sync {
    type Value: Clone + Send;

    /// An owned snapshot of the current value.
    fn snapshot(&self) -> Self::Value;

    /// True when the state is missing or stale and must be renewed before
    /// the next read.
    fn should_renew(&self) -> bool;
}

/// One cache slot holding a renewable state behind a read/write lock.
pub(crate) struct Entry<S> {
    state: RwLock<S>,
}

impl<S: RenewState> Entry<S> {
    fn new(state: S) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Resolve the entry's value, renewing it first when stale.
    ///
    /// Read-lock fast path; on the slow path the write lock is re-checked
    /// after acquisition and held across the renew future, so concurrent
    /// callers observe exactly one renewal.
    pub(crate) async fn resolve<F, Fut>(&self, renew: F) -> Result<S::Value, Error>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, Error>>,
    {
        {
            let state = self.state.read().await;
            if !state.should_renew() {
                return Ok(state.snapshot());
            }
        }

        let mut state = self.state.write().await;
        if !state.should_renew() {
            return Ok(state.snapshot());
        }
        let next = renew(state.clone()).await?;
        *state = next;
        Ok(state.snapshot())
    }

    /// Renew unconditionally, still under the entry's write lock. Used by
    /// the background refresh loop so foreground reads never race.
    pub(crate) async fn renew_now<F, Fut>(&self, renew: F) -> Result<S::Value, Error>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<S, Error>>,
    {
        let mut state = self.state.write().await;
        let next = renew(state.clone()).await?;
        *state = next;
        Ok(state.snapshot())
    }

    /// Replace the state outright (seeding a pre-issued value).
    pub(crate) async fn set(&self, state: S) {
        *self.state.write().await = state;
    }

    /// The current value without triggering renewal.
    pub(crate) async fn snapshot(&self) -> S::Value {
        self.state.read().await.snapshot()
    }
}

/// A keyed map of lazily created entries. Keys are audience OTID strings.
pub(crate) struct Cache<S> {
    entries: RwLock<HashMap<String, Arc<Entry<S>>>>,
    init: fn(&Otid) -> S,
}

impl<S: RenewState> Cache<S> {
    pub(crate) fn new(init: fn(&Otid) -> S) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            init,
        }
    }

    /// Fetch or lazily create the entry for the given OTID.
    pub(crate) async fn get(&self, id: &Otid) -> Arc<Entry<S>> {
        let key = id.to_string();
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&key) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write().await;
        entries
            .entry(key)
            .or_insert_with(|| Arc::new(Entry::new((self.init)(id))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct TestState {
        value: Option<String>,
    }

    impl RenewState for TestState {
        type Value = Option<String>;

        fn snapshot(&self) -> Self::Value {
            self.value.clone()
        }

        fn should_renew(&self) -> bool {
            self.value.is_none()
        }
    }

    fn empty(_: &Otid) -> TestState {
        TestState { value: None }
    }

    #[tokio::test]
    async fn lazy_creation_returns_same_entry() {
        let cache: Cache<TestState> = Cache::new(empty);
        let id = Otid::parse("otid:localhost:svc:a").unwrap();
        let e1 = cache.get(&id).await;
        let e2 = cache.get(&id).await;
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[tokio::test]
    async fn resolve_renews_once_then_snapshots() {
        let cache: Cache<TestState> = Cache::new(empty);
        let id = Otid::parse("otid:localhost:svc:a").unwrap();
        let entry = cache.get(&id).await;
        let count = AtomicUsize::new(0);

        let v = entry
            .resolve(|mut s| {
                count.fetch_add(1, Ordering::SeqCst);
                async move {
                    s.value = Some("fresh".to_string());
                    Ok(s)
                }
            })
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("fresh"));

        // satisfied state short-circuits on the read path
        let v = entry
            .resolve(|mut s| {
                count.fetch_add(1, Ordering::SeqCst);
                async move {
                    s.value = Some("again".to_string());
                    Ok(s)
                }
            })
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("fresh"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolvers_single_flight() {
        let cache: Arc<Cache<TestState>> = Arc::new(Cache::new(empty));
        let id = Otid::parse("otid:localhost:svc:a").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let id = id.clone();
            let count = count.clone();
            tasks.push(tokio::spawn(async move {
                let entry = cache.get(&id).await;
                entry
                    .resolve(|mut s| {
                        let count = count.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            s.value = Some("fresh".to_string());
                            Ok(s)
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().as_deref(), Some("fresh"));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_renewal_propagates() {
        let cache: Cache<TestState> = Cache::new(empty);
        let id = Otid::parse("otid:localhost:svc:a").unwrap();
        let entry = cache.get(&id).await;

        let err = entry
            .resolve(|s| async move {
                let _ = s;
                Err(Error::Discovery("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));

        // the entry stays renewable after a failure
        let v = entry
            .resolve(|mut s| async move {
                s.value = Some("second try".to_string());
                Ok(s)
            })
            .await
            .unwrap();
        assert_eq!(v.as_deref(), Some("second try"));
    }
}
