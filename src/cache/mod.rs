//! Two-tier cache fabric with in-flight coalescing.
//!
//! An in-process map per namespace sits over the persistent SQLite tier.
//! `get_or_compute` is single-flight: concurrent callers for one key join
//! exactly one producer and observe its value or its error. Stale entries
//! are served immediately while a background refresh replaces them, merging
//! link lists so a cold refresh cannot destroy still-valid cached links.

pub mod store;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub use store::{KvStore, StoredEntry};

use crate::config::CacheConfig;
use crate::errors::CacheError;

pub const NS_META: &str = "meta";
pub const NS_STREAMS: &str = "streams";
pub const NS_RESOLVE: &str = "resolve";
pub const NS_CF_COOKIE: &str = "cf_cookie";

const NAMESPACES: [&str; 4] = [NS_META, NS_STREAMS, NS_RESOLVE, NS_CF_COOKIE];

/// Outcome broadcast to coalesced waiters: the produced value or the
/// producer's error message.
type FlightOutcome = Result<Option<serde_json::Value>, String>;

#[derive(Debug, Clone)]
struct MemEntry {
    value: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    ttl: Duration,
}

impl MemEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= 0 && (age.num_milliseconds() as u128) < self.ttl.as_millis()
    }
}

struct NamespaceState {
    entries: Mutex<HashMap<String, MemEntry>>,
    inflight: Mutex<HashMap<String, broadcast::Sender<FlightOutcome>>>,
}

impl NamespaceState {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Per-call knobs for `get_or_compute`.
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Background refresh overwrites matching entries instead of keeping them
    pub prefer_fresh: bool,
    /// Negative-result TTL; defaults to a quarter of the positive TTL
    pub negative_ttl: Option<Duration>,
}

#[derive(Clone)]
pub struct CacheFabric {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    store: KvStore,
    namespaces: HashMap<&'static str, NamespaceState>,
    max_entries: usize,
}

impl CacheFabric {
    pub fn new(store: KvStore, config: &CacheConfig) -> Self {
        let namespaces = NAMESPACES
            .iter()
            .map(|ns| (*ns, NamespaceState::new()))
            .collect();
        Self {
            inner: std::sync::Arc::new(Inner {
                store,
                namespaces,
                max_entries: config.memory_max_entries,
            }),
        }
    }

    pub fn store(&self) -> &KvStore {
        &self.inner.store
    }

    fn namespace(&self, namespace: &'static str) -> &NamespaceState {
        self.inner
            .namespaces
            .get(namespace)
            .unwrap_or_else(|| panic!("unknown cache namespace {namespace}"))
    }

    /// In-process entry counts, for the health endpoint.
    pub fn sizes(&self) -> HashMap<&'static str, usize> {
        self.inner
            .namespaces
            .iter()
            .map(|(ns, state)| (*ns, state.entries.lock().unwrap().len()))
            .collect()
    }

    /// Read through both tiers without computing.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &'static str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let now = Utc::now();
        {
            let entries = self.namespace(namespace).entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                if entry.is_fresh(now) {
                    return deserialize_value(entry.value.as_ref());
                }
            }
        }

        if let Some(stored) = self.inner.store.get(namespace, key).await? {
            if stored.is_fresh(now) {
                self.write_memory(namespace, key, stored.value.clone(), stored.ttl, stored.created_at);
                return deserialize_value(stored.value.as_ref());
            }
        }
        Ok(None)
    }

    /// Write through both tiers.
    pub async fn set<T: Serialize>(
        &self,
        namespace: &'static str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        self.write_memory(namespace, key, Some(value.clone()), ttl, Utc::now());
        self.inner.store.put(namespace, key, Some(&value), ttl).await?;
        Ok(())
    }

    pub async fn invalidate(&self, namespace: &'static str, key: &str) -> Result<(), CacheError> {
        self.namespace(namespace).entries.lock().unwrap().remove(key);
        self.inner.store.delete(namespace, key).await?;
        Ok(())
    }

    /// Single-flight read-or-produce.
    ///
    /// * fresh in-process hit: returned without I/O
    /// * stale in-process hit: returned immediately, a background refresh is
    ///   scheduled; its result replaces the entry only when non-empty
    /// * miss with a producer already in flight: join it
    /// * miss: install the flight, check the persistent tier, then produce
    ///
    /// Producer errors are not cached; every joined waiter observes the same
    /// error message.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
        opts: ComputeOptions,
        producer: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, String>> + Send + 'static,
    {
        let now = Utc::now();
        let negative_ttl = opts.negative_ttl.unwrap_or(ttl / 4);

        // Fresh or stale in-process hit.
        let stale = {
            let entries = self.namespace(namespace).entries.lock().unwrap();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(now) => {
                    return deserialize_value(entry.value.as_ref());
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            }
        };

        if let Some(stale_value) = stale {
            self.schedule_refresh(namespace, key, ttl, opts.prefer_fresh, producer);
            return deserialize_value(stale_value.as_ref());
        }

        // Join an existing flight if one is up.
        let receiver = {
            let mut inflight = self.namespace(namespace).inflight.lock().unwrap();
            match inflight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), sender);
                    None
                }
            }
        };

        if let Some(mut receiver) = receiver {
            debug!(namespace, key, "joining in-flight producer");
            return match receiver.recv().await {
                Ok(Ok(value)) => deserialize_value(value.as_ref()),
                Ok(Err(message)) => Err(CacheError::ProducerFailed {
                    key: key.to_string(),
                    message,
                }),
                // Producer dropped without broadcasting; treat as a miss the
                // caller can retry.
                Err(_) => Ok(None),
            };
        }

        // We own the flight. Persistent tier first.
        match self.inner.store.get(namespace, key).await {
            Ok(Some(stored)) if stored.is_fresh(now) => {
                self.write_memory(namespace, key, stored.value.clone(), stored.ttl, stored.created_at);
                self.finish_flight(namespace, key, Ok(stored.value.clone()));
                return deserialize_value(stored.value.as_ref());
            }
            Ok(_) => {}
            Err(e) => warn!(namespace, key, error = %e, "persistent tier read failed"),
        }

        // A panicking producer must not wedge the flight slot.
        let outcome = match AssertUnwindSafe(producer()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err("producer panicked".to_string()),
        };
        let outcome = self
            .commit_outcome(namespace, key, ttl, negative_ttl, outcome)
            .await;
        self.finish_flight(namespace, key, outcome.clone());

        match outcome {
            Ok(value) => deserialize_value(value.as_ref()),
            Err(message) => Err(CacheError::ProducerFailed {
                key: key.to_string(),
                message,
            }),
        }
    }

    /// Serialize, write both tiers (negative results at the shorter TTL).
    async fn commit_outcome<T: Serialize>(
        &self,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
        negative_ttl: Duration,
        outcome: Result<Option<T>, String>,
    ) -> FlightOutcome {
        match outcome {
            Ok(Some(value)) => match serde_json::to_value(&value) {
                Ok(json) => {
                    self.write_memory(namespace, key, Some(json.clone()), ttl, Utc::now());
                    if let Err(e) = self.inner.store.put(namespace, key, Some(&json), ttl).await {
                        warn!(namespace, key, error = %e, "persistent tier write failed");
                    }
                    Ok(Some(json))
                }
                Err(e) => Err(format!("serialization failed: {e}")),
            },
            Ok(None) => {
                self.write_memory(namespace, key, None, negative_ttl, Utc::now());
                if let Err(e) = self.inner.store.put(namespace, key, None, negative_ttl).await {
                    warn!(namespace, key, error = %e, "persistent tier write failed");
                }
                Ok(None)
            }
            Err(message) => Err(message),
        }
    }

    /// Background stale-while-revalidate refresh; the inflight slot blocks a
    /// second refresh for the same key.
    fn schedule_refresh<T, F, Fut>(
        &self,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
        prefer_fresh: bool,
        producer: F,
    ) where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, String>> + Send + 'static,
    {
        {
            let mut inflight = self.namespace(namespace).inflight.lock().unwrap();
            if inflight.contains_key(key) {
                return;
            }
            let (sender, _) = broadcast::channel(1);
            inflight.insert(key.to_string(), sender);
        }

        let fabric = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            debug!(namespace, key = %key, "background refresh started");
            let produced = match AssertUnwindSafe(producer()).catch_unwind().await {
                Ok(produced) => produced,
                Err(_) => Err("producer panicked".to_string()),
            };
            let outcome = match produced {
                Ok(Some(fresh)) => {
                    let fresh = match serde_json::to_value(&fresh) {
                        Ok(v) => v,
                        Err(e) => {
                            fabric.finish_flight(namespace, &key, Err(e.to_string()));
                            return;
                        }
                    };
                    let existing = {
                        let entries = fabric.namespace(namespace).entries.lock().unwrap();
                        entries.get(&key).and_then(|e| e.value.clone())
                    };
                    let merged = match existing {
                        Some(old) => merge_values(&old, &fresh, prefer_fresh),
                        None => fresh,
                    };
                    fabric.write_memory(namespace, &key, Some(merged.clone()), ttl, Utc::now());
                    if let Err(e) = fabric
                        .inner
                        .store
                        .put(namespace, &key, Some(&merged), ttl)
                        .await
                    {
                        warn!(namespace, key = %key, error = %e, "refresh write failed");
                    }
                    Ok(Some(merged))
                }
                // Empty or failed refresh keeps the old value in place; only
                // its age is unchanged, so the next stale hit tries again.
                Ok(None) => {
                    debug!(namespace, key = %key, "refresh produced empty result, keeping stale value");
                    Ok(None)
                }
                Err(message) => {
                    warn!(namespace, key = %key, message = %message, "background refresh failed");
                    Err(message)
                }
            };
            fabric.finish_flight(namespace, &key, outcome);
        });
    }

    fn finish_flight(&self, namespace: &'static str, key: &str, outcome: FlightOutcome) {
        let sender = {
            let mut inflight = self.namespace(namespace).inflight.lock().unwrap();
            inflight.remove(key)
        };
        if let Some(sender) = sender {
            // No receivers is normal; send only fails in that case.
            let _ = sender.send(outcome);
        }
    }

    fn write_memory(
        &self,
        namespace: &'static str,
        key: &str,
        value: Option<serde_json::Value>,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) {
        let mut entries = self.namespace(namespace).entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            MemEntry {
                value,
                created_at,
                ttl,
            },
        );

        // Bounded per namespace; oldest-by-creation is evicted first.
        while entries.len() > self.inner.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

fn deserialize_value<T: DeserializeOwned>(
    value: Option<&serde_json::Value>,
) -> Result<Option<T>, CacheError> {
    match value {
        Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        None => Ok(None),
    }
}

/// Merge rule for background refreshes.
///
/// For link lists, fresh items are added and existing items keyed by their
/// fingerprint survive; `prefer_fresh` lets the newer entry overwrite.
/// Non-list values are replaced wholesale.
pub fn merge_values(
    existing: &serde_json::Value,
    fresh: &serde_json::Value,
    prefer_fresh: bool,
) -> serde_json::Value {
    let (Some(old_items), Some(new_items)) = (existing.as_array(), fresh.as_array()) else {
        return fresh.clone();
    };

    let mut merged: Vec<serde_json::Value> = Vec::with_capacity(old_items.len() + new_items.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in old_items {
        let key = item_fingerprint(item);
        if let Some(key) = key {
            index.insert(key, merged.len());
        }
        merged.push(item.clone());
    }

    for item in new_items {
        match item_fingerprint(item).and_then(|k| index.get(&k).copied()) {
            Some(slot) => {
                if prefer_fresh {
                    merged[slot] = item.clone();
                }
            }
            None => merged.push(item.clone()),
        }
    }

    serde_json::Value::Array(merged)
}

/// Provider-defined fingerprint: hash > url > name, first present.
fn item_fingerprint(item: &serde_json::Value) -> Option<String> {
    for field in ["fingerprint", "hash", "url", "name", "label"] {
        if let Some(value) = item.get(field).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return Some(format!("{field}:{value}"));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn fabric() -> CacheFabric {
        let store = KvStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap();
        CacheFabric::new(store, &CacheConfig::default())
    }

    #[tokio::test]
    async fn single_flight_runs_producer_once() {
        let fabric = fabric().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fabric = fabric.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                fabric
                    .get_or_compute(
                        NS_STREAMS,
                        "p:movie:tt1",
                        Duration::from_secs(60),
                        ComputeOptions::default(),
                        move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, String>(Some(vec!["link-a".to_string()]))
                        },
                    )
                    .await
            }));
        }

        for handle in handles {
            let value: Option<Vec<String>> = handle.await.unwrap().unwrap();
            assert_eq!(value, Some(vec!["link-a".to_string()]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn joined_waiters_observe_producer_error() {
        let fabric = fabric().await;

        let slow = {
            let fabric = fabric.clone();
            tokio::spawn(async move {
                fabric
                    .get_or_compute::<Vec<String>, _, _>(
                        NS_STREAMS,
                        "p:movie:tt9",
                        Duration::from_secs(60),
                        ComputeOptions::default(),
                        || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err("upstream exploded".to_string())
                        },
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        let joined = fabric
            .get_or_compute::<Vec<String>, _, _>(
                NS_STREAMS,
                "p:movie:tt9",
                Duration::from_secs(60),
                ComputeOptions::default(),
                || async { panic!("second producer must never run") },
            )
            .await;

        assert!(matches!(joined, Err(CacheError::ProducerFailed { .. })));
        assert!(slow.await.unwrap().is_err());

        // The error was not cached; the next call may produce again.
        let retry: Option<Vec<String>> = fabric
            .get_or_compute(
                NS_STREAMS,
                "p:movie:tt9",
                Duration::from_secs(60),
                ComputeOptions::default(),
                || async { Ok(Some(vec!["fresh".to_string()])) },
            )
            .await
            .unwrap();
        assert_eq!(retry, Some(vec!["fresh".to_string()]));
    }

    #[tokio::test]
    async fn negative_results_cached_at_quarter_ttl() {
        let fabric = fabric().await;

        let value: Option<Vec<String>> = fabric
            .get_or_compute(
                NS_STREAMS,
                "p:movie:none",
                Duration::from_secs(400),
                ComputeOptions::default(),
                || async { Ok(None) },
            )
            .await
            .unwrap();
        assert!(value.is_none());

        let stored = fabric
            .store()
            .get(NS_STREAMS, "p:movie:none")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.value.is_none());
        assert_eq!(stored.ttl, Duration::from_secs(100));

        // Second call hits the cached negative, producer must not run.
        let value: Option<Vec<String>> = fabric
            .get_or_compute(
                NS_STREAMS,
                "p:movie:none",
                Duration::from_secs(400),
                ComputeOptions::default(),
                || async { panic!("negative hit must not produce") },
            )
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn persistent_tier_survives_memory_loss() {
        let store = KvStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap();
        let first = CacheFabric::new(store.clone(), &CacheConfig::default());
        first
            .set(NS_META, "movie:tt1", &"cached-meta".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        // A second fabric over the same store models a fresh worker.
        let second = CacheFabric::new(store, &CacheConfig::default());
        let value: Option<String> = second
            .get_or_compute(
                NS_META,
                "movie:tt1",
                Duration::from_secs(60),
                ComputeOptions::default(),
                || async { panic!("persistent hit must not produce") },
            )
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("cached-meta"));
    }

    #[tokio::test]
    async fn eviction_is_oldest_first_and_bounded() {
        let store = KvStore::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        })
        .await
        .unwrap();
        let fabric = CacheFabric::new(
            store,
            &CacheConfig {
                memory_max_entries: 2,
                ..CacheConfig::default()
            },
        );

        fabric.write_memory(
            NS_STREAMS,
            "old",
            Some(serde_json::json!(1)),
            Duration::from_secs(60),
            Utc::now() - chrono::Duration::seconds(30),
        );
        fabric.write_memory(
            NS_STREAMS,
            "mid",
            Some(serde_json::json!(2)),
            Duration::from_secs(60),
            Utc::now() - chrono::Duration::seconds(15),
        );
        fabric.write_memory(
            NS_STREAMS,
            "new",
            Some(serde_json::json!(3)),
            Duration::from_secs(60),
            Utc::now(),
        );

        let sizes = fabric.sizes();
        assert_eq!(sizes[NS_STREAMS], 2);
        let entries = fabric.namespace(NS_STREAMS).entries.lock().unwrap();
        assert!(!entries.contains_key("old"));
        assert!(entries.contains_key("mid"));
        assert!(entries.contains_key("new"));
    }

    #[test]
    fn merge_is_superset_of_existing() {
        let existing = serde_json::json!([
            {"url": "https://a/1", "label": "A"},
            {"url": "https://a/2", "label": "B"},
        ]);
        let fresh = serde_json::json!([
            {"url": "https://a/2", "label": "B-updated"},
            {"url": "https://a/3", "label": "C"},
        ]);

        let merged = merge_values(&existing, &fresh, false);
        let items = merged.as_array().unwrap();
        assert_eq!(items.len(), 3);
        // existing survives without prefer-fresh
        assert_eq!(items[1]["label"], "B");

        let merged = merge_values(&existing, &fresh, true);
        let items = merged.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1]["label"], "B-updated");
    }

    #[test]
    fn merge_fingerprint_prefers_hash_over_url() {
        let existing = serde_json::json!([
            {"hash": "h1", "url": "https://old/1", "label": "A"},
        ]);
        let fresh = serde_json::json!([
            {"hash": "h1", "url": "https://new/1", "label": "A"},
        ]);
        let merged = merge_values(&existing, &fresh, false);
        let items = merged.as_array().unwrap();
        // same hash, different url: recognized as the same item
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["url"], "https://old/1");
    }
}
