//! Resilience envelope around the document store.
//!
//! Every remote operation goes through `SyncClient`, which applies a
//! uniform policy:
//! - per-attempt timeout (`tokio::time::timeout`)
//! - retry with exponential backoff plus jitter
//! - per-attempt health reports to the [`ConnectionMonitor`]
//! - offline fallback: when the store is entirely unavailable, writes are
//!   journaled locally and resolved as accepted-but-degraded, and reads are
//!   served from the last cached snapshot
//!
//! Subscriptions are pumped by a spawned task that delivers the initial
//! snapshot, then every remote change, resubscribing transparently when the
//! underlying feed lags or drops.

use crate::config::SyncSettings;
use crate::connection::ConnectionMonitor;
use crate::errors::{StoreError, SyncError};
use crate::store::{merge_documents, Document, DocumentStore};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on the random jitter added to each backoff wait.
const BACKOFF_JITTER_MS: u64 = 250;

/// Pause before resubscribing after the change feed drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a read through the sync layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Fresh from the store (`None` = document does not exist).
    Fresh(Option<Document>),
    /// Store unreachable; last known snapshot served instead.
    Cached(Option<Document>),
    /// Store unreachable and nothing was ever fetched for this key.
    NoData,
}

impl ReadResult {
    /// The document regardless of freshness, if any was available.
    pub fn into_document(self) -> Option<Document> {
        match self {
            ReadResult::Fresh(doc) | ReadResult::Cached(doc) => doc,
            ReadResult::NoData => None,
        }
    }
}

/// Outcome of a write through the sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The store acknowledged the write.
    Synced,
    /// The store is unavailable; the write was journaled for replay and the
    /// connection is flagged degraded.
    Queued,
}

/// A merge-write waiting in the offline journal.
#[derive(Debug, Clone)]
struct PendingWrite {
    key: String,
    patch: Document,
}

struct SyncInner {
    store: Arc<dyn DocumentStore>,
    monitor: Arc<ConnectionMonitor>,
    settings: SyncSettings,
    /// Last known snapshot per key, kept current by reads, writes, and
    /// subscription pumps.
    cache: Mutex<HashMap<String, Option<Document>>>,
    /// Writes accepted while offline, in submission order.
    pending: Mutex<VecDeque<PendingWrite>>,
}

/// Cheaply cloneable handle executing store operations under the sync policy.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncInner>,
}

impl SyncClient {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        monitor: Arc<ConnectionMonitor>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                monitor,
                settings,
                cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.inner.monitor
    }

    /// Last known snapshot for `key`, if any operation ever saw one.
    pub fn cached(&self, key: &str) -> Option<Option<Document>> {
        self.inner.cache.lock().expect("cache lock").get(key).cloned()
    }

    /// Number of journaled offline writes.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("pending lock").len()
    }

    /// Whether an offline write for `key` is still waiting for replay.
    pub fn has_pending(&self, key: &str) -> bool {
        self.inner
            .pending
            .lock()
            .expect("pending lock")
            .iter()
            .any(|w| w.key == key)
    }

    /// Read the document at `key`, falling back to the cached snapshot when
    /// the store is unavailable.
    pub async fn read(&self, key: &str) -> Result<ReadResult, SyncError> {
        let store = self.inner.store.clone();
        let owned_key = key.to_string();
        match self
            .with_retry("read", move || {
                let store = store.clone();
                let key = owned_key.clone();
                async move { store.get(&key).await }
            })
            .await
        {
            Ok(doc) => {
                self.cache_put(key, doc.clone());
                Ok(ReadResult::Fresh(doc))
            }
            Err(err) if is_offline(&err) => match self.cached(key) {
                Some(snapshot) => {
                    debug!(key, "store unavailable, serving cached snapshot");
                    Ok(ReadResult::Cached(snapshot))
                }
                None => Ok(ReadResult::NoData),
            },
            Err(err) => Err(err),
        }
    }

    /// Merge-write `patch` into the document at `key`.
    ///
    /// When the store is entirely unavailable the patch is applied to the
    /// local cache, journaled, and the call resolves `Ok(Queued)` — offline
    /// is degraded operation, not an error. Transient failures that exhaust
    /// the retry budget are returned to the caller for a manual retry.
    pub async fn write_merge(&self, key: &str, patch: Document) -> Result<WriteOutcome, SyncError> {
        let store = self.inner.store.clone();
        let owned_key = key.to_string();
        let owned_patch = patch.clone();
        match self
            .with_retry("write_merge", move || {
                let store = store.clone();
                let key = owned_key.clone();
                let patch = owned_patch.clone();
                async move { store.merge(&key, patch).await }
            })
            .await
        {
            Ok(()) => {
                self.cache_merge(key, patch);
                Ok(WriteOutcome::Synced)
            }
            Err(err) if is_offline(&err) => {
                warn!(key, "store unavailable, journaling write");
                self.cache_merge(key, patch.clone());
                self.inner
                    .pending
                    .lock()
                    .expect("pending lock")
                    .push_back(PendingWrite {
                        key: key.to_string(),
                        patch,
                    });
                Ok(WriteOutcome::Queued)
            }
            Err(err) => Err(err),
        }
    }

    /// Atomic read-modify-write at `key`; returns the pre-image.
    ///
    /// Transactions are never journaled: they exist to observe the true
    /// remote state, so an unavailable store is a real failure here.
    pub async fn update<F>(&self, key: &str, apply: F) -> Result<Option<Document>, SyncError>
    where
        F: Fn(Option<Document>) -> Option<Document> + Send + Sync + 'static,
    {
        let apply = Arc::new(apply);
        let store = self.inner.store.clone();
        let owned_key = key.to_string();
        let pre_image = self
            .with_retry("update", move || {
                let store = store.clone();
                let key = owned_key.clone();
                let apply = apply.clone();
                async move {
                    store
                        .update(&key, Box::new(move |doc| apply(doc)))
                        .await
                }
            })
            .await?;
        Ok(pre_image)
    }

    /// Replace the whole document at `key`.
    pub async fn put(&self, key: &str, doc: Document) -> Result<(), SyncError> {
        let store = self.inner.store.clone();
        let owned_key = key.to_string();
        let owned_doc = doc.clone();
        self.with_retry("put", move || {
            let store = store.clone();
            let key = owned_key.clone();
            let doc = owned_doc.clone();
            async move { store.put(&key, doc).await }
        })
        .await?;
        self.cache_put(key, Some(doc));
        Ok(())
    }

    /// Replay journaled offline writes in submission order.
    ///
    /// Stops at the first write that still cannot be delivered; everything
    /// undelivered stays queued. Returns how many writes were flushed.
    pub async fn flush_pending(&self) -> Result<usize, SyncError> {
        let mut flushed = 0;
        loop {
            let next = self
                .inner
                .pending
                .lock()
                .expect("pending lock")
                .front()
                .cloned();
            let Some(write) = next else {
                return Ok(flushed);
            };

            let store = self.inner.store.clone();
            let key = write.key.clone();
            let patch = write.patch.clone();
            match self
                .with_retry("flush_pending", move || {
                    let store = store.clone();
                    let key = key.clone();
                    let patch = patch.clone();
                    async move { store.merge(&key, patch).await }
                })
                .await
            {
                Ok(()) => {
                    self.inner.pending.lock().expect("pending lock").pop_front();
                    flushed += 1;
                }
                Err(err) if is_offline(&err) => {
                    debug!(flushed, "store still unavailable, keeping journal");
                    return Ok(flushed);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Subscribe to the document at `key`.
    ///
    /// The feed first yields the current snapshot (including `None` for an
    /// empty session), then the full document on every remote change. The
    /// pump resubscribes transparently when the underlying feed lags or
    /// closes; dropping the feed aborts the pump.
    pub fn subscribe(&self, key: &str) -> DocumentFeed {
        let (tx, rx) = mpsc::channel(16);
        let client = self.clone();
        let key = key.to_string();
        let task = tokio::spawn(async move {
            client.pump(&key, tx).await;
        });
        DocumentFeed { rx, task }
    }

    async fn pump(&self, key: &str, tx: mpsc::Sender<Option<Document>>) {
        'resubscribe: loop {
            // Watch before the initial read so no change can fall between.
            let mut feed = self.inner.store.watch(key);
            let snapshot = match self.inner.store.get(key).await {
                Ok(doc) => {
                    self.cache_put(key, doc.clone());
                    doc
                }
                Err(err) => {
                    self.inner.monitor.report(false, Some(&err.to_string()));
                    // Serve the cache until the store comes back.
                    self.cached(key).unwrap_or(None)
                }
            };
            if tx.send(snapshot).await.is_err() {
                return;
            }

            loop {
                match feed.recv().await {
                    Ok(doc) => {
                        self.cache_put(key, doc.clone());
                        if tx.send(doc).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(key, skipped, "change feed lagged, resyncing");
                        continue 'resubscribe;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        warn!(key, "change feed closed, resubscribing");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue 'resubscribe;
                    }
                }
            }
        }
    }

    /// Run `op` under the retry policy: per-attempt timeout, exponential
    /// backoff with jitter between attempts, a health report per attempt.
    ///
    /// A hard-unavailable store short-circuits: backing off cannot help, and
    /// the caller's offline fallback should take over immediately.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let settings = &self.inner.settings;
        let mut last_err = StoreError::Timeout;
        for attempt in 0..settings.max_attempts {
            match tokio::time::timeout(settings.op_timeout(), op()).await {
                Ok(Ok(value)) => {
                    self.inner.monitor.report(true, None);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    self.inner.monitor.report(false, Some(&err.to_string()));
                    if err.is_unavailable() {
                        return Err(SyncError::Store(err));
                    }
                    debug!(label, attempt, error = %err, "attempt failed");
                    last_err = err;
                }
                Err(_) => {
                    self.inner.monitor.report(false, Some("attempt timed out"));
                    debug!(label, attempt, "attempt timed out");
                    last_err = StoreError::Timeout;
                }
            }
            if attempt + 1 < settings.max_attempts {
                tokio::time::sleep(backoff_with_jitter(settings, attempt)).await;
            }
        }
        warn!(label, attempts = settings.max_attempts, "retries exhausted");
        Err(SyncError::Exhausted {
            attempts: settings.max_attempts,
            source: last_err,
        })
    }

    fn cache_put(&self, key: &str, doc: Option<Document>) {
        self.inner
            .cache
            .lock()
            .expect("cache lock")
            .insert(key.to_string(), doc);
    }

    fn cache_merge(&self, key: &str, patch: Document) {
        let mut cache = self.inner.cache.lock().expect("cache lock");
        let entry = cache
            .entry(key.to_string())
            .or_insert_with(|| Some(Value::Object(Default::default())));
        let doc = entry.get_or_insert_with(|| Value::Object(Default::default()));
        merge_documents(doc, patch);
    }
}

fn backoff_with_jitter(settings: &SyncSettings, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    settings.backoff_for_attempt(attempt) + Duration::from_millis(jitter)
}

fn is_offline(err: &SyncError) -> bool {
    matches!(err.last_cause(), Some(cause) if cause.is_unavailable())
}

/// Stream of document snapshots produced by [`SyncClient::subscribe`].
pub struct DocumentFeed {
    rx: mpsc::Receiver<Option<Document>>,
    task: JoinHandle<()>,
}

impl DocumentFeed {
    /// Next snapshot; `None` once the pump has shut down.
    pub async fn next(&mut self) -> Option<Option<Document>> {
        self.rx.recv().await
    }
}

impl futures::Stream for DocumentFeed {
    type Item = Option<Document>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for DocumentFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_settings() -> SyncSettings {
        SyncSettings::default()
            .with_base_backoff(Duration::from_millis(5))
            .with_backoff_cap(Duration::from_millis(20))
            .with_op_timeout(Duration::from_millis(200))
    }

    fn client_over(store: Arc<MemoryStore>) -> SyncClient {
        let monitor = ConnectionMonitor::new(2);
        SyncClient::new(store, monitor, fast_settings())
    }

    #[tokio::test]
    async fn test_write_succeeds_after_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.fail_next(3);
        let outcome = client
            .write_merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Synced);

        // Success on the fourth attempt resets connection state.
        let state = client.monitor().current();
        assert!(state.is_connected);
        assert_eq!(state.retry_count, 0);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_cause() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.fail_next(10);
        let err = client
            .write_merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap_err();
        match err {
            SyncError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(source, StoreError::Backend(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(!client.monitor().current().is_connected);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let store = Arc::new(MemoryStore::new());
        let client = SyncClient::new(
            store,
            ConnectionMonitor::new(2),
            fast_settings()
                .with_max_attempts(2)
                .with_op_timeout(Duration::from_millis(20)),
        );

        let err = client
            .with_retry("hang", || std::future::pending::<Result<(), StoreError>>())
            .await
            .unwrap_err();
        match err {
            SyncError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, StoreError::Timeout));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_write_is_queued_not_failed() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.set_unavailable(true);
        let outcome = client
            .write_merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(client.pending_count(), 1);
        assert!(client.has_pending("sessions/today"));

        // The optimistic cache already reflects the write.
        assert_eq!(
            client.cached("sessions/today"),
            Some(Some(json!({"phase": "setup"})))
        );
    }

    #[tokio::test]
    async fn test_flush_pending_replays_in_order() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.set_unavailable(true);
        client
            .write_merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        client
            .write_merge("sessions/today", json!({"phase": "ordering"}))
            .await
            .unwrap();
        assert_eq!(client.pending_count(), 2);

        store.set_unavailable(false);
        let flushed = client.flush_pending().await.unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(client.pending_count(), 0);
        assert_eq!(
            store.get("sessions/today").await.unwrap(),
            Some(json!({"phase": "ordering"}))
        );
    }

    #[tokio::test]
    async fn test_flush_keeps_journal_while_still_offline() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.set_unavailable(true);
        client.write_merge("k", json!({"a": 1})).await.unwrap();
        let flushed = client.flush_pending().await.unwrap();
        assert_eq!(flushed, 0);
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_read_serves_cache_when_unavailable() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.put("k", json!({"n": 1})).await.unwrap();
        assert_eq!(
            client.read("k").await.unwrap(),
            ReadResult::Fresh(Some(json!({"n": 1})))
        );

        store.set_unavailable(true);
        assert_eq!(
            client.read("k").await.unwrap(),
            ReadResult::Cached(Some(json!({"n": 1})))
        );
    }

    #[tokio::test]
    async fn test_read_no_data_when_never_fetched() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.set_unavailable(true);
        assert_eq!(client.read("k").await.unwrap(), ReadResult::NoData);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_snapshot_and_changes() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        let mut feed = client.subscribe("sessions/today");
        // Initial snapshot: the document does not exist yet.
        assert_eq!(feed.next().await.unwrap(), None);

        store
            .merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        assert_eq!(
            feed.next().await.unwrap(),
            Some(json!({"phase": "setup"}))
        );
    }

    #[tokio::test]
    async fn test_update_returns_pre_image() {
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone());

        store.put("k", json!({"n": 1})).await.unwrap();
        let pre = client.update("k", |_| Some(json!({"n": 2}))).await.unwrap();
        assert_eq!(pre, Some(json!({"n": 1})));
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"n": 2})));
    }
}
