//! In-process reference implementation of [`DocumentStore`].
//!
//! Backs the integration tests: several clients share one `MemoryStore`
//! the way real clients share a remote store. Failures can be scripted
//! (`fail_next`, `set_unavailable`) so the retry and offline paths are
//! exercised without a network.

use super::{merge_documents, Document, DocumentStore, UpdateFn};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Buffered change events per watched key.
const WATCH_CHANNEL_CAPACITY: usize = 32;

#[derive(Default)]
struct FaultPlan {
    /// Fail this many upcoming operations with a transient error.
    fail_next: u32,
    /// While set, every operation fails with `StoreError::Unavailable`.
    unavailable: bool,
}

pub struct MemoryStore {
    documents: Mutex<HashMap<String, Document>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<Option<Document>>>>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            feeds: Mutex::new(HashMap::new()),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Make the next `n` operations fail with a transient backend error.
    pub fn fail_next(&self, n: u32) {
        self.faults.lock().expect("fault lock").fail_next = n;
    }

    /// Toggle hard unavailability (offline, not merely flaky).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().expect("fault lock").unavailable = unavailable;
    }

    fn check_faults(&self) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().expect("fault lock");
        if faults.unavailable {
            return Err(StoreError::Unavailable);
        }
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }

    fn publish(&self, key: &str, doc: Option<&Document>) {
        let feeds = self.feeds.lock().expect("feed lock");
        if let Some(sender) = feeds.get(key) {
            // Nobody listening is fine.
            let _ = sender.send(doc.cloned());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StoreError> {
        self.check_faults()?;
        let documents = self.documents.lock().expect("document lock");
        Ok(documents.get(key).cloned())
    }

    async fn merge(&self, key: &str, patch: Document) -> Result<(), StoreError> {
        self.check_faults()?;
        let updated = {
            let mut documents = self.documents.lock().expect("document lock");
            let doc = documents
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            merge_documents(doc, patch);
            doc.clone()
        };
        self.publish(key, Some(&updated));
        Ok(())
    }

    async fn put(&self, key: &str, doc: Document) -> Result<(), StoreError> {
        self.check_faults()?;
        self.documents
            .lock()
            .expect("document lock")
            .insert(key.to_string(), doc.clone());
        self.publish(key, Some(&doc));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_faults()?;
        self.documents.lock().expect("document lock").remove(key);
        self.publish(key, None);
        Ok(())
    }

    async fn update(&self, key: &str, apply: UpdateFn) -> Result<Option<Document>, StoreError> {
        self.check_faults()?;
        let (pre_image, post_image) = {
            let mut documents = self.documents.lock().expect("document lock");
            let pre_image = documents.get(key).cloned();
            let post_image = apply(pre_image.clone());
            match &post_image {
                Some(doc) => {
                    documents.insert(key.to_string(), doc.clone());
                }
                None => {
                    documents.remove(key);
                }
            }
            (pre_image, post_image)
        };
        self.publish(key, post_image.as_ref());
        Ok(pre_image)
    }

    fn watch(&self, key: &str) -> broadcast::Receiver<Option<Document>> {
        let mut feeds = self.feeds.lock().expect("feed lock");
        feeds
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_absent_key_is_none() {
        let store = MemoryStore::new();
        assert!(store.get("sessions/today").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_creates_then_extends() {
        let store = MemoryStore::new();
        store
            .merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        store
            .merge("sessions/today", json!({"admin_name": "Ping"}))
            .await
            .unwrap();
        assert_eq!(
            store.get("sessions/today").await.unwrap(),
            Some(json!({"phase": "setup", "admin_name": "Ping"}))
        );
    }

    #[tokio::test]
    async fn test_watch_receives_each_change() {
        let store = MemoryStore::new();
        let mut feed = store.watch("sessions/today");

        store
            .merge("sessions/today", json!({"phase": "setup"}))
            .await
            .unwrap();
        store.delete("sessions/today").await.unwrap();

        assert_eq!(feed.recv().await.unwrap(), Some(json!({"phase": "setup"})));
        assert_eq!(feed.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_returns_pre_image_and_applies() {
        let store = MemoryStore::new();
        store.put("k", json!({"n": 1})).await.unwrap();

        let pre = store
            .update("k", Box::new(|_| Some(json!({"n": 2}))))
            .await
            .unwrap();
        assert_eq!(pre, Some(json!({"n": 1})));
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn test_update_returning_none_deletes() {
        let store = MemoryStore::new();
        store.put("k", json!({"n": 1})).await.unwrap();
        store.update("k", Box::new(|_| None)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_next_injects_then_recovers() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_err());
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_fails_until_cleared() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        match store.merge("k", json!({})).await {
            Err(StoreError::Unavailable) => {}
            other => panic!("expected Unavailable, got {other:?}"),
        }
        store.set_unavailable(false);
        assert!(store.merge("k", json!({})).await.is_ok());
    }
}
