//! Wall-clock deadline watcher.
//!
//! While a deadline is set and not yet reached, a background task compares
//! wall-clock time to the deadline once per poll interval. On crossing it
//! performs exactly one merge-write setting `deadline_reached = true` and
//! stops. The poll is local, so the flag may lag the true deadline by up to
//! one interval; it converges once any client with a live watcher writes.

use crate::config::DeadlineSettings;
use crate::session::document::patch_deadline_reached;
use crate::sync::SyncClient;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Owns at most one polling task; re-arming replaces it.
pub struct DeadlineWatcher {
    settings: DeadlineSettings,
    armed_for: Option<DateTime<Utc>>,
    task: Option<JoinHandle<()>>,
}

impl DeadlineWatcher {
    pub fn new(settings: DeadlineSettings) -> Self {
        Self {
            settings,
            armed_for: None,
            task: None,
        }
    }

    /// The deadline currently being watched, if any.
    pub fn armed_for(&self) -> Option<DateTime<Utc>> {
        self.armed_for
    }

    /// Start (or restart) polling toward `deadline`. Re-arming for the
    /// deadline already being watched is a no-op.
    pub fn arm(&mut self, sync: SyncClient, session_key: String, deadline: DateTime<Utc>) {
        if self.armed_for == Some(deadline) && self.task.as_ref().is_some_and(|t| !t.is_finished())
        {
            return;
        }
        self.disarm();
        self.armed_for = Some(deadline);
        let poll_interval = self.settings.poll_interval();
        debug!(%deadline, "deadline watcher armed");
        self.task = Some(tokio::spawn(async move {
            loop {
                if Utc::now() >= deadline {
                    if let Err(err) = sync.write_merge(&session_key, patch_deadline_reached()).await
                    {
                        warn!(error = %err, "deadline crossing write failed");
                    }
                    return;
                }
                tokio::time::sleep(poll_interval).await;
            }
        }));
    }

    /// Stop polling without writing anything.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.armed_for = None;
    }
}

impl Drop for DeadlineWatcher {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::connection::ConnectionMonitor;
    use crate::store::{DocumentStore, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_watcher() -> DeadlineWatcher {
        DeadlineWatcher::new(DeadlineSettings {
            poll_interval_ms: 10,
        })
    }

    fn client(store: Arc<MemoryStore>) -> SyncClient {
        SyncClient::new(
            store,
            ConnectionMonitor::new(2),
            SyncSettings::default().with_base_backoff(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_crossing_writes_reached_once_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let sync = client(store.clone());
        store
            .put("sessions/s1", json!({"deadline_reached": false}))
            .await
            .unwrap();

        let mut watcher = fast_watcher();
        let deadline = Utc::now() + chrono::Duration::milliseconds(30);
        watcher.arm(sync, "sessions/s1".into(), deadline);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let doc = store.get("sessions/s1").await.unwrap().unwrap();
        assert_eq!(doc["deadline_reached"], json!(true));

        // The task stopped after its single write.
        assert!(watcher.task.as_ref().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_disarm_prevents_the_write() {
        let store = Arc::new(MemoryStore::new());
        let sync = client(store.clone());
        store
            .put("sessions/s1", json!({"deadline_reached": false}))
            .await
            .unwrap();

        let mut watcher = fast_watcher();
        watcher.arm(
            sync,
            "sessions/s1".into(),
            Utc::now() + chrono::Duration::milliseconds(50),
        );
        watcher.disarm();
        assert!(watcher.armed_for().is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let doc = store.get("sessions/s1").await.unwrap().unwrap();
        assert_eq!(doc["deadline_reached"], json!(false));
    }

    #[tokio::test]
    async fn test_rearming_same_deadline_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let sync = client(store.clone());
        let mut watcher = fast_watcher();
        let deadline = Utc::now() + chrono::Duration::seconds(60);

        watcher.arm(sync.clone(), "sessions/s1".into(), deadline);
        let first_task_running = watcher.task.as_ref().unwrap().is_finished();
        watcher.arm(sync, "sessions/s1".into(), deadline);
        assert_eq!(watcher.armed_for(), Some(deadline));
        assert!(!first_task_running);
    }
}
