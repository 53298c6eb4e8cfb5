//! Connection health tracking for the sync layer.
//!
//! One `ConnectionMonitor` exists per process. The sync layer reports the
//! outcome of every remote attempt here; subscribed listeners (typically
//! the UI layer) receive the full state on every change. The monitor holds
//! in-memory state only and performs no I/O of its own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

/// Health of the last remote operations, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// User-visible connectivity. A single transient failure does not flip
    /// this; only a run of failures past the threshold does.
    pub is_connected: bool,
    pub last_error: Option<String>,
    /// Consecutive failed attempts since the last success.
    pub retry_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_connected: true,
            last_error: None,
            retry_count: 0,
            last_success_at: None,
        }
    }
}

type Listener = Box<dyn Fn(&ConnectionState) + Send + Sync>;

/// Observer over [`ConnectionState`]; constructed once and shared by `Arc`.
pub struct ConnectionMonitor {
    state: Mutex<ConnectionState>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    failure_threshold: u32,
}

impl ConnectionMonitor {
    pub fn new(failure_threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectionState::default()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            failure_threshold,
        })
    }

    /// Current state snapshot.
    pub fn current(&self) -> ConnectionState {
        self.state.lock().expect("connection state lock").clone()
    }

    /// Register a listener; it receives the full state on every change.
    ///
    /// The listener is dropped when the returned guard is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("connection listeners lock")
            .insert(id, Box::new(listener));
        ListenerGuard {
            monitor: Arc::downgrade(self),
            id,
        }
    }

    /// Record the outcome of one remote attempt.
    ///
    /// Success resets the state to fresh-connected and stamps
    /// `last_success_at`. Failure increments `retry_count` and records the
    /// error; `is_connected` only flips once the count exceeds the
    /// threshold.
    pub fn report(&self, success: bool, error: Option<&str>) {
        let snapshot = {
            let mut state = self.state.lock().expect("connection state lock");
            if success {
                state.is_connected = true;
                state.retry_count = 0;
                state.last_error = None;
                state.last_success_at = Some(Utc::now());
            } else {
                state.retry_count += 1;
                state.last_error = error.map(|e| e.to_string());
                if state.retry_count > self.failure_threshold {
                    if state.is_connected {
                        warn!(
                            retry_count = state.retry_count,
                            error, "connection degraded"
                        );
                    }
                    state.is_connected = false;
                }
            }
            state.clone()
        };
        self.notify(&snapshot);
    }

    fn notify(&self, state: &ConnectionState) {
        let listeners = self.listeners.lock().expect("connection listeners lock");
        for listener in listeners.values() {
            listener(state);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners
            .lock()
            .expect("connection listeners lock")
            .remove(&id);
    }
}

/// Removes its listener from the monitor when dropped.
pub struct ListenerGuard {
    monitor: Weak<ConnectionMonitor>,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_initial_state_is_connected() {
        let monitor = ConnectionMonitor::new(2);
        let state = monitor.current();
        assert!(state.is_connected);
        assert_eq!(state.retry_count, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_success_at.is_none());
    }

    #[test]
    fn test_single_failure_does_not_flip_status() {
        let monitor = ConnectionMonitor::new(2);
        monitor.report(false, Some("timeout"));
        let state = monitor.current();
        assert!(state.is_connected);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_failures_past_threshold_flip_status() {
        let monitor = ConnectionMonitor::new(2);
        monitor.report(false, Some("a"));
        monitor.report(false, Some("b"));
        assert!(monitor.current().is_connected);
        monitor.report(false, Some("c"));
        let state = monitor.current();
        assert!(!state.is_connected);
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.last_error.as_deref(), Some("c"));
    }

    #[test]
    fn test_success_resets_to_fresh_state() {
        let monitor = ConnectionMonitor::new(0);
        monitor.report(false, Some("down"));
        assert!(!monitor.current().is_connected);

        monitor.report(true, None);
        let state = monitor.current();
        assert!(state.is_connected);
        assert_eq!(state.retry_count, 0);
        assert!(state.last_error.is_none());
        assert!(state.last_success_at.is_some());
    }

    #[test]
    fn test_listeners_receive_every_change() {
        let monitor = ConnectionMonitor::new(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let _guard = monitor.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.report(false, Some("x"));
        monitor.report(true, None);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multiple_listeners_all_notified() {
        let monitor = ConnectionMonitor::new(2);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let a2 = a.clone();
        let b2 = b.clone();
        let _ga = monitor.subscribe(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        let _gb = monitor.subscribe(move |state| {
            if !state.is_connected {
                b2.fetch_add(1, Ordering::SeqCst);
            }
        });

        monitor.report(true, None);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dropped_guard_unsubscribes() {
        let monitor = ConnectionMonitor::new(2);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let guard = monitor.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        monitor.report(true, None);
        drop(guard);
        monitor.report(true, None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
