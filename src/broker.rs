//! Call correlation broker.
//!
//! Matches asynchronous requests to their eventual responses via a unique
//! id, independent of which transport carried them. One broker instance is
//! shared by all transports in an execution context, so ids are UUIDs.
//!
//! A registered call with a non-zero timeout is *completed* with
//! [`CallOutcome::TimedOut`] when the timer fires, so callers always receive
//! a completion rather than a permanently suspended future. `resolve` and
//! `reject` on an unknown id (already completed or expired) are logged
//! no-ops, tolerating duplicate or late delivery from an unreliable channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default timeout for companion-process calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Terminal state of a correlated call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The remote party answered with a value.
    Resolved(serde_json::Value),
    /// The timer fired before any answer arrived.
    TimedOut,
    /// The remote party (or a local actor) failed the call.
    Failed(String),
}

struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    timer: Option<JoinHandle<()>>,
}

/// Awaitable side of a registered call.
pub struct CallHandle {
    rx: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    /// Wait for the call to complete.
    pub async fn wait(self) -> CallOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| CallOutcome::Failed("call broker dropped".to_string()))
    }
}

/// Shared registry of pending calls.
///
/// Cheaply cloneable; clones share the same pending-call table.
#[derive(Clone, Default)]
pub struct CallBroker {
    calls: Arc<Mutex<HashMap<Uuid, PendingCall>>>,
}

impl CallBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call, optionally armed with a timeout.
    ///
    /// Returns the universally unique call id and the handle the caller
    /// awaits. `None` disables the timer entirely (the call then only
    /// completes through `resolve`/`reject`).
    pub fn register(&self, timeout: Option<Duration>) -> (Uuid, CallHandle) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let timer = timeout.map(|t| self.spawn_timer(id, t));
        self.calls
            .lock()
            .expect("broker lock poisoned")
            .insert(id, PendingCall { tx, timer });
        tracing::trace!(%id, "registered call");
        (id, CallHandle { rx })
    }

    /// Register with the default 5 s timeout.
    pub fn register_default(&self) -> (Uuid, CallHandle) {
        self.register(Some(DEFAULT_CALL_TIMEOUT))
    }

    /// Rearm the timeout of a pending call without changing its id.
    ///
    /// Used as a keep-alive while a human is deciding; a logged no-op when
    /// the id is unknown or the call was registered without a timer.
    pub fn extend(&self, id: Uuid, timeout: Duration) {
        let mut calls = self.calls.lock().expect("broker lock poisoned");
        let Some(call) = calls.get_mut(&id) else {
            tracing::warn!(%id, "extend for unknown call id");
            return;
        };
        let Some(timer) = call.timer.take() else {
            return;
        };
        timer.abort();
        call.timer = Some(self.spawn_timer(id, timeout));
    }

    /// Complete a call with a value.
    pub fn resolve(&self, id: Uuid, value: serde_json::Value) {
        self.complete(id, CallOutcome::Resolved(value), "resolve");
    }

    /// Complete a call with a failure.
    pub fn reject(&self, id: Uuid, reason: impl Into<String>) {
        self.complete(id, CallOutcome::Failed(reason.into()), "reject");
    }

    /// Whether a call id is still pending.
    pub fn contains(&self, id: Uuid) -> bool {
        self.calls
            .lock()
            .expect("broker lock poisoned")
            .contains_key(&id)
    }

    /// Number of pending calls.
    pub fn pending_count(&self) -> usize {
        self.calls.lock().expect("broker lock poisoned").len()
    }

    fn spawn_timer(&self, id: Uuid, timeout: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            broker.complete(id, CallOutcome::TimedOut, "timeout");
        })
    }

    fn complete(&self, id: Uuid, outcome: CallOutcome, op: &str) {
        let call = self
            .calls
            .lock()
            .expect("broker lock poisoned")
            .remove(&id);
        match call {
            Some(call) => {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
                // The receiver may already be gone; late completion is fine.
                let _ = call.tx.send(outcome);
            }
            None => tracing::warn!(%id, op, "completion for unknown call id"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_resolve_completes_call() {
        let broker = CallBroker::new();
        let (id, handle) = broker.register(None);

        broker.resolve(id, serde_json::json!({"ok": true}));

        assert_eq!(
            handle.wait().await,
            CallOutcome::Resolved(serde_json::json!({"ok": true}))
        );
        assert!(!broker.contains(id));
    }

    #[tokio::test]
    async fn test_reject_completes_call() {
        let broker = CallBroker::new();
        let (id, handle) = broker.register(None);

        broker.reject(id, "nope");

        assert_eq!(handle.wait().await, CallOutcome::Failed("nope".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_resolves_within_window() {
        let broker = CallBroker::new();
        let (id, handle) = broker.register(Some(Duration::from_millis(50)));

        let start = Instant::now();
        let outcome = handle.wait().await;
        let elapsed = start.elapsed();

        assert_eq!(outcome, CallOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100), "took {elapsed:?}");
        assert!(!broker.contains(id));
    }

    #[tokio::test]
    async fn test_late_resolve_is_noop() {
        let broker = CallBroker::new();
        let (id, handle) = broker.register(Some(Duration::from_millis(20)));

        assert_eq!(handle.wait().await, CallOutcome::TimedOut);

        // Duplicate/late delivery must not panic or disturb other calls.
        broker.resolve(id, serde_json::Value::Null);
        broker.reject(id, "late");
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_extend_defeats_timeout() {
        let broker = CallBroker::new();
        let (id, handle) = broker.register(Some(Duration::from_millis(40)));

        // Keep-alive loop, the way a chooser UI pings while a human decides.
        let keeper = broker.clone();
        let extender = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                keeper.extend(id, Duration::from_millis(40));
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(broker.contains(id), "call expired despite keep-alive");

        broker.resolve(id, serde_json::json!("picked"));
        assert_eq!(
            handle.wait().await,
            CallOutcome::Resolved(serde_json::json!("picked"))
        );
        extender.await.unwrap();
    }

    #[tokio::test]
    async fn test_extend_unknown_id_is_noop() {
        let broker = CallBroker::new();
        broker.extend(Uuid::new_v4(), Duration::from_millis(10));
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_registrations() {
        let broker = CallBroker::new();
        let (a, _ha) = broker.register(None);
        let (b, _hb) = broker.register(None);
        assert_ne!(a, b);
        assert_eq!(broker.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_no_timer_call_stays_pending() {
        let broker = CallBroker::new();
        let (id, _handle) = broker.register(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(broker.contains(id));
    }
}
