//! In-process fan-out of device events.
//!
//! An [`EventBus`] is a cheap cloneable handle; every clone shares the
//! same subscriber table. The text and imaging clients are usually given
//! clones of one bus so the text channel's mode changes can drive the
//! imaging channel.
//!
//! [`EventBus::emit`] snapshots the subscribers of the event's kind (plus
//! wildcard subscribers), then runs them in subscription order. Async
//! handlers are awaited one after another before `emit` returns. No lock
//! is held while a handler runs, so handlers may subscribe, unsubscribe
//! or emit themselves.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::trace;

use crate::message::ScopeEvent;

/// Subscribe under this kind to receive every event.
pub const ANY_EVENT: &str = "*";

/// Handle returned by `subscribe*`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SyncHandler = Arc<dyn Fn(&ScopeEvent) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(ScopeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Default)]
struct Registry {
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

// ── EventBus ─────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler.
    pub fn subscribe_sync<F>(&self, kind: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ScopeEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Handler::Sync(Arc::new(handler)))
    }

    /// Register an async handler. It receives its own copy of the event.
    pub fn subscribe<F, Fut>(&self, kind: &str, handler: F) -> SubscriptionId
    where
        F: Fn(ScopeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: AsyncHandler =
            Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(handler(event)) });
        self.insert(kind, Handler::Async(boxed))
    }

    /// Like [`subscribe_sync`](Self::subscribe_sync), but the returned
    /// guard unsubscribes when dropped.
    pub fn subscribe_scoped<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&ScopeEvent) + Send + Sync + 'static,
    {
        let id = self.subscribe_sync(kind, handler);
        self.guard(kind, id)
    }

    /// Async counterpart of [`subscribe_scoped`](Self::subscribe_scoped).
    pub fn subscribe_scoped_async<F, Fut>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(ScopeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.subscribe(kind, handler);
        self.guard(kind, id)
    }

    /// Remove one handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, kind: &str, id: SubscriptionId) -> bool {
        let mut table = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = table.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            table.remove(kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .map_or(0, Vec::len)
    }

    /// Kinds with at least one subscriber.
    pub fn kinds(&self) -> Vec<String> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Deliver `event` to its subscribers and wait for all of them.
    pub async fn emit(&self, event: ScopeEvent) {
        let snapshot = self.snapshot(&event.kind);
        trace!(kind = %event.kind, handlers = snapshot.len(), "emit");
        for handler in snapshot {
            match handler {
                Handler::Sync(f) => f(&event),
                Handler::Async(f) => f(event.clone()).await,
            }
        }
    }

    fn guard(&self, kind: &str, id: SubscriptionId) -> Subscription {
        Subscription {
            bus: self.clone(),
            kind: kind.to_string(),
            id,
        }
    }

    fn insert(&self, kind: &str, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn snapshot(&self, kind: &str) -> Vec<Handler> {
        let table = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let direct = table.get(kind).into_iter().flatten();
        let wildcard = if kind == ANY_EVENT {
            None
        } else {
            table.get(ANY_EVENT)
        };
        direct
            .chain(wildcard.into_iter().flatten())
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ── Subscription guard ───────────────────────────────────────────

/// Unsubscribes on drop.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct Subscription {
    bus: EventBus,
    kind: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.kind, self.id);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    fn event(kind: &str) -> ScopeEvent {
        ScopeEvent::from_fields(kind, json!({"Event": kind, "state": "working"}))
    }

    #[tokio::test]
    async fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.subscribe_sync("Stack", move |_| s.lock().unwrap().push("sync-1"));
        let s = seen.clone();
        bus.subscribe("Stack", move |_| {
            let s = s.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                s.lock().unwrap().push("async-2");
            }
        });
        let s = seen.clone();
        bus.subscribe_sync("Stack", move |_| s.lock().unwrap().push("sync-3"));

        bus.emit(event("Stack")).await;
        // async handler finished before emit returned
        assert_eq!(*seen.lock().unwrap(), vec!["sync-1", "async-2", "sync-3"]);
    }

    #[tokio::test]
    async fn only_matching_kind_and_wildcard_receive() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let h = hits.clone();
        bus.subscribe_sync("PiStatus", move |e| h.lock().unwrap().push(e.kind.clone()));
        let h = hits.clone();
        bus.subscribe_sync(ANY_EVENT, move |e| {
            h.lock().unwrap().push(format!("*{}", e.kind))
        });

        bus.emit(event("Stack")).await;
        bus.emit(event("PiStatus")).await;
        assert_eq!(*hits.lock().unwrap(), vec!["*Stack", "PiStatus", "*PiStatus"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = bus.subscribe_sync("View", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.listener_count("View"), 1);

        bus.emit(event("View")).await;
        assert!(bus.unsubscribe("View", id));
        assert!(!bus.unsubscribe("View", id));
        bus.emit(event("View")).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count("View"), 0);
    }

    #[tokio::test]
    async fn emit_uses_snapshot_taken_at_emission() {
        let bus = EventBus::new();
        let late_calls = Arc::new(AtomicU64::new(0));

        // The first handler subscribes another one mid-emit; the new
        // handler must only see the next emission.
        let inner_bus = bus.clone();
        let late = late_calls.clone();
        bus.subscribe_sync("Stack", move |_| {
            let late = late.clone();
            inner_bus.subscribe_sync("Stack", move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit(event("Stack")).await;
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        bus.emit(event("Stack")).await;
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scoped_subscription_unsubscribes_on_drop() {
        let bus = EventBus::new();
        let guard = bus.subscribe_scoped("AutoGoto", |_| {});
        assert_eq!(bus.listener_count("AutoGoto"), 1);
        drop(guard);
        assert_eq!(bus.listener_count("AutoGoto"), 0);
        assert!(bus.kinds().is_empty());

        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let guard = bus.subscribe_scoped_async("AutoGoto", move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.emit(event("AutoGoto")).await;
        drop(guard);
        bus.emit(event("AutoGoto")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clones_share_subscribers() {
        let bus = EventBus::new();
        let other = bus.clone();
        let hit = Arc::new(AtomicU64::new(0));
        let h = hit.clone();
        other.subscribe_sync("PiStatus", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(event("PiStatus")).await;
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
