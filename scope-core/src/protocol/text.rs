//! Request/response correlation on the text channel.
//!
//! Every outgoing command gets a fresh ID and a one-shot completion.
//! The reader task hands each inbound response to
//! [`TextProtocol::handle_incoming_message`], which fills the matching
//! completion or, when nobody is waiting for that ID, republishes the
//! message on the [`EventBus`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::ScopeError;
use crate::event::EventBus;
use crate::message::{CommandResponse, ScopeEvent};

type Completion = oneshot::Sender<Result<CommandResponse, ScopeError>>;

struct PendingRequest {
    tx: Completion,
    created_at: Instant,
}

/// The caller's half of a registered request.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Result<CommandResponse, ScopeError>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Delivered to the waiting caller.
    Resolved,
    /// The caller had already given up; dropped.
    Discarded,
    /// No caller was waiting; published as an event.
    Forwarded,
}

// ── TextProtocol ─────────────────────────────────────────────────

pub struct TextProtocol {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    response_timeout: RwLock<Duration>,
    bus: EventBus,
}

impl TextProtocol {
    pub fn new(bus: EventBus, response_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            response_timeout: RwLock::new(response_timeout),
            bus,
        }
    }

    /// Next request ID. IDs start at 1 and are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn response_timeout(&self) -> Duration {
        *self
            .response_timeout
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        *self
            .response_timeout
            .write()
            .unwrap_or_else(|e| e.into_inner()) = timeout;
    }

    /// Start tracking `id`. Register before writing the request so a fast
    /// reply cannot overtake the registration.
    pub fn register(&self, id: u64) -> Result<PendingResponse, ScopeError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(ScopeError::ProtocolViolation(format!(
                "request id {id} is already pending"
            )));
        }
        pending.insert(
            id,
            PendingRequest {
                tx,
                created_at: Instant::now(),
            },
        );
        Ok(PendingResponse { id, rx })
    }

    /// Wait for a registered request, bounded by the response timeout.
    /// `operation` names the request in the timeout error.
    pub async fn wait(
        &self,
        pending: PendingResponse,
        operation: &str,
    ) -> Result<CommandResponse, ScopeError> {
        let timeout = self.response_timeout();
        match tokio::time::timeout(timeout, pending.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.cancel(pending.id);
                Err(ScopeError::ChannelClosed)
            }
            Err(_) => {
                self.cancel(pending.id);
                debug!(id = pending.id, "{operation} timed out");
                Err(ScopeError::timeout(operation, timeout))
            }
        }
    }

    /// Register `id` and wait for its response.
    pub async fn recv_message(&self, id: u64) -> Result<CommandResponse, ScopeError> {
        let pending = self.register(id)?;
        self.wait(pending, &format!("response to request {id}")).await
    }

    /// Stop tracking `id`. Returns `false` if it was not pending.
    pub fn cancel(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fill the completion for `response.id`, or publish the response on
    /// the bus when no caller is waiting for it.
    pub async fn handle_incoming_message(&self, response: CommandResponse) -> Routing {
        match self.resolve(response) {
            Ok(routing) => routing,
            Err(unmatched) => {
                trace!(id = ?unmatched.id, method = ?unmatched.method, "unmatched response");
                self.bus.emit(ScopeEvent::from_response(&unmatched)).await;
                Routing::Forwarded
            }
        }
    }

    /// Synchronous half of [`handle_incoming_message`](Self::handle_incoming_message):
    /// hands back responses that have no waiter.
    pub fn resolve(&self, response: CommandResponse) -> Result<Routing, CommandResponse> {
        let Some(id) = response.id else {
            return Err(response);
        };
        let Some(entry) = self.lock().remove(&id) else {
            return Err(response);
        };
        if entry.tx.send(Ok(response)).is_err() {
            debug!(id, "caller gave up before the response arrived");
            return Ok(Routing::Discarded);
        }
        trace!(id, elapsed = ?entry.created_at.elapsed(), "response resolved");
        Ok(Routing::Resolved)
    }

    /// Drop entries whose caller has gone away. Returns how many.
    pub fn cleanup_cancelled(&self) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, entry| !entry.tx.is_closed());
        let removed = before - pending.len();
        if removed > 0 {
            debug!(removed, "swept cancelled requests");
        }
        removed
    }

    /// Fail every pending call with `reason()`. Returns how many.
    pub fn cancel_all<F>(&self, reason: F) -> usize
    where
        F: Fn() -> ScopeError,
    {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(reason()));
        }
        if count > 0 {
            debug!(count, "failed pending requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Age of the longest-waiting request.
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.lock()
            .values()
            .map(|entry| entry.created_at.elapsed())
            .max()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for TextProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextProtocol")
            .field("pending", &self.pending_count())
            .field("response_timeout", &self.response_timeout())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    fn response(id: u64) -> CommandResponse {
        CommandResponse {
            id: Some(id),
            method: Some("get_time".into()),
            result: Some(json!({ "for": id })),
            ..Default::default()
        }
    }

    fn protocol(timeout_ms: u64) -> TextProtocol {
        TextProtocol::new(EventBus::new(), Duration::from_millis(timeout_ms))
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let p = protocol(1_000);
        assert_eq!(p.next_id(), 1);
        assert_eq!(p.next_id(), 2);
        assert_eq!(p.next_id(), 3);
    }

    #[tokio::test]
    async fn matching_response_resolves_and_untracks() {
        let p = protocol(5_000);
        let pending = p.register(1).unwrap();
        let mut waiter = task::spawn(p.wait(pending, "get_time"));
        assert_pending!(waiter.poll());

        assert_eq!(p.handle_incoming_message(response(1)).await, Routing::Resolved);
        let got = assert_ready!(waiter.poll()).unwrap();
        assert_eq!(got.result, Some(json!({"for": 1})));
        assert_eq!(p.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_matching_response_leaves_call_pending() {
        let p = protocol(5_000);
        let pending = p.register(5).unwrap();
        let mut waiter = task::spawn(p.wait(pending, "get_time"));
        assert_pending!(waiter.poll());

        assert_eq!(p.handle_incoming_message(response(6)).await, Routing::Forwarded);
        assert_pending!(waiter.poll());
        assert!(p.is_pending(5));
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_own_callers() {
        let p = Arc::new(protocol(5_000));
        let first = p.register(1).unwrap();
        let second = p.register(2).unwrap();

        let a = tokio::spawn({
            let p = p.clone();
            async move { p.wait(first, "first").await }
        });
        let b = tokio::spawn({
            let p = p.clone();
            async move { p.wait(second, "second").await }
        });

        assert_eq!(p.handle_incoming_message(response(2)).await, Routing::Resolved);
        assert_eq!(p.handle_incoming_message(response(1)).await, Routing::Resolved);

        assert_eq!(a.await.unwrap().unwrap().id, Some(1));
        assert_eq!(b.await.unwrap().unwrap().id, Some(2));
        assert_eq!(p.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_names_operation() {
        let p = protocol(100);
        let err = p.recv_message(9).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("request 9"));
        assert!(err.to_string().contains("100ms"));
        assert!(!p.is_pending(9));

        // a late reply is treated as unsolicited
        assert_eq!(p.handle_incoming_message(response(9)).await, Routing::Forwarded);
    }

    #[tokio::test]
    async fn abandoned_request_is_discarded_on_arrival() {
        let p = protocol(5_000);
        let pending = p.register(3).unwrap();
        drop(pending);
        assert_eq!(p.handle_incoming_message(response(3)).await, Routing::Discarded);
        assert_eq!(p.pending_count(), 0);
    }

    #[test]
    fn sweep_removes_only_cancelled_entries() {
        let p = protocol(5_000);
        let keep = p.register(1).unwrap();
        drop(p.register(2).unwrap());
        drop(p.register(3).unwrap());

        assert_eq!(p.cleanup_cancelled(), 2);
        assert_eq!(p.pending_count(), 1);
        assert!(p.is_pending(keep.id()));
        assert!(p.oldest_pending().is_some());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let p = protocol(5_000);
        let _first = p.register(4).unwrap();
        assert!(matches!(
            p.register(4),
            Err(ScopeError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_waiter() {
        let p = Arc::new(protocol(60_000));
        let waiters: Vec<_> = (1..=3)
            .map(|id| {
                let pending = p.register(id).unwrap();
                let p = p.clone();
                tokio::spawn(async move { p.wait(pending, "x").await })
            })
            .collect();

        assert_eq!(p.cancel_all(|| ScopeError::Disconnected), 3);
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(ScopeError::Disconnected)
            ));
        }
        assert_eq!(p.pending_count(), 0);
    }

    #[tokio::test]
    async fn unmatched_response_is_published_under_its_method() {
        let bus = EventBus::new();
        let p = TextProtocol::new(bus.clone(), Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_sync("get_time", move |e| s.lock().unwrap().push(e.kind.clone()));

        let mut anonymous = response(0);
        anonymous.id = None;
        assert_eq!(p.handle_incoming_message(anonymous).await, Routing::Forwarded);
        assert_eq!(p.handle_incoming_message(response(77)).await, Routing::Forwarded);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
