//! Text-channel client.
//!
//! [`ScopeClient`] owns one [`Connection`] and runs four background
//! tasks while connected:
//!
//! * **reader**: the only consumer of the socket. Classifies each line,
//!   updates the status snapshot, resolves pending calls and publishes
//!   events.
//! * **heartbeat**: periodic `test_connection` plus a sweep of abandoned
//!   pending calls.
//! * **connection-monitor**: notices link loss and reconnects with
//!   backoff until the client is explicitly disconnected.
//! * **view-refresh**: periodic `get_view_state` so mode tracking
//!   recovers from missed events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, CommandRequest, GetDeviceState, GetViewState, TestConnection};
use crate::config::ClientConfig;
use crate::error::ScopeError;
use crate::event::EventBus;
use crate::message::{CommandResponse, InboundMessage, ScopeEvent};
use crate::network::{Connection, ConnectionInfo};
use crate::protocol::TextProtocol;
use crate::state::{ClientMode, ClientState, ScopeStatus};
use crate::task::TaskGroup;

// ── ScopeClient ──────────────────────────────────────────────────

pub struct ScopeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    connection: Connection,
    protocol: TextProtocol,
    bus: EventBus,
    status: watch::Sender<ScopeStatus>,
    state: watch::Sender<ClientState>,
    tasks: Mutex<TaskGroup>,
    /// Serialises `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
    /// Set by `disconnect`; stops reconnection.
    closing: AtomicBool,
    link_lost: Notify,
    recent: Mutex<VecDeque<ScopeEvent>>,
}

impl ScopeClient {
    pub fn new(config: ClientConfig, bus: EventBus) -> Self {
        let connection = Connection::from_config(&config.connection);
        let protocol = TextProtocol::new(bus.clone(), config.response_timeout());
        let recent = VecDeque::with_capacity(config.recent_events);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                protocol,
                bus,
                status: watch::Sender::new(ScopeStatus::default()),
                state: watch::Sender::new(ClientState::Disconnected),
                tasks: Mutex::new(TaskGroup::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                link_lost: Notify::new(),
                recent: Mutex::new(recent),
            }),
        }
    }

    /// Open the link, start the background tasks and fetch the initial
    /// status. Status fetch failures are logged, not returned.
    ///
    /// A no-op while connected. Called while the monitor is still
    /// reconnecting (or after it gave up), the old background tasks are
    /// stopped first so exactly one set runs on the new link.
    pub async fn connect(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.state.borrow().is_connected() && inner.connection.is_connected() {
            debug!("already connected to {}", inner.connection.info());
            return Ok(());
        }

        inner.closing.store(true, Ordering::SeqCst);
        let stale = inner.lock_tasks().cancel_and_take();
        if !stale.is_empty() {
            debug!(tasks = stale.len(), "stopping background tasks of the previous link");
            TaskGroup::join_all(stale, inner.config.shutdown_grace()).await;
        }
        inner.closing.store(false, Ordering::SeqCst);

        inner.state.send_replace(ClientState::Connecting);
        inner.connection.close().await;
        if let Err(e) = inner.connection.open().await {
            inner.state.send_replace(ClientState::Disconnected);
            return Err(e);
        }
        inner.state.send_replace(ClientState::connected_now());

        {
            let mut tasks = inner.lock_tasks();
            tasks.spawn("reader", inner.clone().read_loop());
            tasks.spawn("heartbeat", inner.clone().heartbeat_loop());
            tasks.spawn("connection-monitor", inner.clone().monitor_loop());
            tasks.spawn("view-refresh", inner.clone().view_refresh_loop());
        }

        inner.refresh_full_status().await;
        Ok(())
    }

    /// Stop background tasks, fail pending calls and close the link.
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        inner.closing.store(true, Ordering::SeqCst);

        let tasks = inner.lock_tasks().cancel_and_take();
        TaskGroup::join_all(tasks, inner.config.shutdown_grace()).await;

        let failed = inner.protocol.cancel_all(|| ScopeError::Disconnected);
        inner.connection.close().await;
        let previous = inner.state.send_replace(ClientState::Disconnected);
        if !previous.is_disconnected() {
            info!(failed, "disconnected from {}", inner.connection.info());
        }
    }

    /// Send `command` and wait for its response.
    pub async fn send_and_recv(&self, command: &dyn Command) -> Result<CommandResponse, ScopeError> {
        self.inner.request(command).await
    }

    /// Send `command` without waiting. Returns the request ID; a reply,
    /// if any, is published on the bus under the command's method.
    pub async fn send(&self, command: &dyn Command) -> Result<u64, ScopeError> {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            return Err(ScopeError::NotConnected);
        }
        let id = inner.protocol.next_id();
        let line = CommandRequest::new(id, command).to_line()?;
        inner.write(line.as_bytes()).await?;
        trace!(id, method = command.method(), "sent");
        Ok(id)
    }

    /// Wait for a stage event of `kind` to finish.
    ///
    /// `(true, None)` on `complete`; `(false, reason)` on `fail` or
    /// `cancel`. Other states are ignored.
    pub async fn wait_for_event_completion(
        &self,
        kind: &str,
        timeout: Duration,
    ) -> Result<(bool, Option<String>), ScopeError> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let _subscription = self.inner.bus.subscribe_scoped(kind, move |event| {
            let outcome = match event.state() {
                Some("complete") => (true, None),
                Some("fail" | "cancel") => (false, event.failure_reason()),
                _ => return,
            };
            if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(outcome);
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ScopeError::ChannelClosed),
            Err(_) => Err(ScopeError::timeout(format!("waiting for {kind}"), timeout)),
        }
    }

    /// Re-fetch device and view state.
    pub async fn refresh_full_status(&self) {
        self.inner.refresh_full_status().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        self.inner.connection.info()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ScopeStatus {
        self.inner.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ScopeStatus> {
        self.inner.status.subscribe()
    }

    pub fn client_mode(&self) -> Option<ClientMode> {
        self.inner.status.borrow().client_mode.clone()
    }

    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self) -> Vec<ScopeEvent> {
        self.inner.lock_recent().iter().cloned().collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.protocol.pending_count()
    }

    pub fn set_response_timeout(&self, timeout: Duration) {
        self.inner.protocol.set_response_timeout(timeout);
    }
}

impl Drop for ScopeClient {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.lock_tasks().cancel();
    }
}

impl std::fmt::Debug for ScopeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeClient")
            .field("connection", &self.inner.connection)
            .field("state", &*self.inner.state.borrow())
            .field("pending", &self.inner.protocol.pending_count())
            .finish()
    }
}

// ── Background tasks ─────────────────────────────────────────────

impl ClientInner {
    async fn request(&self, command: &dyn Command) -> Result<CommandResponse, ScopeError> {
        if !self.connection.is_connected() {
            return Err(ScopeError::NotConnected);
        }
        let id = self.protocol.next_id();
        let line = CommandRequest::new(id, command).to_line()?;
        let pending = self.protocol.register(id)?;
        if let Err(e) = self.write(line.as_bytes()).await {
            self.protocol.cancel(id);
            return Err(e);
        }
        trace!(id, method = command.method(), "sent");
        self.protocol
            .wait(pending, &format!("response to `{}`", command.method()))
            .await
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ScopeError> {
        let result = self.connection.write(bytes).await;
        if result.is_err() && !self.connection.is_connected() {
            self.link_lost.notify_one();
        }
        result
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.connection.read_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match InboundMessage::parse(&line) {
                        Ok(message) => self.dispatch(message).await,
                        Err(e) => warn!("skipping malformed line: {e}"),
                    }
                }
                Ok(None) => {
                    self.on_link_lost("peer closed the stream");
                    break;
                }
                Err(e) if e.is_timeout() => {
                    if !self.connection.is_connected() {
                        self.on_link_lost("connection closed");
                        break;
                    }
                }
                Err(ScopeError::InvalidUtf8(e)) => warn!("skipping non-utf8 line: {e}"),
                Err(e) => {
                    self.on_link_lost(&e.to_string());
                    break;
                }
            }
        }
    }

    async fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::Response(response) => {
                if let Some(result) = &response.result {
                    let method = response.method.as_deref();
                    let implied = self.update_status(|s| {
                        if let Some(ts) = &response.timestamp {
                            s.last_timestamp = Some(ts.clone());
                        }
                        s.apply_result(method, result)
                    });
                    self.track_mode(implied).await;
                }
                self.protocol.handle_incoming_message(response).await;
            }
            InboundMessage::Event(event) => {
                let implied = self.update_status(|s| s.apply_event(&event));
                self.remember(&event);
                self.bus.emit(event).await;
                self.track_mode(implied).await;
            }
            InboundMessage::Unknown(value) => debug!(%value, "unclassified message"),
        }
    }

    fn update_status<F>(&self, apply: F) -> Option<ClientMode>
    where
        F: FnOnce(&mut ScopeStatus) -> Option<ClientMode>,
    {
        let mut implied = None;
        self.status.send_modify(|s| implied = apply(s));
        implied
    }

    /// Record `implied` as the current mode and announce it if it changed.
    async fn track_mode(&self, implied: Option<ClientMode>) {
        let Some(new_mode) = implied else {
            return;
        };
        let mut existing = None;
        let changed = self.status.send_if_modified(|s| {
            if s.client_mode.as_ref() == Some(&new_mode) {
                return false;
            }
            existing = s.client_mode.replace(new_mode.clone());
            true
        });
        if changed {
            info!(from = ?existing, to = %new_mode, "client mode changed");
            let event = ScopeEvent::mode_changed(existing, new_mode);
            self.remember(&event);
            self.bus.emit(event).await;
        }
    }

    fn remember(&self, event: &ScopeEvent) {
        let capacity = self.config.recent_events;
        if capacity == 0 {
            return;
        }
        let mut recent = self.lock_recent();
        while recent.len() >= capacity {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }

    fn on_link_lost(&self, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            debug!("reader stopping: {reason}");
            return;
        }
        warn!("text link to {} lost: {reason}", self.connection.info());
        self.protocol.cancel_all(|| ScopeError::ConnectionLost);
        self.link_lost.notify_one();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.protocol.cleanup_cancelled();
            if !self.connection.is_connected() {
                continue;
            }
            if let Err(e) = self.request(&TestConnection).await {
                debug!("heartbeat failed: {e}");
            }
        }
    }

    async fn view_refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.view_refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.connection.is_connected() {
                continue;
            }
            if let Err(e) = self.request(&GetViewState).await {
                debug!("view refresh failed: {e}");
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        let check = self.config.connection_check_interval();
        loop {
            tokio::select! {
                _ = self.link_lost.notified() => {}
                _ = tokio::time::sleep(check) => {}
            }
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            if self.connection.is_connected() {
                continue;
            }

            self.state.send_replace(ClientState::Reconnecting);
            self.protocol.cancel_all(|| ScopeError::ConnectionLost);
            self.connection.close().await;
            self.connection.reset_reconnect_attempts();

            let closing = &self.closing;
            match self
                .connection
                .reconnect_with_backoff(|| !closing.load(Ordering::SeqCst))
                .await
            {
                Ok(()) => {
                    self.state.send_replace(ClientState::connected_now());
                    self.lock_tasks().spawn("reader", self.clone().read_loop());
                    self.refresh_full_status().await;
                }
                Err(ScopeError::ReconnectAborted { .. } | ScopeError::AlreadyConnected { .. }) => break,
                Err(e) => {
                    error!(
                        attempts = self.connection.reconnect_attempts(),
                        "giving up on {}: {e}",
                        self.connection.info()
                    );
                    self.state.send_replace(ClientState::Disconnected);
                    break;
                }
            }
        }
    }

    async fn refresh_full_status(&self) {
        let commands: [&dyn Command; 2] = [&GetDeviceState, &GetViewState];
        for command in commands {
            match self.request(command).await {
                Ok(response) if response.is_error() => warn!(
                    "{} rejected: {}",
                    command.method(),
                    response.error_message().unwrap_or_default()
                ),
                Ok(_) => {}
                Err(e) => warn!("{} failed: {e}", command.method()),
            }
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskGroup> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_recent(&self) -> MutexGuard<'_, VecDeque<ScopeEvent>> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GetTime;

    fn unreachable_client() -> ScopeClient {
        let mut config = ClientConfig::new("127.0.0.1", 1);
        config.connection.connect_timeout_ms = 200;
        ScopeClient::new(config, EventBus::new())
    }

    #[tokio::test]
    async fn commands_need_a_connection() {
        let client = unreachable_client();
        assert!(matches!(
            client.send_and_recv(&GetTime).await,
            Err(ScopeError::NotConnected)
        ));
        assert!(matches!(client.send(&GetTime).await, Err(ScopeError::NotConnected)));
    }

    #[tokio::test]
    async fn failed_connect_leaves_disconnected() {
        let client = unreachable_client();
        assert!(client.connect().await.is_err());
        assert!(client.state().is_disconnected());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_without_connect_is_a_noop() {
        let client = unreachable_client();
        client.disconnect().await;
        client.disconnect().await;
        assert!(client.state().is_disconnected());
    }

    #[tokio::test]
    async fn wait_for_event_completion_reports_failure_reason() {
        let client = unreachable_client();
        let bus = client.event_bus().clone();
        let waiter = tokio::spawn(async move {
            client
                .wait_for_event_completion("AutoGoto", Duration::from_secs(2))
                .await
        });
        tokio::task::yield_now().await;
        while bus.listener_count("AutoGoto") == 0 {
            tokio::task::yield_now().await;
        }

        let working = serde_json::json!({"Event": "AutoGoto", "state": "working"});
        bus.emit(ScopeEvent::from_fields("AutoGoto", working)).await;
        let failed = serde_json::json!({"Event": "AutoGoto", "state": "fail", "error": "below horizon"});
        bus.emit(ScopeEvent::from_fields("AutoGoto", failed)).await;

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, (false, Some("below horizon".to_string())));
        assert_eq!(bus.listener_count("AutoGoto"), 0);
    }

    #[tokio::test]
    async fn wait_for_event_completion_times_out_and_unsubscribes() {
        let client = unreachable_client();
        let err = client
            .wait_for_event_completion("AutoFocus", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("AutoFocus"));
        assert_eq!(client.event_bus().listener_count("AutoFocus"), 0);
    }
}
