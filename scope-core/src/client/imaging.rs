//! Binary-channel (imaging) client.
//!
//! The reader task pulls `header + payload` frames off the socket. Images
//! replace the single latest-frame slot (consumers that fall behind skip
//! frames, they never queue); JSON payloads become events on the shared
//! bus. Control commands go out on the same socket as text request lines.
//!
//! The client follows the text channel's mode: a `ClientModeChanged` to
//! continuous exposure or stacking starts the stream, a change to idle
//! stops it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::metrics::FrameTiming;
use crate::command::{BeginStreaming, Command, CommandRequest, GetStackedImage, StopStreaming, TestConnection};
use crate::config::ImagingConfig;
use crate::error::ScopeError;
use crate::event::{EventBus, Subscription};
use crate::header::HEADER_SIZE;
use crate::message::{CLIENT_MODE_CHANGED, EventBody, InboundMessage, ScopeEvent};
use crate::network::{Connection, ConnectionInfo};
use crate::protocol::{BinaryProtocol, ScopeImage};
use crate::rtsp::{FrameSource, RtspConnector, stream_uri};
use crate::state::{ClientMode, ClientState, ImagingStatus};
use crate::task::TaskGroup;

type LatestFrame = Option<Arc<ScopeImage>>;

// ── ImagingClient ────────────────────────────────────────────────

pub struct ImagingClient {
    inner: Arc<ImagingInner>,
}

struct ImagingInner {
    config: ImagingConfig,
    connection: Connection,
    protocol: BinaryProtocol,
    bus: EventBus,
    next_id: AtomicU64,
    status: watch::Sender<ImagingStatus>,
    state: watch::Sender<ClientState>,
    latest: watch::Sender<LatestFrame>,
    timing: Mutex<FrameTiming>,
    mode: RwLock<Option<ClientMode>>,
    /// Serialises start/stop.
    streaming_lock: tokio::sync::Mutex<()>,
    /// Serialises `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
    /// When the in-flight `get_stacked_img` stops counting as in flight.
    fetch_deadline: Mutex<Option<Instant>>,
    /// Streaming was requested and not since stopped; survives link loss.
    resume_streaming: AtomicBool,
    tasks: Mutex<TaskGroup>,
    /// Cancelled on disconnect to end outstanding frame streams.
    session: Mutex<CancellationToken>,
    closing: AtomicBool,
    link_lost: Notify,
    rtsp: RwLock<Option<Arc<dyn RtspConnector>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ImagingClient {
    /// Create a client that follows mode changes and stack events
    /// published on `bus`.
    pub fn new(config: ImagingConfig, bus: EventBus) -> Self {
        let timing = FrameTiming::new(config.timing_window);
        let inner = Arc::new(ImagingInner {
            connection: Connection::from_config(&config.connection),
            protocol: BinaryProtocol::new(),
            bus,
            next_id: AtomicU64::new(1),
            status: watch::Sender::new(ImagingStatus::default()),
            state: watch::Sender::new(ClientState::Disconnected),
            latest: watch::Sender::new(None),
            timing: Mutex::new(timing),
            mode: RwLock::new(None),
            streaming_lock: tokio::sync::Mutex::new(()),
            lifecycle: tokio::sync::Mutex::new(()),
            fetch_deadline: Mutex::new(None),
            resume_streaming: AtomicBool::new(false),
            tasks: Mutex::new(TaskGroup::new()),
            session: Mutex::new(CancellationToken::new()),
            closing: AtomicBool::new(false),
            link_lost: Notify::new(),
            rtsp: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
            config,
        });
        ImagingInner::subscribe(&inner);
        Self { inner }
    }

    /// Open the link and start the reader, heartbeat and monitor. If the
    /// tracked mode already calls for frames, streaming starts right away.
    ///
    /// A no-op while connected; leftover tasks of an earlier link are
    /// stopped before the new ones start.
    pub async fn connect(&self) -> Result<(), ScopeError> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.state.borrow().is_connected() && inner.connection.is_connected() {
            return Ok(());
        }

        inner.closing.store(true, Ordering::SeqCst);
        let stale = inner.lock_tasks().cancel_and_take();
        if !stale.is_empty() {
            debug!(tasks = stale.len(), "stopping imaging tasks of the previous link");
            TaskGroup::join_all(stale, inner.config.shutdown_grace()).await;
        }
        inner.closing.store(false, Ordering::SeqCst);

        inner.state.send_replace(ClientState::Connecting);
        inner.connection.close().await;
        if let Err(e) = inner.connection.open().await {
            inner.state.send_replace(ClientState::Disconnected);
            return Err(e);
        }
        inner.status.send_modify(ImagingStatus::reset);
        inner.lock_timing().reset();
        *inner.lock_fetch_deadline() = None;
        inner.state.send_replace(ClientState::connected_now());

        {
            let mut tasks = inner.lock_tasks();
            tasks.spawn("image-reader", inner.clone().read_loop());
            tasks.spawn("image-heartbeat", inner.clone().heartbeat_loop());
            tasks.spawn("image-monitor", inner.clone().monitor_loop());
        }

        inner.resume().await;
        Ok(())
    }

    /// Stop streaming (best effort), end frame streams and close the
    /// link. Safe to call more than once.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;
        if inner.connection.is_connected() {
            if let Err(e) = inner.stop_streaming().await {
                debug!("stop_streaming during disconnect failed: {e}");
            }
        }
        inner.closing.store(true, Ordering::SeqCst);
        inner.resume_streaming.store(false, Ordering::SeqCst);

        let tasks = inner.lock_tasks().cancel_and_take();
        TaskGroup::join_all(tasks, inner.config.shutdown_grace()).await;
        inner.end_session();

        inner.connection.close().await;
        inner.status.send_modify(|s| {
            s.is_streaming = false;
            s.is_receiving_image = false;
        });
        let previous = inner.state.send_replace(ClientState::Disconnected);
        if !previous.is_disconnected() {
            info!("imaging disconnected from {}", inner.connection.info());
        }
    }

    /// Ask the device to stream frames. No-op while already streaming.
    pub async fn start_streaming(&self) -> Result<(), ScopeError> {
        self.inner.start_streaming().await
    }

    /// Inverse of [`start_streaming`](Self::start_streaming).
    pub async fn stop_streaming(&self) -> Result<(), ScopeError> {
        self.inner.stop_streaming().await
    }

    /// Lazy, restartable sequence of frames.
    ///
    /// In streaming mode with an RTSP connector installed, frames come
    /// from camera `camera_id`'s RTSP stream. Otherwise the latest-frame
    /// slot is followed: the current frame (if any) is yielded once, then
    /// each replacement. The sequence ends on disconnect.
    pub fn get_next_image(&self, camera_id: u16) -> BoxStream<'static, Arc<ScopeImage>> {
        let inner = &self.inner;
        let session = inner.session_token();
        let connector = inner.rtsp.read().unwrap_or_else(|e| e.into_inner()).clone();

        if let (Some(ClientMode::Streaming), Some(connector)) = (self.client_mode(), connector) {
            let uri = stream_uri(inner.connection.info().host(), inner.config.rtsp_port, camera_id);
            debug!(%uri, "reading frames over rtsp");
            return rtsp_frames(connector, uri, session).boxed();
        }
        latest_frames(inner.latest.subscribe(), session).boxed()
    }

    pub fn latest_image(&self) -> Option<Arc<ScopeImage>> {
        self.inner.latest.borrow().clone()
    }

    pub fn set_rtsp_connector(&self, connector: Arc<dyn RtspConnector>) {
        *self.inner.rtsp.write().unwrap_or_else(|e| e.into_inner()) = Some(connector);
    }

    /// Request the stacked image on every `frame_complete` stack event.
    pub fn set_fetching_images(&self, enabled: bool) {
        self.inner
            .status
            .send_modify(|s| s.is_fetching_images = enabled);
    }

    /// Override the tracked mode without touching the stream.
    pub fn set_client_mode(&self, mode: Option<ClientMode>) {
        *self.inner.mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub fn client_mode(&self) -> Option<ClientMode> {
        self.inner.client_mode()
    }

    /// Whether a lost link should be re-established: only in modes that
    /// produce images.
    pub fn should_attempt_reconnection(&self) -> bool {
        self.inner.should_attempt_reconnection()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.status.borrow().is_streaming
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        self.inner.connection.info()
    }

    pub fn status(&self) -> ImagingStatus {
        self.inner.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ImagingStatus> {
        self.inner.status.subscribe()
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
}

impl Drop for ImagingClient {
    fn drop(&mut self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.lock_tasks().cancel();
        self.inner.end_session();
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl std::fmt::Debug for ImagingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagingClient")
            .field("connection", &self.inner.connection)
            .field("state", &*self.inner.state.borrow())
            .field("mode", &self.inner.client_mode())
            .finish()
    }
}

// ── Internals ────────────────────────────────────────────────────

impl ImagingInner {
    /// Hook into the shared bus. Handlers hold a weak reference so the
    /// bus never keeps the client alive.
    fn subscribe(this: &Arc<Self>) {
        let mut guards = Vec::with_capacity(3);

        let weak = Arc::downgrade(this);
        guards.push(this.bus.subscribe_scoped_async(CLIENT_MODE_CHANGED, move |event| {
            let weak: Weak<Self> = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                if let EventBody::ModeChanged(change) = event.body {
                    inner.on_mode_changed(change.new_mode).await;
                }
            }
        }));

        let weak = Arc::downgrade(this);
        guards.push(this.bus.subscribe_scoped_async("Stack", move |event| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.on_stack_event(&event).await;
                }
            }
        }));

        let weak = Arc::downgrade(this);
        guards.push(this.bus.subscribe_scoped("PiStatus", move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.status.send_modify(|s| s.apply_event(event));
            }
        }));

        *this.subscriptions.lock().unwrap_or_else(|e| e.into_inner()) = guards;
    }

    async fn on_mode_changed(&self, mode: ClientMode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = Some(mode.clone());
        if !self.connection.is_connected() {
            debug!(%mode, "mode changed while imaging is offline");
            return;
        }
        let result = if mode.wants_frame_stream() {
            self.start_streaming().await
        } else if mode == ClientMode::Idle {
            self.stop_streaming().await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!(%mode, "could not follow mode change: {e}");
        }
    }

    /// Fetch the stacked image once per finished frame. Frames finishing
    /// while a fetch is still in flight are counted as skipped; a fetch
    /// unanswered past the fetch timeout no longer counts as in flight.
    async fn on_stack_event(&self, event: &ScopeEvent) {
        let now = Instant::now();
        let expired = self.lock_fetch_deadline().is_some_and(|deadline| now >= deadline);
        let mut fetch = false;
        let mut abandoned = false;
        self.status.send_modify(|s| {
            s.apply_event(event);
            if event.state() != Some("frame_complete") || !s.is_fetching_images {
                return;
            }
            if s.is_receiving_image && !expired {
                s.skipped_frame += 1;
            } else {
                abandoned = s.is_receiving_image;
                s.is_receiving_image = true;
                fetch = true;
            }
        });
        if !fetch {
            return;
        }
        if abandoned {
            warn!(
                timeout = ?self.config.fetch_timeout(),
                "stacked image never arrived; requesting again"
            );
        }
        *self.lock_fetch_deadline() = Some(now + self.config.fetch_timeout());
        if let Err(e) = self.send_command(&GetStackedImage).await {
            warn!("stacked image request failed: {e}");
            *self.lock_fetch_deadline() = None;
            self.status.send_modify(|s| s.is_receiving_image = false);
        }
    }

    async fn start_streaming(&self) -> Result<(), ScopeError> {
        let _serial = self.streaming_lock.lock().await;
        if self.status.borrow().is_streaming {
            return Ok(());
        }
        self.send_command(&BeginStreaming).await?;
        self.status.send_modify(|s| s.is_streaming = true);
        self.resume_streaming.store(true, Ordering::SeqCst);
        info!("imaging stream started");
        Ok(())
    }

    async fn stop_streaming(&self) -> Result<(), ScopeError> {
        let _serial = self.streaming_lock.lock().await;
        if !self.status.borrow().is_streaming {
            return Ok(());
        }
        self.send_command(&StopStreaming).await?;
        self.status.send_modify(|s| s.is_streaming = false);
        self.resume_streaming.store(false, Ordering::SeqCst);
        info!("imaging stream stopped");
        Ok(())
    }

    async fn send_command(&self, command: &dyn Command) -> Result<(), ScopeError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = CommandRequest::new(id, command).to_line()?;
        let result = self.connection.write(line.as_bytes()).await;
        if result.is_err() && !self.connection.is_connected() {
            self.link_lost.notify_one();
        }
        trace!(id, method = command.method(), ok = result.is_ok(), "imaging command");
        result
    }

    fn client_mode(&self) -> Option<ClientMode> {
        self.mode.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn should_attempt_reconnection(&self) -> bool {
        self.client_mode().is_some_and(|m| m.is_active())
    }

    fn wants_link(&self) -> bool {
        !self.closing.load(Ordering::SeqCst)
            && (self.should_attempt_reconnection() || self.resume_streaming.load(Ordering::SeqCst))
    }

    async fn read_loop(self: Arc<Self>) {
        loop {
            let header = match self.connection.read_exact(HEADER_SIZE).await {
                Ok(header) => header,
                Err(e) if e.is_timeout() => {
                    if self.connection.is_connected() {
                        continue;
                    }
                    self.on_link_lost("connection closed");
                    break;
                }
                Err(e) => {
                    self.on_link_lost(&e.to_string());
                    break;
                }
            };

            if let Err(e) = self.process_frame(&header).await {
                error!("imaging stream failed: {e}");
                self.connection.close().await;
                self.on_link_lost(&e.to_string());
                break;
            }
        }
    }

    async fn process_frame(&self, header: &[u8]) -> Result<(), ScopeError> {
        let header = self.protocol.parse_header(header)?;
        let size = header.payload_size as usize;
        if size > self.config.max_payload_bytes {
            return Err(ScopeError::PayloadTooLarge {
                size,
                max: self.config.max_payload_bytes,
            });
        }

        let payload = match self.connection.read_exact(size).await {
            Ok(payload) => payload,
            Err(e) if e.is_timeout() => {
                return Err(ScopeError::Desync(format!(
                    "payload of frame {} never arrived",
                    header.message_id
                )));
            }
            Err(e) => return Err(e),
        };

        let decoded = self.protocol.handle_incoming_message(
            header.width,
            header.height,
            &payload,
            header.message_id,
        )?;
        match decoded {
            Some(image) => self.publish_image(image, size),
            None => self.handle_control(payload).await,
        }
        Ok(())
    }

    fn publish_image(&self, image: ScopeImage, size: usize) {
        {
            let mut timing = self.lock_timing();
            let elapsed = timing.record(Instant::now(), size);
            self.status.send_modify(|s| {
                timing.publish(elapsed, size, s);
                s.is_receiving_image = false;
            });
        }
        trace!(width = image.width, height = image.height, size, "frame");
        self.latest.send_replace(Some(Arc::new(image)));
    }

    async fn handle_control(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        match InboundMessage::parse_bytes(&payload) {
            Ok(InboundMessage::Event(event)) => {
                self.status.send_modify(|s| s.apply_event(&event));
                self.bus.emit(event).await;
            }
            Ok(InboundMessage::Response(response)) => {
                if response.is_error() {
                    warn!(
                        method = ?response.method,
                        "imaging command rejected: {}",
                        response.error_message().unwrap_or_default()
                    );
                }
                self.bus.emit(ScopeEvent::from_response(&response)).await;
            }
            Ok(InboundMessage::Unknown(value)) => debug!(%value, "unclassified imaging message"),
            Err(e) => warn!("skipping malformed imaging payload: {e}"),
        }
    }

    fn on_link_lost(&self, reason: &str) {
        self.status.send_modify(|s| {
            s.is_streaming = false;
            s.is_receiving_image = false;
        });
        if self.closing.load(Ordering::SeqCst) {
            debug!("image reader stopping: {reason}");
            return;
        }
        warn!("imaging link to {} lost: {reason}", self.connection.info());
        self.link_lost.notify_one();
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !self.connection.is_connected() {
                continue;
            }
            if let Err(e) = self.send_command(&TestConnection).await {
                debug!("imaging heartbeat failed: {e}");
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
            if !self.wants_link() {
                if !self.state.borrow().is_disconnected() {
                    info!("imaging link down and no active mode; not reconnecting");
                    self.state.send_replace(ClientState::Disconnected);
                }
                continue;
            }

            self.state.send_replace(ClientState::Reconnecting);
            self.connection.close().await;
            self.connection.reset_reconnect_attempts();
            match self.connection.reconnect_with_backoff(|| self.wants_link()).await {
                Ok(()) => {
                    self.state.send_replace(ClientState::connected_now());
                    self.lock_tasks().spawn("image-reader", self.clone().read_loop());
                    self.resume().await;
                }
                Err(ScopeError::AlreadyConnected { .. }) => break,
                Err(ScopeError::ReconnectAborted { attempts }) => {
                    debug!(attempts, "imaging reconnection no longer wanted");
                    self.state.send_replace(ClientState::Disconnected);
                }
                Err(e) => {
                    error!(
                        attempts = self.connection.reconnect_attempts(),
                        "giving up on imaging link {}: {e}",
                        self.connection.info()
                    );
                    self.state.send_replace(ClientState::Disconnected);
                    break;
                }
            }
        }
    }

    /// Restart the stream after a reconnect if it was running, or if the
    /// current mode calls for it.
    async fn resume(&self) {
        let wanted = self.resume_streaming.load(Ordering::SeqCst)
            || self.client_mode().is_some_and(|m| m.wants_frame_stream());
        if !wanted {
            return;
        }
        if let Err(e) = self.start_streaming().await {
            warn!("could not resume imaging stream: {e}");
        }
    }

    fn session_token(&self) -> CancellationToken {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn end_session(&self) {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        session.cancel();
        *session = CancellationToken::new();
    }

    fn lock_tasks(&self) -> MutexGuard<'_, TaskGroup> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timing(&self) -> MutexGuard<'_, FrameTiming> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_fetch_deadline(&self) -> MutexGuard<'_, Option<Instant>> {
        self.fetch_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Frame streams ────────────────────────────────────────────────

fn latest_frames(
    rx: watch::Receiver<LatestFrame>,
    session: CancellationToken,
) -> impl Stream<Item = Arc<ScopeImage>> + Send + 'static {
    stream::unfold((rx, session, true), |(mut rx, session, first)| async move {
        if first {
            let current = rx.borrow_and_update().clone();
            if let Some(frame) = current {
                return Some((frame, (rx, session, false)));
            }
        }
        loop {
            let changed = tokio::select! {
                _ = session.cancelled() => return None,
                changed = rx.changed() => changed,
            };
            if changed.is_err() {
                return None;
            }
            let next = rx.borrow_and_update().clone();
            if let Some(frame) = next {
                return Some((frame, (rx, session, false)));
            }
        }
    })
}

fn rtsp_frames(
    connector: Arc<dyn RtspConnector>,
    uri: String,
    session: CancellationToken,
) -> impl Stream<Item = Arc<ScopeImage>> + Send + 'static {
    stream::unfold(None::<Box<dyn FrameSource>>, move |source| {
        let connector = connector.clone();
        let uri = uri.clone();
        let session = session.clone();
        async move {
            let mut source = match source {
                Some(source) => source,
                None => match connector.open(&uri).await {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(%uri, "rtsp open failed: {e}");
                        return None;
                    }
                },
            };
            let frame = tokio::select! {
                _ = session.cancelled() => return None,
                frame = source.next_frame() => frame,
            };
            match frame {
                Ok(Some(image)) => Some((Arc::new(image), Some(source))),
                Ok(None) => None,
                Err(e) => {
                    warn!(%uri, "rtsp stream failed: {e}");
                    None
                }
            }
        }
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use image::RgbImage;

    fn offline_client() -> ImagingClient {
        let mut config = ImagingConfig::new("127.0.0.1", 1);
        config.connection.connect_timeout_ms = 200;
        ImagingClient::new(config, EventBus::new())
    }

    fn frame(width: u32) -> ScopeImage {
        ScopeImage {
            width,
            height: 2,
            image: Some(RgbImage::new(width, 2)),
        }
    }

    #[test]
    fn reconnection_is_an_allow_list() {
        let client = offline_client();
        assert!(!client.should_attempt_reconnection());
        for (mode, expected) in [
            (ClientMode::ContinuousExposure, true),
            (ClientMode::Streaming, true),
            (ClientMode::Stacking, true),
            (ClientMode::AutoFocus, true),
            (ClientMode::Idle, false),
            (ClientMode::Other("Mosaic".into()), false),
        ] {
            client.set_client_mode(Some(mode.clone()));
            assert_eq!(client.should_attempt_reconnection(), expected, "{mode}");
        }
    }

    #[tokio::test]
    async fn streaming_needs_a_connection() {
        let client = offline_client();
        assert!(matches!(
            client.start_streaming().await,
            Err(ScopeError::NotConnected)
        ));
        assert!(!client.is_streaming());
        // stopping a stream that never started is a no-op
        assert!(client.stop_streaming().await.is_ok());
    }

    #[tokio::test]
    async fn mode_change_is_recorded_while_offline() {
        let client = offline_client();
        client
            .event_bus()
            .emit(ScopeEvent::mode_changed(None, ClientMode::Stacking))
            .await;
        assert_eq!(client.client_mode(), Some(ClientMode::Stacking));
        assert!(!client.is_streaming());
    }

    #[tokio::test]
    async fn latest_frame_stream_yields_current_then_replacements() {
        let client = offline_client();
        client.inner.latest.send_replace(Some(Arc::new(frame(1))));

        let mut frames = client.get_next_image(0);
        assert_eq!(frames.next().await.unwrap().width, 1);

        let inner = client.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            inner.latest.send_replace(Some(Arc::new(frame(2))));
        });
        assert_eq!(frames.next().await.unwrap().width, 2);

        // a fresh stream starts from the current frame again
        let mut again = client.get_next_image(0);
        assert_eq!(again.next().await.unwrap().width, 2);

        client.disconnect().await;
        assert!(frames.next().await.is_none());
    }

    struct Fixed(u32);

    #[async_trait]
    impl FrameSource for Fixed {
        async fn next_frame(&mut self) -> Result<Option<ScopeImage>, ScopeError> {
            if self.0 == 0 {
                return Ok(None);
            }
            self.0 -= 1;
            Ok(Some(frame(7)))
        }
    }

    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl RtspConnector for Recording {
        async fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>, ScopeError> {
            self.0.lock().unwrap().push(uri.to_string());
            Ok(Box::new(Fixed(2)))
        }
    }

    #[tokio::test]
    async fn streaming_mode_reads_from_rtsp() {
        let client = offline_client();
        let connector = Arc::new(Recording(Mutex::new(Vec::new())));
        client.set_rtsp_connector(connector.clone());
        client.set_client_mode(Some(ClientMode::Streaming));

        let frames: Vec<_> = client.get_next_image(1).collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            *connector.0.lock().unwrap(),
            vec!["rtsp://127.0.0.1:4555/stream".to_string()]
        );
    }

    #[tokio::test]
    async fn stack_events_only_fetch_when_enabled() {
        let client = offline_client();
        let stack = serde_json::json!({"Event": "Stack", "state": "frame_complete", "stacked_frame": 3});
        client
            .event_bus()
            .emit(ScopeEvent::from_fields("Stack", stack))
            .await;
        let status = client.status();
        assert_eq!(status.stacked_frame, 3);
        assert!(!status.is_receiving_image);
        assert_eq!(status.skipped_frame, 0);
    }
}
