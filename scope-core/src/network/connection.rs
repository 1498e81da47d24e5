//! Managed TCP transport with bounded-time I/O and backoff reconnection.
//!
//! A [`Connection`] owns both halves of one TCP stream. The read half is
//! only ever touched by the owning client's reader task, the write half
//! is shared by every caller; each half sits behind its own lock so a
//! blocked read never stalls a write.

use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::ScopeError;

// ── ConnectionInfo ───────────────────────────────────────────────

/// Target of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Timeouts / BackoffPolicy ─────────────────────────────────────

/// Independent deadlines for the three kinds of stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// Exponential backoff schedule for reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay slept after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }
}

// ── Connection ───────────────────────────────────────────────────

struct ReadHalf {
    inner: BufReader<OwnedReadHalf>,
    /// Bytes of a line whose terminator has not arrived yet.
    line: Vec<u8>,
}

/// A reopenable TCP stream to one device port.
pub struct Connection {
    info: ConnectionInfo,
    timeouts: Timeouts,
    backoff: BackoffPolicy,
    reader: Mutex<Option<ReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    open: AtomicBool,
    attempts: AtomicU32,
}

impl Connection {
    pub fn new(info: ConnectionInfo, timeouts: Timeouts, backoff: BackoffPolicy) -> Self {
        Self {
            info,
            timeouts,
            backoff,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            ConnectionInfo::new(config.host.clone(), config.port),
            Timeouts {
                connect: config.connect_timeout(),
                read: config.read_timeout(),
                write: config.write_timeout(),
            },
            BackoffPolicy {
                base: config.backoff_base(),
                max_delay: config.backoff_max(),
                max_attempts: config.max_reconnect_attempts,
            },
        )
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// `true` while a stream is open and no fatal I/O error has been seen.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Attempts made by the current (or last) reconnection cycle.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reset_reconnect_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Establish the stream within the connect timeout.
    ///
    /// Never replaces a live stream: fails with
    /// [`ScopeError::AlreadyConnected`] instead, also when another caller
    /// finished opening first.
    pub async fn open(&self) -> Result<(), ScopeError> {
        let target = self.info.to_string();
        if self.is_connected() {
            return Err(ScopeError::AlreadyConnected { target });
        }
        let connect = TcpStream::connect(target.as_str());
        let stream = match tokio::time::timeout(self.timeouts.connect, connect).await {
            Err(_) => {
                return Err(ScopeError::timeout(
                    format!("connect to {target}"),
                    self.timeouts.connect,
                ));
            }
            Ok(Err(e)) if e.kind() == IoErrorKind::ConnectionRefused => {
                return Err(ScopeError::Refused { target });
            }
            Ok(Err(e)) => return Err(ScopeError::ConnectFailed { target, source: e }),
            Ok(Ok(stream)) => stream,
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {target} failed: {e}");
        }

        // Both halves are swapped under the writer lock so concurrent
        // opens cannot interleave.
        let mut writer = self.writer.lock().await;
        if self.is_connected() {
            return Err(ScopeError::AlreadyConnected { target });
        }
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(ReadHalf {
            inner: BufReader::new(read_half),
            line: Vec::new(),
        });
        let stale = writer.replace(write_half);
        self.open.store(true, Ordering::SeqCst);
        drop(writer);
        if let Some(mut stale) = stale {
            let _ = stale.shutdown().await;
        }

        self.attempts.store(0, Ordering::SeqCst);
        info!("connected to {target}");
        Ok(())
    }

    /// Shut the stream down. Closing a closed connection is a no-op.
    pub async fn close(&self) {
        let was_open = self.open.swap(false, Ordering::SeqCst);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
        if was_open {
            info!("closed connection to {}", self.info);
        }
    }

    /// Write the whole payload within the write timeout.
    ///
    /// A failed or timed-out write leaves the peer with a partial
    /// message, so the connection is closed.
    pub async fn write(&self, payload: &[u8]) -> Result<(), ScopeError> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if self.is_connected() => writer,
            _ => return Err(ScopeError::NotConnected),
        };

        let result = tokio::time::timeout(self.timeouts.write, async {
            writer.write_all(payload).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                guard.take();
                self.mark_closed("write failed");
                Err(ScopeError::Transport(e))
            }
            Err(_) => {
                guard.take();
                self.mark_closed("write timed out");
                Err(ScopeError::timeout(
                    format!("write to {}", self.info),
                    self.timeouts.write,
                ))
            }
        }
    }

    /// Read the next line, terminator stripped.
    ///
    /// `Ok(None)` means the peer closed the stream. Bytes received before
    /// a timeout are kept and completed by the next call.
    pub async fn read_line(&self) -> Result<Option<String>, ScopeError> {
        let mut guard = self.reader.lock().await;
        let outcome = {
            let Some(half) = guard.as_mut() else {
                return Err(ScopeError::NotConnected);
            };
            let read = half.inner.read_until(b'\n', &mut half.line);
            match tokio::time::timeout(self.timeouts.read, read).await {
                Err(_) => {
                    return Err(ScopeError::timeout(
                        format!("read from {}", self.info),
                        self.timeouts.read,
                    ));
                }
                Ok(Err(e)) => Err(e),
                Ok(Ok(0)) if half.line.is_empty() => Ok(None),
                Ok(Ok(_)) => Ok(Some(std::mem::take(&mut half.line))),
            }
        };

        match outcome {
            Ok(Some(raw)) => {
                let mut line = String::from_utf8(raw)?;
                let trimmed = line.trim_end_matches(['\r', '\n']).len();
                line.truncate(trimmed);
                Ok(Some(line))
            }
            Ok(None) => {
                guard.take();
                self.mark_closed("peer closed the stream");
                Ok(None)
            }
            Err(e) => {
                guard.take();
                self.mark_closed("read failed");
                Err(ScopeError::Transport(e))
            }
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// The read timeout bounds inactivity: it restarts whenever bytes
    /// arrive. Timing out before the first byte leaves the stream aligned
    /// and returns [`ScopeError::Timeout`]; timing out part way through is
    /// a [`ScopeError::Desync`] and closes the connection.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes, ScopeError> {
        let mut guard = self.reader.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(ScopeError::NotConnected);
        };

        let mut buf = BytesMut::zeroed(n);
        let mut filled = 0;
        let failure = loop {
            if filled == n {
                return Ok(buf.freeze());
            }
            let deadline = Instant::now() + self.timeouts.read;
            match tokio::time::timeout_at(deadline, half.inner.read(&mut buf[filled..])).await {
                Err(_) if filled == 0 => {
                    return Err(ScopeError::timeout(
                        format!("read from {}", self.info),
                        self.timeouts.read,
                    ));
                }
                Err(_) => {
                    break ScopeError::Desync(format!(
                        "stalled after {filled} of {n} bytes"
                    ));
                }
                Ok(Ok(0)) => break ScopeError::Transport(IoErrorKind::UnexpectedEof.into()),
                Ok(Ok(read)) => filled += read,
                Ok(Err(e)) => break ScopeError::Transport(e),
            }
        };

        guard.take();
        self.mark_closed("read failed");
        Err(failure)
    }

    /// Reopen the stream, sleeping per [`BackoffPolicy`] between attempts.
    ///
    /// Stops with [`ScopeError::ReconnectAborted`] as soon as
    /// `should_retry` returns `false`, or [`ScopeError::ReconnectExhausted`]
    /// once the attempt bound is reached.
    pub async fn reconnect_with_backoff<F>(&self, should_retry: F) -> Result<(), ScopeError>
    where
        F: Fn() -> bool,
    {
        loop {
            let attempts = self.attempts.load(Ordering::SeqCst);
            if !should_retry() {
                return Err(ScopeError::ReconnectAborted { attempts });
            }
            if attempts >= self.backoff.max_attempts {
                return Err(ScopeError::ReconnectExhausted { attempts });
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.open().await {
                Ok(()) => {
                    info!(attempt, "reconnected to {}", self.info);
                    return Ok(());
                }
                Err(e @ ScopeError::AlreadyConnected { .. }) => return Err(e),
                Err(e) => warn!(
                    attempt,
                    max_attempts = self.backoff.max_attempts,
                    "reconnect to {} failed: {e}",
                    self.info
                ),
            }

            if attempt >= self.backoff.max_attempts {
                return Err(ScopeError::ReconnectExhausted { attempts: attempt });
            }
            let delay = self.backoff.delay_for(attempt);
            debug!(?delay, "backing off before next reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    fn mark_closed(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            warn!("connection to {} closed: {reason}", self.info);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("open", &self.is_connected())
            .field("attempts", &self.reconnect_attempts())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_test::{assert_err, assert_ok};

    fn policy(base_ms: u64, max_ms: u64, attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            max_attempts: attempts,
        }
    }

    fn connection(port: u16, read_ms: u64, backoff: BackoffPolicy) -> Connection {
        Connection::new(
            ConnectionInfo::new("127.0.0.1", port),
            Timeouts {
                connect: Duration::from_secs(2),
                read: Duration::from_millis(read_ms),
                write: Duration::from_secs(2),
            },
            backoff,
        )
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// A port nothing listens on.
    async fn dead_port() -> u16 {
        let (listener, port) = listener().await;
        drop(listener);
        port
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(1_000, 30_000, 10);
        let delays: Vec<u64> = (1..=7).map(|k| p.delay_for(k).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn backoff_is_monotonic_and_saturates() {
        let p = policy(250, 10_000, 100);
        let mut last = Duration::ZERO;
        for k in 1..=64 {
            let d = p.delay_for(k);
            assert!(d >= last);
            assert!(d <= p.max_delay);
            last = d;
        }
        assert_eq!(p.delay_for(0), p.base);
    }

    #[test]
    fn info_display() {
        assert_eq!(ConnectionInfo::new("10.0.0.1", 4700).to_string(), "10.0.0.1:4700");
    }

    #[tokio::test]
    async fn write_without_open_is_not_connected() {
        let conn = connection(1, 100, policy(10, 10, 1));
        assert!(!conn.is_connected());
        let err = conn.write(b"hello\r\n").await.unwrap_err();
        assert!(matches!(err, ScopeError::NotConnected));
        assert!(matches!(conn.read_line().await, Err(ScopeError::NotConnected)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (listener, port) = listener().await;
        let conn = connection(port, 100, policy(10, 10, 1));
        assert_ok!(conn.open().await);
        let _peer = listener.accept().await.unwrap();
        assert!(conn.is_connected());

        conn.close().await;
        assert!(!conn.is_connected());
        conn.close().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn open_never_replaces_a_live_stream() {
        let (listener, port) = listener().await;
        let conn = connection(port, 100, policy(10, 100, 3));
        conn.open().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let err = assert_err!(conn.open().await);
        assert!(matches!(err, ScopeError::AlreadyConnected { .. }));
        let err = assert_err!(conn.reconnect_with_backoff(|| true).await);
        assert!(matches!(err, ScopeError::AlreadyConnected { .. }));
        assert!(conn.is_connected());
        assert_eq!(conn.reconnect_attempts(), 1);
    }

    #[tokio::test]
    async fn refused_open_names_target() {
        let port = dead_port().await;
        let conn = connection(port, 100, policy(10, 10, 1));
        let err = assert_err!(conn.open().await);
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        assert!(err.to_string().contains(&port.to_string()));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn read_line_strips_terminators_and_reports_eof() {
        let (listener, port) = listener().await;
        let conn = connection(port, 1_000, policy(10, 10, 1));
        conn.open().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"{\"id\":1}\r\nsecond\n").await.unwrap();
        drop(peer);

        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("{\"id\":1}"));
        assert_eq!(conn.read_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(conn.read_line().await.unwrap(), None);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn read_line_timeout_keeps_partial_line() {
        let (listener, port) = listener().await;
        let conn = connection(port, 100, policy(10, 10, 1));
        conn.open().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            peer.write_all(b"{\"Event\":").await.unwrap();
            go_rx.await.unwrap();
            peer.write_all(b"\"PiStatus\"}\n").await.unwrap();
            peer
        });

        let err = conn.read_line().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(conn.is_connected());

        go_tx.send(()).unwrap();
        let line = conn.read_line().await.unwrap();
        assert_eq!(line.as_deref(), Some("{\"Event\":\"PiStatus\"}"));
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn read_exact_spans_chunks() {
        let (listener, port) = listener().await;
        let conn = connection(port, 1_000, policy(10, 10, 1));
        conn.open().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        tokio::spawn(async move {
            peer.write_all(&[1, 2, 3]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.write_all(&[4, 5, 6, 7]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let bytes = conn.read_exact(5).await.unwrap();
        assert_eq!(&bytes[..], &[1, 2, 3, 4, 5]);
        let rest = conn.read_exact(2).await.unwrap();
        assert_eq!(&rest[..], &[6, 7]);
        assert!(conn.read_exact(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_exact_fails_on_early_close() {
        let (listener, port) = listener().await;
        let conn = connection(port, 1_000, policy(10, 10, 1));
        conn.open().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(&[9; 10]).await.unwrap();
        drop(peer);

        let err = conn.read_exact(80).await.unwrap_err();
        assert!(matches!(err, ScopeError::Transport(_)));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn read_exact_idle_timeout_is_benign() {
        let (listener, port) = listener().await;
        let conn = connection(port, 50, policy(10, 10, 1));
        conn.open().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        let err = conn.read_exact(80).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_attempts() {
        let port = dead_port().await;
        let conn = connection(port, 100, policy(10, 1_000, 3));

        let started = std::time::Instant::now();
        let err = conn.reconnect_with_backoff(|| true).await.unwrap_err();
        assert!(matches!(err, ScopeError::ReconnectExhausted { attempts: 3 }));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(conn.reconnect_attempts(), 3);
        // slept 10ms + 20ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn reconnect_honours_predicate() {
        let port = dead_port().await;
        let conn = connection(port, 100, policy(10, 1_000, 5));
        let err = conn.reconnect_with_backoff(|| false).await.unwrap_err();
        assert!(matches!(err, ScopeError::ReconnectAborted { attempts: 0 }));
        assert_eq!(conn.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn reconnect_success_resets_counter() {
        let (listener, port) = listener().await;
        let conn = connection(port, 100, policy(10, 1_000, 5));
        assert_ok!(conn.reconnect_with_backoff(|| true).await);
        let _peer = listener.accept().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.reconnect_attempts(), 0);
    }
}
