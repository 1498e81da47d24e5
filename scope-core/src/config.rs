//! Tunables for the text and imaging clients.
//!
//! Every timeout, interval and backoff value lives here so tests and
//! deployments can pick their own. Durations are stored as `*_ms`
//! integers so the structs serialize cleanly to TOML and JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "seestar.local";
pub const DEFAULT_TEXT_PORT: u16 = 4700;
pub const DEFAULT_IMAGING_PORT: u16 = 4800;
pub const DEFAULT_RTSP_PORT: u16 = 4554;

/// Transport settings shared by both channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Delay before the first reconnection retry; doubled per attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay.
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

/// Text-channel client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub response_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub connection_check_interval_ms: u64,
    pub view_refresh_interval_ms: u64,
    /// How many events the client keeps in its recent-event history.
    pub recent_events: usize,
    /// How long disconnect waits for a background task before aborting it.
    pub shutdown_grace_ms: u64,
}

/// Imaging-channel client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingConfig {
    pub connection: ConnectionConfig,
    pub heartbeat_interval_ms: u64,
    pub connection_check_interval_ms: u64,
    /// RTSP port of camera 0; camera `n` listens on `rtsp_port + n`.
    pub rtsp_port: u16,
    /// Number of inter-frame latencies kept for the moving average.
    pub timing_window: usize,
    pub max_payload_bytes: usize,
    /// How long a `get_stacked_img` request may stay unanswered before
    /// the next finished frame fetches again.
    pub fetch_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.into(),
            port: DEFAULT_TEXT_PORT,
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            response_timeout_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            connection_check_interval_ms: 2_000,
            view_refresh_interval_ms: 30_000,
            recent_events: 100,
            shutdown_grace_ms: 1_000,
        }
    }
}

impl Default for ImagingConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig {
                port: DEFAULT_IMAGING_PORT,
                ..ConnectionConfig::default()
            },
            heartbeat_interval_ms: 5_000,
            connection_check_interval_ms: 2_000,
            rtsp_port: DEFAULT_RTSP_PORT,
            timing_window: 20,
            max_payload_bytes: 64 * 1024 * 1024,
            fetch_timeout_ms: 30_000,
            shutdown_grace_ms: 1_000,
        }
    }
}

// ── Builders / accessors ─────────────────────────────────────────

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            connection: ConnectionConfig::new(host, port),
            ..Self::default()
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.connection_check_interval_ms)
    }

    pub fn view_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.view_refresh_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl ImagingConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            connection: ConnectionConfig::new(host, port),
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.connection_check_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_device_ports() {
        assert_eq!(ClientConfig::default().connection.port, 4700);
        assert_eq!(ImagingConfig::default().connection.port, 4800);
        assert_eq!(ImagingConfig::default().rtsp_port, 4554);
        assert_eq!(ImagingConfig::default().timing_window, 20);
        assert_eq!(
            ClientConfig::default().response_timeout(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ClientConfig = serde_json::from_str(
            r#"{"connection": {"host": "10.0.0.2", "read_timeout_ms": 100}, "response_timeout_ms": 250}"#,
        )
        .unwrap();
        assert_eq!(cfg.connection.host, "10.0.0.2");
        assert_eq!(cfg.connection.port, DEFAULT_TEXT_PORT);
        assert_eq!(cfg.connection.read_timeout(), Duration::from_millis(100));
        assert_eq!(cfg.response_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn new_overrides_target_only() {
        let cfg = ImagingConfig::new("127.0.0.1", 5556);
        assert_eq!(cfg.connection.host, "127.0.0.1");
        assert_eq!(cfg.connection.port, 5556);
        assert_eq!(cfg.connection.backoff_base(), Duration::from_secs(1));
        assert_eq!(cfg.connection.backoff_max(), Duration::from_secs(30));
    }
}
