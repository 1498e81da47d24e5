//! Configuration for the monitor service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use scope_core::{ClientConfig, ImagingConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Text-channel client settings.
    pub client: ClientConfig,
    /// Imaging-channel client settings.
    pub imaging: ImagingConfig,
    /// What the monitor does once connected.
    pub monitor: MonitorSettings,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Also connect the imaging channel and follow its frames.
    pub enable_imaging: bool,
    /// Camera whose frames are followed.
    pub camera_id: u16,
    /// Interval between status summaries in the log.
    pub status_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enable_imaging: true,
            camera_id: 0,
            status_interval_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl MonitorConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Point both channels at `host`.
    pub fn with_host(mut self, host: &str) -> Self {
        self.client.connection.host = host.to_string();
        self.imaging.connection.host = host.to_string();
        self
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.status_interval_ms.max(1))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = MonitorConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("response_timeout_ms"));
        assert!(text.contains("rtsp_port"));
        assert!(text.contains("enable_imaging"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = MonitorConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: MonitorConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.client.connection.port, 4700);
        assert_eq!(parsed.imaging.connection.port, 4800);
        assert_eq!(parsed.imaging.timing_window, 20);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: MonitorConfig = toml::from_str(
            r#"
            [client.connection]
            host = "192.168.1.40"

            [monitor]
            enable_imaging = false
            "#,
        )
        .unwrap();
        assert_eq!(parsed.client.connection.host, "192.168.1.40");
        assert_eq!(parsed.client.connection.port, 4700);
        assert_eq!(parsed.client.response_timeout_ms, 30_000);
        assert!(!parsed.monitor.enable_imaging);
        assert_eq!(parsed.monitor.status_interval_ms, 10_000);
    }

    #[test]
    fn with_host_sets_both_channels() {
        let cfg = MonitorConfig::default().with_host("10.0.0.9");
        assert_eq!(cfg.client.connection.host, "10.0.0.9");
        assert_eq!(cfg.imaging.connection.host, "10.0.0.9");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = MonitorConfig::load(Path::new("/nonexistent/scope-monitor.toml"));
        assert_eq!(cfg.logging.level, "info");
    }
}
