//! Monitor service core logic.
//!
//! Connects the text client (and optionally the imaging client) over one
//! shared event bus, logs events and a periodic status summary, and
//! follows the frame stream until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

use scope_core::{
    ANY_EVENT, CLIENT_MODE_CHANGED, EventBody, EventBus, ImagingClient, ScopeClient, ScopeError,
    ScopeImage, Subscription,
};

use crate::config::MonitorConfig;

// ── MonitorService ───────────────────────────────────────────────

pub struct MonitorService {
    config: MonitorConfig,
    running: Arc<AtomicBool>,
}

impl MonitorService {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until stopped.
    ///
    /// Fails only if the text channel cannot be opened; an unreachable
    /// imaging channel is logged and skipped.
    pub async fn run(&self) -> Result<(), ScopeError> {
        self.running.store(true, Ordering::SeqCst);

        let bus = EventBus::new();
        let _log_subscriptions = log_events(&bus);

        let client = ScopeClient::new(self.config.client.clone(), bus.clone());
        if let Err(e) = client.connect().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("text channel connected to {}", client.connection_info());

        let imaging = if self.config.monitor.enable_imaging {
            let imaging = ImagingClient::new(self.config.imaging.clone(), bus.clone());
            // Pick up the mode the text client already knows about.
            imaging.set_client_mode(client.client_mode());
            match imaging.connect().await {
                Ok(()) => {
                    info!("imaging channel connected to {}", imaging.connection_info());
                    Some(imaging)
                }
                Err(e) => {
                    warn!("imaging channel unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let frames = imaging
            .as_ref()
            .map(|imaging| tokio::spawn(follow_frames(imaging.get_next_image(self.config.monitor.camera_id))));

        let mut ticker = tokio::time::interval(self.config.status_interval());
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ticker.tick() => log_status(&client, imaging.as_ref()),
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        if let Some(imaging) = &imaging {
            imaging.disconnect().await;
        }
        client.disconnect().await;
        if let Some(frames) = frames {
            let _ = frames.await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("monitor stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

// ── Logging helpers ──────────────────────────────────────────────

fn log_events(bus: &EventBus) -> Vec<Subscription> {
    vec![
        bus.subscribe_scoped(ANY_EVENT, |event| {
            debug!(kind = %event.kind, timestamp = ?event.timestamp, "event: {:?}", event.body);
        }),
        bus.subscribe_scoped("PiStatus", |event| {
            if let EventBody::PiStatus(pi) = &event.body {
                info!(
                    temp = ?pi.temp,
                    battery = ?pi.battery_capacity,
                    charger = ?pi.charger_status,
                    "power status"
                );
            }
        }),
        bus.subscribe_scoped(CLIENT_MODE_CHANGED, |event| {
            if let EventBody::ModeChanged(change) = &event.body {
                info!(from = ?change.existing, to = %change.new_mode, "mode changed");
            }
        }),
    ]
}

fn log_status(client: &ScopeClient, imaging: Option<&ImagingClient>) {
    let status = client.status();
    info!(
        state = %client.state(),
        mode = ?status.client_mode,
        battery = ?status.battery_capacity,
        temp = ?status.temp,
        target = ?status.target_name,
        stacked = ?status.stacked_frame,
        free_mb = ?status.free_mb,
        "scope status"
    );
    if let Some(imaging) = imaging {
        let img = imaging.status();
        info!(
            state = %imaging.state(),
            streaming = img.is_streaming,
            frames = img.total_frames,
            skipped = img.skipped_frame,
            fps = ?img.fps,
            "imaging status"
        );
    }
}

async fn follow_frames(mut frames: BoxStream<'static, Arc<ScopeImage>>) {
    let mut count: u64 = 0;
    while let Some(frame) = frames.next().await {
        count += 1;
        debug!(count, width = frame.width, height = frame.height, "frame");
    }
    info!(count, "frame stream ended");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Answers every request with an empty success.
    async fn echo_scope() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let Ok(request) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        let reply = json!({"id": request["id"], "method": request["method"], "result": 0, "code": 0});
                        if write.write_all(format!("{reply}\r\n").as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    fn config(port: u16) -> MonitorConfig {
        let mut config = MonitorConfig::default().with_host("127.0.0.1");
        config.client.connection.port = port;
        config.client.connection.connect_timeout_ms = 500;
        config.monitor.enable_imaging = false;
        config.monitor.status_interval_ms = 50;
        config
    }

    #[tokio::test]
    async fn run_fails_when_scope_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = MonitorService::new(config(port));
        assert!(service.run().await.is_err());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn run_until_stopped() {
        let port = echo_scope().await;
        let service = Arc::new(MonitorService::new(config(port)));
        let stop = service.stop_handle();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.run().await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !service.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timeout");
        tokio::time::sleep(Duration::from_millis(150)).await;

        stop.store(false, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("timeout")
            .unwrap();
        assert!(result.is_ok());
        assert!(!service.is_running());
    }
}
