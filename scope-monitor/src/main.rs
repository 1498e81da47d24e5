//! scope-monitor entry point.
//!
//! ```text
//! scope-monitor                    Run in the foreground
//! scope-monitor --config <path>    Load a custom config TOML
//! scope-monitor --host <addr>      Override the scope host
//! scope-monitor --no-imaging       Text channel only
//! scope-monitor --gen-config       Write default config to stdout
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scope_monitor::config::MonitorConfig;
use scope_monitor::monitor::MonitorService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "scope-monitor", about = "Telescope status and frame monitor")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "scope-monitor.toml")]
    config: PathBuf,

    /// Scope host name or address, overriding the config file.
    #[arg(long)]
    host: Option<String>,

    /// Do not open the imaging channel.
    #[arg(long)]
    no_imaging: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&MonitorConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = MonitorConfig::load(&cli.config);
    if let Some(host) = &cli.host {
        config = config.with_host(host);
    }
    if cli.no_imaging {
        config.monitor.enable_imaging = false;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.logging.file)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }

    info!("scope-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("text channel: {}:{}", config.client.connection.host, config.client.connection.port);
    if config.monitor.enable_imaging {
        info!("imaging channel: {}:{}", config.imaging.connection.host, config.imaging.connection.port);
    }

    let service = MonitorService::new(config);
    let stop = service.stop_handle();

    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
