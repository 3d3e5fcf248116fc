mod config;
mod dns_resolver;
mod endpoint;
mod error;
mod event_log;
mod logging;
mod markers;
mod monitor;
mod process_monitor;
mod socket_table;
mod tracker;

use crate::config::Config;
use crate::dns_resolver::{ReverseNameCache, TrustDnsLookup};
use crate::error::MonitorError;
use crate::event_log::EventLog;
use crate::logging::setup_logging;
use crate::markers::{MarkerChannel, MarkerLabels, TerminalHotkeys};
use crate::monitor::{Monitor, MonitorSettings};
use crate::process_monitor::{HostInfo, SystemProcessLookup};
use crate::socket_table::SystemSocketTable;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// First argument, else `config.yaml` next to the executable, else in the working directory.
fn locate_config() -> Option<PathBuf> {
    if let Some(path) = std::env::args_os().nth(1) {
        return Some(PathBuf::from(path));
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()));
    if let Some(dir) = exe_dir {
        let candidate = dir.join("config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let local = Path::new("config.yaml");
    if local.exists() {
        Some(local.to_path_buf())
    } else {
        None
    }
}

fn settings_from(config: &Config) -> MonitorSettings {
    MonitorSettings {
        interval: config.interval(),
        transport: config.monitoring.transport,
        log_duplicates: config.monitoring.log_duplicates,
        close_events: config.monitoring.close_events,
        dns_timeout: config.dns_timeout(),
        markers: config.markers.enabled,
        marker1: config.markers.marker1.clone(),
        marker2: config.markers.marker2.clone(),
    }
}

async fn run(config: Config, out_path: &Path) -> Result<(), MonitorError> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

    // Forward every Ctrl+C into the shutdown channel so a press during a tick is not lost
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal");
            if signal_tx.send(()).is_err() {
                break;
            }
        }
    });

    let markers = if config.markers.enabled {
        match TerminalHotkeys::open() {
            Ok(hotkeys) => MarkerChannel::spawn(
                hotkeys,
                MarkerLabels {
                    first: config.markers.marker1.clone(),
                    second: config.markers.marker2.clone(),
                },
                shutdown_tx.clone(),
            ),
            Err(e) => {
                warn!("Marker hotkeys unavailable ({}), continuing without markers", e);
                MarkerChannel::disabled()
            }
        }
    } else {
        MarkerChannel::disabled()
    };

    let rdns = ReverseNameCache::new(
        TrustDnsLookup::new(config.dns_timeout()),
        config.dns.enabled,
        config.dns_timeout(),
        config.dns.cache_capacity,
    );

    let mut monitor = Monitor::new(
        settings_from(&config),
        Arc::new(SystemSocketTable::new()),
        Arc::new(SystemProcessLookup::new(config.monitoring.process_cache_seconds)),
        rdns,
        markers,
        EventLog::open(out_path)?,
    );

    monitor.start(HostInfo::detect())?;
    info!(
        "Monitoring connections every {:?}, writing to {}",
        config.interval(),
        out_path.display()
    );
    monitor.run(&mut shutdown_rx).await?;
    monitor.finish("interrupt").await?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = locate_config();
    let (config, config_note) = match &config_path {
        Some(path) => (Config::load(path)?, format!("Configuration loaded from {}", path.display())),
        None => (Config::default(), "Config not found, using defaults".to_string()),
    };

    setup_logging(&config.logging)?;
    info!("{}", config_note);

    if !cfg!(windows) {
        warn!(
            "Process ownership is most complete on Windows run as Administrator; running on {}",
            std::env::consts::OS
        );
    }

    let out_path = config.output_path();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    if let Err(e) = runtime.block_on(run(config, &out_path)) {
        error!("Monitor stopped: {}", e);
        return Err(e.into());
    }

    println!("Log written to: {}", out_path.display());
    println!("Tip: Run as Administrator to capture all processes.");
    Ok(())
}
