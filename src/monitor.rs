//! The sampling pipeline.
//!
//! One tick: drain markers, poll the socket table, normalize and filter,
//! diff against retained state, enrich, write. Ticks run strictly one after
//! another and every record of a tick is flushed before the next tick starts.

use crate::dns_resolver::{PtrLookup, ReverseNameCache};
use crate::endpoint::{normalize, TransportFilter};
use crate::error::MonitorError;
use crate::event_log::{ClosedRecord, ConnectionRecord, Event, EventLog, StartRecord};
use crate::markers::MarkerChannel;
use crate::process_monitor::{HostInfo, ProcessLookup};
use crate::socket_table::{poll_snapshot, SocketTable};
use crate::tracker::{ConnectionTracker, Transition};
use log::{debug, info, warn};
use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const ADMIN_NOTE: &str = "Run as Administrator to see system-wide connections.";

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub transport: TransportFilter,
    pub log_duplicates: bool,
    pub close_events: bool,
    pub dns_timeout: Duration,
    pub markers: bool,
    pub marker1: String,
    pub marker2: String,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub markers: usize,
    pub records: usize,
    pub events: usize,
    pub failed: bool,
}

pub struct Monitor<L: PtrLookup, W: Write> {
    settings: MonitorSettings,
    table: Arc<dyn SocketTable>,
    processes: Arc<dyn ProcessLookup>,
    rdns: ReverseNameCache<L>,
    tracker: ConnectionTracker,
    markers: MarkerChannel,
    log: EventLog<W>,
}

impl<L: PtrLookup, W: Write> Monitor<L, W> {
    pub fn new(
        settings: MonitorSettings,
        table: Arc<dyn SocketTable>,
        processes: Arc<dyn ProcessLookup>,
        rdns: ReverseNameCache<L>,
        markers: MarkerChannel,
        log: EventLog<W>,
    ) -> Self {
        let tracker = ConnectionTracker::new(settings.log_duplicates, settings.close_events);
        Monitor {
            settings,
            table,
            processes,
            rdns,
            tracker,
            markers,
            log,
        }
    }

    /// Writes the `start` record echoing the run settings.
    pub fn start(&mut self, host: HostInfo) -> Result<(), MonitorError> {
        let settings = &self.settings;
        let record = StartRecord {
            host: host.host,
            platform: host.platform,
            admin_note: ADMIN_NOTE.to_string(),
            dns_enabled: self.rdns.enabled(),
            dns_timeout: settings.dns_timeout.as_secs_f64(),
            interval: settings.interval.as_secs_f64(),
            transport: settings.transport,
            log_duplicates: settings.log_duplicates,
            close_events: settings.close_events,
            markers: settings.markers,
            marker1: settings.marker1.clone(),
            marker2: settings.marker2.clone(),
        };
        self.log.emit(Event::Start(record))
    }

    /// Runs one sampling cycle. Only a sink failure is returned as an error.
    pub async fn tick(&mut self) -> Result<TickSummary, MonitorError> {
        let mut summary = TickSummary::default();

        for marker in self.markers.drain() {
            self.log.append(&marker.into_record())?;
            summary.markers += 1;
        }

        let raw = match poll_snapshot(self.table.clone()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Socket table poll failed: {}", e);
                self.log.emit(Event::Error {
                    stage: "net_connections".to_string(),
                    error: e.to_string(),
                })?;
                summary.failed = true;
                return Ok(summary);
            }
        };
        summary.records = raw.len();

        let transport = self.settings.transport;
        let observations: Vec<_> = raw
            .into_iter()
            .filter_map(normalize)
            .filter(|obs| transport.admits(obs.key.transport))
            .collect();

        for transition in self.tracker.advance(observations) {
            debug!("Transition for {}", transition.key());
            let event = self.enrich(transition).await;
            self.log.emit(event)?;
            summary.events += 1;
        }

        Ok(summary)
    }

    async fn enrich(&self, transition: Transition) -> Event {
        match transition {
            Transition::Opened { key, status } => {
                let process = self.processes.lookup(key.pid);
                let rdns = self.lookup_peer(key.remote.map(|r| r.ip)).await;
                Event::Open(ConnectionRecord::new(&key, status, process, rdns))
            }
            Transition::StatusChanged { key, previous, current } => {
                let process = self.processes.lookup(key.pid);
                let rdns = self.lookup_peer(key.remote.map(|r| r.ip)).await;
                Event::StatusChange {
                    connection: ConnectionRecord::new(&key, current, process, rdns),
                    prev_status: previous,
                }
            }
            Transition::Sampled { key, status } => {
                let process = self.processes.lookup(key.pid);
                let rdns = self.lookup_peer(key.remote.map(|r| r.ip)).await;
                Event::Sample(ConnectionRecord::new(&key, status, process, rdns))
            }
            Transition::Closed { key } => Event::Close(ClosedRecord::from(&key)),
        }
    }

    async fn lookup_peer(&self, ip: Option<IpAddr>) -> Option<String> {
        match ip {
            Some(ip) => self.rdns.resolve(ip).await,
            None => None,
        }
    }

    /// Ticks until a shutdown request arrives. Requests are only honoured
    /// between ticks, so no tick is ever cut short.
    pub async fn run(&mut self, shutdown: &mut mpsc::UnboundedReceiver<()>) -> Result<(), MonitorError> {
        loop {
            let started = Instant::now();
            let summary = self.tick().await?;
            debug!(
                "Tick {}: {} markers, {} records, {} events, {} tracked{}",
                self.tracker.tick(),
                summary.markers,
                summary.records,
                summary.events,
                self.tracker.len(),
                if summary.failed { " (poll failed)" } else { "" }
            );

            // An overrunning tick is followed immediately by the next one
            let to_sleep = self.settings.interval.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutdown requested after tick {}", self.tracker.tick());
                    return Ok(());
                }
                _ = tokio::time::sleep(to_sleep) => {}
            }
        }
    }

    /// Stops the marker listener, writes any late markers and the `stop` record, and hands back the sink.
    pub async fn finish(self, reason: &str) -> Result<W, MonitorError> {
        let Monitor { markers, mut log, rdns, .. } = self;
        for marker in markers.shutdown().await {
            log.append(&marker.into_record())?;
        }
        log.emit(Event::Stop {
            reason: reason.to_string(),
        })?;
        info!(
            "Event log complete: {} records, {} cached reverse names",
            log.written(),
            rdns.cache_size().await
        );
        Ok(log.into_inner())
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}
