//! JSON-lines event log.
//!
//! One self-contained object per line, flushed before the next record is
//! considered, so an abrupt stop loses at most the record being built and
//! never leaves half a line behind. Field names are the compatibility surface
//! for downstream tooling: `raddr` is always present (explicit `null` when the
//! socket has no peer), `rdns` only when a name was resolved.

use crate::endpoint::{ConnectionKey, Endpoint, Family, Transport, TransportFilter};
use crate::error::MonitorError;
use crate::process_monitor::ProcessInfo;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessFields {
    pub name: Option<String>,
    pub exe: Option<String>,
}

/// Shared shape of `open`, `status_change` and `sample` records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub family: Family,
    pub proto: Transport,
    pub status: Option<String>,
    pub laddr: Endpoint,
    pub raddr: Option<Endpoint>,
    pub pid: Option<u32>,
    pub process: ProcessFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdns: Option<String>,
}

impl ConnectionRecord {
    pub fn new(key: &ConnectionKey, status: Option<String>, process: ProcessInfo, rdns: Option<String>) -> Self {
        ConnectionRecord {
            family: key.family,
            proto: key.transport,
            status,
            laddr: key.local,
            raddr: key.remote,
            pid: key.pid,
            process: ProcessFields {
                name: process.name,
                exe: process.exe,
            },
            rdns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedRecord {
    pub family: Family,
    pub proto: Transport,
    pub laddr: Endpoint,
    pub raddr: Option<Endpoint>,
    pub pid: Option<u32>,
}

impl From<&ConnectionKey> for ClosedRecord {
    fn from(key: &ConnectionKey) -> Self {
        ClosedRecord {
            family: key.family,
            proto: key.transport,
            laddr: key.local,
            raddr: key.remote,
            pid: key.pid,
        }
    }
}

/// Run settings echoed in the `start` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartRecord {
    pub host: String,
    pub platform: String,
    pub admin_note: String,
    pub dns_enabled: bool,
    pub dns_timeout: f64,
    pub interval: f64,
    pub transport: TransportFilter,
    pub log_duplicates: bool,
    pub close_events: bool,
    pub markers: bool,
    pub marker1: String,
    pub marker2: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Start(StartRecord),
    Open(ConnectionRecord),
    StatusChange {
        #[serde(flatten)]
        connection: ConnectionRecord,
        prev_status: Option<String>,
    },
    Sample(ConnectionRecord),
    Close(ClosedRecord),
    Marker { marker: String, label: String },
    Error { stage: String, error: String },
    Stop { reason: String },
}

/// An event stamped with the moment it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(serialize_with = "iso_seconds")]
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl Record {
    pub fn new(ts: DateTime<Utc>, event: Event) -> Self {
        Record { ts, event }
    }

    pub fn now(event: Event) -> Self {
        Record::new(Utc::now(), event)
    }
}

fn iso_seconds<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Append-only sink. Any write failure is fatal to the caller.
pub struct EventLog<W: Write> {
    writer: W,
    written: u64,
}

impl EventLog<File> {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, MonitorError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| MonitorError::SinkOpen {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(EventLog::new(file))
    }
}

impl<W: Write> EventLog<W> {
    pub fn new(writer: W) -> Self {
        EventLog { writer, written: 0 }
    }

    pub fn append(&mut self, record: &Record) -> Result<(), MonitorError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).map_err(MonitorError::SinkWrite)?;
        self.writer.flush().map_err(MonitorError::SinkWrite)?;
        self.written += 1;
        Ok(())
    }

    /// Stamps `event` with the current time and appends it.
    pub fn emit(&mut self, event: Event) -> Result<(), MonitorError> {
        self.append(&Record::now(event))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
