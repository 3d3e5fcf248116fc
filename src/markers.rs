//! Hotkey timeline markers.
//!
//! A blocking listener watches an input source for two triggers (F1 and F2 on
//! a terminal) and turns each press into a timestamped [`Marker`] sent over an
//! unbounded channel. The sampling loop drains the channel at the start of
//! every tick, so markers land in the log in arrival order and ahead of that
//! tick's connection events. If the input source cannot be opened the
//! channel simply stays empty.

use crate::event_log::{Event, Record};
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use log::{debug, info, warn};
use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const POLL_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSlot {
    First,
    Second,
}

impl MarkerSlot {
    pub fn trigger_name(&self) -> &'static str {
        match self {
            MarkerSlot::First => "F1",
            MarkerSlot::Second => "F2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Marker(MarkerSlot),
    /// Ctrl+C read as a key; raw mode keeps it from arriving as a signal.
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerLabels {
    pub first: String,
    pub second: String,
}

impl MarkerLabels {
    fn label(&self, slot: MarkerSlot) -> &str {
        match slot {
            MarkerSlot::First => &self.first,
            MarkerSlot::Second => &self.second,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub label: String,
}

impl Marker {
    pub fn into_record(self) -> Record {
        Record::new(
            self.ts,
            Event::Marker {
                marker: self.kind,
                label: self.label,
            },
        )
    }
}

/// Interactive input the listener reads triggers from.
pub trait TriggerSource: Send + 'static {
    /// Waits up to `wait` for the next trigger. `Ok(None)` means nothing arrived.
    fn next_trigger(&mut self, wait: Duration) -> io::Result<Option<Trigger>>;

    /// Called once per accepted marker.
    fn acknowledge(&mut self, _marker: &Marker) {}
}

/// F1/F2 on the controlling terminal. Holds the terminal in raw mode until dropped.
pub struct TerminalHotkeys {
    _private: (),
}

impl TerminalHotkeys {
    pub fn open() -> io::Result<Self> {
        if !io::stdin().is_terminal() {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "stdin is not a terminal"));
        }
        enable_raw_mode()?;
        print!("Markers enabled: press F1/F2 in this console to add markers.\r\n");
        Ok(TerminalHotkeys { _private: () })
    }
}

impl Drop for TerminalHotkeys {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

impl TriggerSource for TerminalHotkeys {
    fn next_trigger(&mut self, wait: Duration) -> io::Result<Option<Trigger>> {
        if !event::poll(wait)? {
            return Ok(None);
        }
        let key = match event::read()? {
            TermEvent::Key(key) if key.kind == KeyEventKind::Press => key,
            _ => return Ok(None),
        };
        let trigger = match key.code {
            KeyCode::F(1) => Some(Trigger::Marker(MarkerSlot::First)),
            KeyCode::F(2) => Some(Trigger::Marker(MarkerSlot::Second)),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Trigger::Interrupt),
            _ => None,
        };
        Ok(trigger)
    }

    fn acknowledge(&mut self, marker: &Marker) {
        print!("[marker] {} -> {}\r\n", marker.kind, marker.label);
    }
}

/// Listener loop; returns when cancelled, when the receiver is gone, or when the source fails.
pub fn listen<S: TriggerSource>(
    mut source: S,
    labels: MarkerLabels,
    markers: mpsc::UnboundedSender<Marker>,
    interrupt: mpsc::UnboundedSender<()>,
    cancel: Arc<AtomicBool>,
) {
    while !cancel.load(Ordering::SeqCst) {
        match source.next_trigger(POLL_WAIT) {
            Ok(Some(Trigger::Marker(slot))) => {
                let marker = Marker {
                    ts: Utc::now(),
                    kind: slot.trigger_name().to_string(),
                    label: labels.label(slot).to_string(),
                };
                info!("Marker {} -> {}", marker.kind, marker.label);
                source.acknowledge(&marker);
                if markers.send(marker).is_err() {
                    break;
                }
            }
            Ok(Some(Trigger::Interrupt)) => {
                debug!("Interrupt key received by marker listener");
                let _ = interrupt.send(());
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Marker input failed ({}), markers disabled", e);
                break;
            }
        }
    }
}

/// Receiving end of the marker listener, owned by the sampling loop.
pub struct MarkerChannel {
    receiver: Option<mpsc::UnboundedReceiver<Marker>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MarkerChannel {
    /// A channel that never yields markers.
    pub fn disabled() -> Self {
        MarkerChannel {
            receiver: None,
            cancel: Arc::new(AtomicBool::new(true)),
            handle: None,
        }
    }

    /// Starts the listener on the blocking pool. Must be called inside a tokio runtime.
    pub fn spawn<S: TriggerSource>(source: S, labels: MarkerLabels, interrupt: mpsc::UnboundedSender<()>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let listener_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            listen(source, labels, sender, interrupt, listener_cancel);
        });
        MarkerChannel {
            receiver: Some(receiver),
            cancel,
            handle: Some(handle),
        }
    }

    /// Everything queued so far, oldest first. Each marker is returned exactly once.
    pub fn drain(&mut self) -> Vec<Marker> {
        let mut pending = Vec::new();
        if let Some(receiver) = self.receiver.as_mut() {
            while let Ok(marker) = receiver.try_recv() {
                pending.push(marker);
            }
        }
        pending
    }

    /// Stops the listener and returns markers that arrived after the last drain.
    pub async fn shutdown(mut self) -> Vec<Marker> {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Marker listener stopped"),
                Ok(Err(e)) => warn!("Marker listener task error: {}", e),
                Err(_) => warn!("Marker listener did not stop within timeout"),
            }
        }
        self.drain()
    }
}

impl Drop for MarkerChannel {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays triggers, then reports failure so the listener returns.
    struct Scripted(VecDeque<Trigger>);

    impl TriggerSource for Scripted {
        fn next_trigger(&mut self, _wait: Duration) -> io::Result<Option<Trigger>> {
            match self.0.pop_front() {
                Some(trigger) => Ok(Some(trigger)),
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "script finished")),
            }
        }
    }

    /// Never produces anything; only cancellation ends it.
    struct Idle;

    impl TriggerSource for Idle {
        fn next_trigger(&mut self, wait: Duration) -> io::Result<Option<Trigger>> {
            std::thread::sleep(wait);
            Ok(None)
        }
    }

    fn labels() -> MarkerLabels {
        MarkerLabels {
            first: "matchmaking_start".to_string(),
            second: "issue_observed".to_string(),
        }
    }

    #[test]
    fn test_listener_preserves_order_and_labels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
        let script = Scripted(VecDeque::from(vec![
            Trigger::Marker(MarkerSlot::First),
            Trigger::Marker(MarkerSlot::Second),
            Trigger::Marker(MarkerSlot::First),
        ]));
        listen(script, labels(), tx, interrupt_tx, Arc::new(AtomicBool::new(false)));

        let kinds: Vec<(String, String)> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| (m.kind, m.label))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("F1".to_string(), "matchmaking_start".to_string()),
                ("F2".to_string(), "issue_observed".to_string()),
                ("F1".to_string(), "matchmaking_start".to_string()),
            ]
        );
        assert!(interrupt_rx.try_recv().is_err());
    }

    #[test]
    fn test_interrupt_key_is_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (interrupt_tx, mut interrupt_rx) = mpsc::unbounded_channel();
        let script = Scripted(VecDeque::from(vec![Trigger::Interrupt]));
        listen(script, labels(), tx, interrupt_tx, Arc::new(AtomicBool::new(false)));
        assert!(interrupt_rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancelled_listener_returns_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (interrupt_tx, _interrupt_rx) = mpsc::unbounded_channel();
        listen(Idle, labels(), tx, interrupt_tx, Arc::new(AtomicBool::new(true)));
    }

    #[tokio::test]
    async fn test_drain_delivers_each_marker_once() {
        let (interrupt_tx, _interrupt_rx) = mpsc::unbounded_channel();
        let script = Scripted(VecDeque::from(vec![
            Trigger::Marker(MarkerSlot::First),
            Trigger::Marker(MarkerSlot::Second),
        ]));
        let mut channel = MarkerChannel::spawn(script, labels(), interrupt_tx);

        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(channel.drain());
            if seen.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.iter().map(|m| m.kind.as_str()).collect::<Vec<_>>(), vec!["F1", "F2"]);
        assert!(channel.drain().is_empty());
        assert!(channel.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_listener() {
        let (interrupt_tx, _interrupt_rx) = mpsc::unbounded_channel();
        let channel = MarkerChannel::spawn(Idle, labels(), interrupt_tx);
        assert!(channel.shutdown().await.is_empty());
    }

    #[test]
    fn test_disabled_channel_is_empty() {
        let mut channel = MarkerChannel::disabled();
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn test_marker_record_keeps_arrival_time() {
        let ts = Utc::now() - chrono::Duration::seconds(30);
        let record = Marker {
            ts,
            kind: "F2".to_string(),
            label: "issue_observed".to_string(),
        }
        .into_record();
        assert_eq!(record.ts, ts);
        assert!(matches!(record.event, Event::Marker { ref marker, .. } if marker == "F2"));
    }
}
