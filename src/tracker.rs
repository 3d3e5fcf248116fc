//! Connection diff engine.
//!
//! Holds the state of every connection seen in the previous snapshot and, on
//! each tick, turns the new snapshot into lifecycle transitions:
//!
//! - key not retained: `Opened`, then retained with its status
//! - key retained, status differs: `StatusChanged`, retained status updated
//! - key retained, same status: `Sampled` when duplicate sampling is on, otherwise nothing
//! - retained key missing from the snapshot: `Closed` (when close events are on), then dropped
//!
//! Opens, changes and samples follow snapshot order; closes come after. A key
//! present in the snapshot is never closed in the same tick.

use crate::endpoint::{ConnectionKey, Observation};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: Option<String>,
    pub last_seen: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Opened {
        key: ConnectionKey,
        status: Option<String>,
    },
    StatusChanged {
        key: ConnectionKey,
        previous: Option<String>,
        current: Option<String>,
    },
    Sampled {
        key: ConnectionKey,
        status: Option<String>,
    },
    Closed {
        key: ConnectionKey,
    },
}

impl Transition {
    pub fn key(&self) -> &ConnectionKey {
        match self {
            Transition::Opened { key, .. }
            | Transition::StatusChanged { key, .. }
            | Transition::Sampled { key, .. }
            | Transition::Closed { key } => key,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    state: HashMap<ConnectionKey, ConnectionState>,
    tick: u64,
    emit_samples: bool,
    emit_closes: bool,
}

impl ConnectionTracker {
    pub fn new(emit_samples: bool, emit_closes: bool) -> Self {
        ConnectionTracker {
            state: HashMap::new(),
            tick: 0,
            emit_samples,
            emit_closes,
        }
    }

    /// Diffs one full snapshot against retained state. Callers filter before this point;
    /// everything passed in counts toward close detection.
    pub fn advance<I>(&mut self, snapshot: I) -> Vec<Transition>
    where
        I: IntoIterator<Item = Observation>,
    {
        self.tick += 1;
        let tick = self.tick;
        let mut transitions = Vec::new();
        let mut present: HashSet<ConnectionKey> = HashSet::new();

        for Observation { key, status } in snapshot {
            match self.state.get_mut(&key) {
                None => {
                    self.state.insert(
                        key.clone(),
                        ConnectionState {
                            status: status.clone(),
                            last_seen: tick,
                        },
                    );
                    transitions.push(Transition::Opened {
                        key: key.clone(),
                        status,
                    });
                }
                Some(retained) if retained.status != status => {
                    let previous = std::mem::replace(&mut retained.status, status.clone());
                    retained.last_seen = tick;
                    transitions.push(Transition::StatusChanged {
                        key: key.clone(),
                        previous,
                        current: status,
                    });
                }
                Some(retained) => {
                    retained.last_seen = tick;
                    if self.emit_samples {
                        transitions.push(Transition::Sampled {
                            key: key.clone(),
                            status,
                        });
                    }
                }
            }
            present.insert(key);
        }

        let mut vanished: Vec<ConnectionKey> = self
            .state
            .keys()
            .filter(|key| !present.contains(*key))
            .cloned()
            .collect();
        vanished.retain(|key| self.state.remove(key).is_some());
        if self.emit_closes {
            transitions.extend(vanished.into_iter().map(|key| Transition::Closed { key }));
        }

        transitions
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&ConnectionState> {
        self.state.get(key)
    }
}
