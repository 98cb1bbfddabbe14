use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::engine::SessionOutcome;
use crate::lifecycle::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Lifecycle(LifecycleState),
    SessionOpened {
        id: Uuid,
        peer: Option<SocketAddr>,
    },
    SessionClosed {
        id: Uuid,
        outcome: SessionOutcome,
    },
    ConnectionRefused {
        peer: SocketAddr,
    },
}

#[derive(Debug, Default)]
struct Record {
    transitions: Vec<LifecycleState>,
    closed: VecDeque<(Uuid, SessionOutcome)>,
}

/// In-process broadcast of server events.
///
/// Besides broadcasting, the bus keeps a record that needs no subscription:
/// every lifecycle transition, the most recent closed-session outcomes and
/// a count of refused connections.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
    record: Mutex<Record>,
    closed_capacity: usize,
    refused: AtomicU64,
}

impl EventBus {
    /// `closed_capacity` bounds the kept session outcomes; the oldest go
    /// first.
    pub fn new(closed_capacity: usize, broadcast_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            tx,
            record: Mutex::new(Record::default()),
            closed_capacity: closed_capacity.max(1),
            refused: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ServerEvent) {
        match &event {
            ServerEvent::Lifecycle(state) => {
                self.record.lock().transitions.push(*state);
            }
            ServerEvent::SessionClosed { id, outcome } => {
                let mut record = self.record.lock();
                if record.closed.len() == self.closed_capacity {
                    record.closed.pop_front();
                }
                record.closed.push_back((*id, outcome.clone()));
            }
            ServerEvent::ConnectionRefused { .. } => {
                self.refused.fetch_add(1, Ordering::Relaxed);
            }
            ServerEvent::SessionOpened { .. } => {}
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Lifecycle states entered so far, in order.
    pub fn transitions(&self) -> Vec<LifecycleState> {
        self.record.lock().transitions.clone()
    }

    /// Outcomes of the most recently closed sessions, oldest first.
    pub fn closed_sessions(&self) -> Vec<(Uuid, SessionOutcome)> {
        self.record.lock().closed.iter().cloned().collect()
    }

    pub fn refused_connections(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024, 256)
    }
}
