//! Enrollment events and the bus that delivers them.
//!
//! Namespace management, the data-transfer layer and the coordinator itself
//! (for declared-dead neighbors) subscribe to these.

use crate::directory::Neighbor;
use crate::transport::PortId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EnrollmentEvent {
    /// Enrollment with a neighbor completed.
    NeighborAdded {
        neighbor: Neighbor,
        /// True if the local process was the joining side
        enrollee: bool,
    },
    /// The N-1 flow to an enrolled neighbor went away.
    ConnectivityToNeighborLost { neighbor: Neighbor },
    /// The watchdog has not heard from the neighbor for the dead interval.
    NeighborDeclaredDead { neighbor: Neighbor },
    /// An enrollment attempt was aborted.
    EnrollmentFailed {
        name: String,
        port: PortId,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    NeighborAddressChanged {
        name: String,
        old_address: u64,
        new_address: u64,
    },
    /// First DIF assignment of the local process. Data transfer may start.
    AssignedToDif { address: u64 },
}

/// Discriminant of an [`EnrollmentEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NeighborAdded,
    ConnectivityToNeighborLost,
    NeighborDeclaredDead,
    EnrollmentFailed,
    NeighborAddressChanged,
    AssignedToDif,
}

impl EnrollmentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EnrollmentEvent::NeighborAdded { .. } => EventKind::NeighborAdded,
            EnrollmentEvent::ConnectivityToNeighborLost { .. } => {
                EventKind::ConnectivityToNeighborLost
            }
            EnrollmentEvent::NeighborDeclaredDead { .. } => EventKind::NeighborDeclaredDead,
            EnrollmentEvent::EnrollmentFailed { .. } => EventKind::EnrollmentFailed,
            EnrollmentEvent::NeighborAddressChanged { .. } => EventKind::NeighborAddressChanged,
            EnrollmentEvent::AssignedToDif { .. } => EventKind::AssignedToDif,
        }
    }
}

/// Keeps a callback registered. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(EnrollmentEvent) + Send + Sync>;

struct Subscriber {
    id: usize,
    /// None receives every event
    kinds: Option<Vec<EventKind>>,
    callback: Callback,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().is_none_or(|kinds| kinds.contains(&kind))
    }
}

/// Fan-out of enrollment events. Subscribing needs the bus in an `Arc`.
///
/// The subscriber lock is never held while a callback runs, so callbacks may
/// emit, subscribe or drop subscriptions.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event until the returned [`Subscription`] is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(EnrollmentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(None, Arc::new(callback))
    }

    /// Receive only events of the listed kinds.
    pub fn subscribe_to(
        self: &Arc<Self>,
        kinds: &[EventKind],
        callback: impl Fn(EnrollmentEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.register(Some(kinds.to_vec()), Arc::new(callback))
    }

    fn register(
        self: &Arc<Self>,
        kinds: Option<Vec<EventKind>>,
        callback: Callback,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, kinds, callback });
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| s.id != id);
    }

    pub fn emit(&self, event: EnrollmentEvent) {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.wants(kind))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
