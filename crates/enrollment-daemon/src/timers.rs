//! Tokio-backed failure timers.
//!
//! Each armed timer is a spawned sleep. Expiry is queued on the node as
//! [`NodeEvent::TimerFired`], so it is handled between protocol events like
//! everything else.

use crate::node::NodeEvent;
use enrollment_core::transport::{PortId, TimerId, TimerScheduler};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct TokioTimers {
    next_seq: AtomicU64,
    armed: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl TokioTimers {
    /// Must be created and used inside a tokio runtime.
    pub fn new(events: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            armed: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Abort every pending timer. Used on shutdown.
    pub fn cancel_all(&self) {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in armed.drain() {
            handle.abort();
        }
    }
}

impl TimerScheduler for TokioTimers {
    fn schedule(&self, port: PortId, after: Duration) -> TimerId {
        let id = TimerId {
            port,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        // Insert under the lock so a zero-length sleep cannot remove first
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        let table = self.armed.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            table.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            if events.send(NodeEvent::TimerFired(id)).is_err() {
                debug!("Timer {:?} fired after its node stopped", id);
            }
        });
        armed.insert(id, handle);
        id
    }

    fn cancel(&self, timer: TimerId) {
        if let Some(handle) = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&timer)
        {
            handle.abort();
        }
    }
}
