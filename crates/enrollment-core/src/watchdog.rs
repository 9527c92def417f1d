//! Liveness probing of enrolled neighbors.
//!
//! Every period the watchdog reads the watchdog object of each enrolled
//! neighbor it has not heard from recently. Responses feed the neighbor's
//! round-trip average. A neighbor silent for longer than the dead interval is
//! announced as [`EnrollmentEvent::NeighborDeclaredDead`].

use crate::directory::NeighborDirectory;
use crate::events::{EnrollmentEvent, EventBus};
use crate::messages::{ObjectValue, OperationResult, RemoteOperation, objects};
use crate::transport::{Clock, PortId, RemoteOperationChannel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub struct Watchdog {
    period_ms: u64,
    dead_interval_ms: u64,
    directory: Arc<NeighborDirectory>,
    channel: Arc<dyn RemoteOperationChannel>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    /// Neighbor name -> time the outstanding probe was sent
    probes: Mutex<HashMap<String, u64>>,
    next_invoke_id: AtomicU32,
}

impl Watchdog {
    pub fn new(
        period_ms: u64,
        dead_interval_ms: u64,
        directory: Arc<NeighborDirectory>,
        channel: Arc<dyn RemoteOperationChannel>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            period_ms,
            dead_interval_ms,
            directory,
            channel,
            clock,
            events,
            probes: Mutex::new(HashMap::new()),
            next_invoke_id: AtomicU32::new(1),
        }
    }

    /// Run one probing round. Returns the number of probes sent.
    pub fn send_probes(&self) -> usize {
        let now = self.clock.now_ms();
        let mut dead = Vec::new();
        let mut sent = 0;

        {
            let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
            probes.clear();

            for neighbor in self.directory.enrolled_neighbors() {
                // Heard from recently enough
                if neighbor.last_heard_from_ms + self.period_ms > now {
                    continue;
                }

                if neighbor.last_heard_from_ms != 0
                    && neighbor.last_heard_from_ms + self.dead_interval_ms < now
                {
                    dead.push(neighbor);
                    continue;
                }

                let Some(port) = neighbor.underlying_port else {
                    continue;
                };
                let probe = RemoteOperation::Read {
                    object: objects::WATCHDOG.to_string(),
                    invoke_id: self.next_invoke_id.fetch_add(1, Ordering::Relaxed),
                };
                match self.channel.send(port, probe) {
                    Ok(()) => {
                        probes.insert(neighbor.name.clone(), now);
                        sent += 1;
                    }
                    Err(e) => warn!("Problems probing {}: {}", neighbor.name, e),
                }
            }
        }

        for neighbor in dead {
            warn!(
                "No news from {} for {} ms, declaring it dead",
                neighbor.name,
                now - neighbor.last_heard_from_ms
            );
            self.events
                .emit(EnrollmentEvent::NeighborDeclaredDead { neighbor });
        }

        sent
    }

    /// A neighbor answered our probe.
    pub fn probe_response(&self, name: &str, result: &OperationResult) {
        if !result.is_success() {
            warn!(
                "Watchdog probe to {} failed: {}",
                name,
                result.reason_or_default()
            );
            return;
        }

        let sent_at = self
            .probes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        let Some(sent_at) = sent_at else {
            debug!("Unsolicited watchdog response from {}", name);
            return;
        };

        let now = self.clock.now_ms();
        if let Some(average) = self
            .directory
            .record_rtt(name, now.saturating_sub(sent_at), now)
        {
            debug!("Round-trip time to {} now averages {} ms", name, average);
        }
    }

    /// A neighbor probed us. Refresh its last-heard time and answer with our address.
    pub fn remote_probe(&self, port: PortId, invoke_id: u32) {
        if let Some(neighbor) = self.directory.get_by_port(port) {
            self.directory
                .watchdog_read(&neighbor.name, self.clock.now_ms());
        }

        let reply = RemoteOperation::ReadResult {
            object: objects::WATCHDOG.to_string(),
            result: OperationResult::success(),
            value: Some(ObjectValue::Address(self.directory.address())),
            invoke_id,
        };
        if let Err(e) = self.channel.send(port, reply) {
            warn!("Problems answering watchdog probe on port {}: {}", port, e);
        }
    }

    pub fn outstanding_probes(&self) -> usize {
        self.probes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
