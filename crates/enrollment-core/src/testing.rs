//! In-process doubles for the transport seams.
//!
//! Used by unit tests, the integration tests and downstream crates that want
//! to drive an [`EnrollmentTask`] without a runtime.

use crate::addressing::RangeAddressAssigner;
use crate::config::EnrollmentConfig;
use crate::directory::{Neighbor, NeighborDirectory};
use crate::enrollment_task::{Collaborators, EnrollmentTask, LocalProcess};
use crate::events::{EnrollmentEvent, EventBus, Subscription};
use crate::messages::RemoteOperation;
use crate::request::ManagerNotifier;
use crate::security::SecurityManager;
use crate::transport::{
    self, FlowAllocator, FlowHandle, ManualClock, PortId, RemoteOperationChannel, TimerId,
    TimerScheduler, TransportError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Channel that records every operation instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(PortId, RemoteOperation)>>,
    failing: Mutex<HashSet<PortId>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send on `port` fail.
    pub fn fail_sends_on(&self, port: PortId) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(port);
    }

    pub fn sent(&self) -> Vec<(PortId, RemoteOperation)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_on(&self, port: PortId) -> Vec<RemoteOperation> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, op)| op.clone())
            .collect()
    }

    /// Remove and return the operations recorded for `port`.
    pub fn take_on(&self, port: PortId) -> Vec<RemoteOperation> {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        let (taken, kept): (Vec<_>, Vec<_>) = sent.drain(..).partition(|(p, _)| *p == port);
        *sent = kept;
        taken.into_iter().map(|(_, op)| op).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl RemoteOperationChannel for RecordingChannel {
    fn send(&self, port: PortId, operation: RemoteOperation) -> transport::Result<()> {
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&port) {
            return Err(TransportError::SendFailed(format!("port {} is broken", port)));
        }
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push((port, operation));
        Ok(())
    }
}

/// Flow allocator that hands out handles and records deallocations.
#[derive(Debug, Default)]
pub struct RecordingFlows {
    next_handle: AtomicU64,
    failing: AtomicBool,
    allocations: Mutex<Vec<(FlowHandle, Neighbor)>>,
    deallocated: Mutex<Vec<PortId>>,
}

impl RecordingFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `allocate_flow` fail synchronously.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn allocations(&self) -> Vec<(FlowHandle, Neighbor)> {
        self.allocations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn deallocated(&self) -> Vec<PortId> {
        self.deallocated.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl FlowAllocator for RecordingFlows {
    fn allocate_flow(&self, neighbor: &Neighbor) -> transport::Result<FlowHandle> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::AllocationFailed(format!(
                "no route to {}",
                neighbor.name
            )));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, neighbor.clone()));
        Ok(handle)
    }

    fn deallocate_flow(&self, port: PortId) -> transport::Result<()> {
        self.deallocated.lock().unwrap_or_else(|e| e.into_inner()).push(port);
        Ok(())
    }
}

/// Timers that never fire on their own. Tests expire them explicitly.
#[derive(Debug, Default)]
pub struct ManualTimers {
    next_seq: AtomicU64,
    armed: Mutex<Vec<(TimerId, Duration)>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers scheduled and not yet cancelled, oldest first.
    pub fn armed(&self) -> Vec<TimerId> {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn armed_on(&self, port: PortId) -> Option<TimerId> {
        self.armed()
            .into_iter()
            .find(|id| id.port == port)
    }

    pub fn duration_of(&self, id: TimerId) -> Option<Duration> {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(armed, _)| *armed == id)
            .map(|(_, after)| *after)
    }
}

impl TimerScheduler for ManualTimers {
    fn schedule(&self, port: PortId, after: Duration) -> TimerId {
        let id = TimerId {
            port,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).push((id, after));
        id
    }

    fn cancel(&self, timer: TimerId) {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).retain(|(id, _)| *id != timer);
    }
}

/// Notifier that records every enrollment result.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    results: Mutex<Vec<(u64, Result<Neighbor, String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<(u64, Result<Neighbor, String>)> {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn failures_for(&self, correlation_id: u64) -> Vec<String> {
        self.results()
            .into_iter()
            .filter(|(id, _)| *id == correlation_id)
            .filter_map(|(_, r)| r.err())
            .collect()
    }

    pub fn successes_for(&self, correlation_id: u64) -> Vec<Neighbor> {
        self.results()
            .into_iter()
            .filter(|(id, _)| *id == correlation_id)
            .filter_map(|(_, r)| r.ok())
            .collect()
    }
}

impl ManagerNotifier for RecordingNotifier {
    fn enrollment_result(&self, correlation_id: u64, result: Result<Neighbor, String>) {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).push((correlation_id, result));
    }
}

/// An [`EnrollmentTask`] wired to recording doubles.
pub struct TestNode {
    pub task: Arc<EnrollmentTask>,
    pub directory: Arc<NeighborDirectory>,
    pub events: Arc<EventBus>,
    pub channel: Arc<RecordingChannel>,
    pub flows: Arc<RecordingFlows>,
    pub timers: Arc<ManualTimers>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    seen: Arc<Mutex<Vec<EnrollmentEvent>>>,
    _subscription: Subscription,
}

impl TestNode {
    pub fn new(local: LocalProcess, config: EnrollmentConfig) -> Self {
        Self::with_security(local, config, SecurityManager::new())
    }

    pub fn with_security(
        local: LocalProcess,
        config: EnrollmentConfig,
        security: SecurityManager,
    ) -> Self {
        let directory = Arc::new(NeighborDirectory::new());
        let events = Arc::new(EventBus::new());
        let channel = Arc::new(RecordingChannel::new());
        let flows = Arc::new(RecordingFlows::new());
        let timers = Arc::new(ManualTimers::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let notifier = Arc::new(RecordingNotifier::new());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let subscription = events.subscribe(move |e| seen_clone.lock().unwrap_or_else(|e| e.into_inner()).push(e));

        let task = EnrollmentTask::new(
            local,
            config,
            directory.clone(),
            events.clone(),
            Collaborators {
                channel: channel.clone(),
                flows: flows.clone(),
                security: Arc::new(security),
                addresses: Arc::new(RangeAddressAssigner::new(1..=1000, directory.clone())),
                timers: timers.clone(),
                clock: clock.clone(),
                manager: notifier.clone(),
            },
        );

        Self {
            task,
            directory,
            events,
            channel,
            flows,
            timers,
            clock,
            notifier,
            seen,
            _subscription: subscription,
        }
    }

    /// Events emitted so far, in order.
    pub fn events_seen(&self) -> Vec<EnrollmentEvent> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Handle of the most recent flow request.
    pub fn last_flow_request(&self) -> Option<FlowHandle> {
        self.flows.allocations().last().map(|(handle, _)| *handle)
    }
}

/// Operations delivered by [`exchange`], per direction, in delivery order.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    pub a_to_b: Vec<RemoteOperation>,
    pub b_to_a: Vec<RemoteOperation>,
}

impl Transcript {
    pub fn len(&self) -> usize {
        self.a_to_b.len() + self.b_to_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shuttle operations between two nodes joined by one flow until both are quiet.
///
/// `a_port` and `b_port` are the two ends of the flow.
pub fn exchange(a: &TestNode, a_port: PortId, b: &TestNode, b_port: PortId) -> Transcript {
    let mut transcript = Transcript::default();
    for _ in 0..100 {
        let from_a = a.channel.take_on(a_port);
        let from_b = b.channel.take_on(b_port);
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for op in from_a {
            transcript.a_to_b.push(op.clone());
            let _ = b.task.process_remote_operation(b_port, op);
        }
        for op in from_b {
            transcript.b_to_a.push(op.clone());
            let _ = a.task.process_remote_operation(a_port, op);
        }
    }
    transcript
}
