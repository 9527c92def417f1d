//! The Enrollment Task: coordinator of all enrollment state machines.
//!
//! Owns the port -> machine table and the table of requests waiting for a
//! flow. Inbound operations, flow lifecycle events and timer expiries are
//! routed to the right machine; a machine's outcome is applied here, so the
//! abort path ([`EnrollmentTask::enrollment_failed`]) and the completion path
//! exist exactly once.
//!
//! Locking: the two table locks are never held while a machine lock is taken
//! or while any collaborator is called. A machine lock is held for one event.

use crate::addressing::AddressAssigner;
use crate::config::EnrollmentConfig;
use crate::directory::{Neighbor, NeighborDirectory};
use crate::error::{AbortReason, EnrollmentError, InternalError, Result};
use crate::events::{EnrollmentEvent, EventBus, EventKind, Subscription};
use crate::messages::{ObjectValue, OperationResult, RemoteOperation, objects};
use crate::request::{EnrollmentRequest, ManagerEnrollRequest, ManagerNotifier};
use crate::security::{AuthPolicy, SecurityManager};
use crate::state_machine::{
    Completion, EnrollmentStateMachine, MachineEnv, MachineEvent, Step, Termination,
};
use crate::transport::{
    Clock, FlowAllocator, FlowHandle, NO_PORT, PortId, RemoteOperationChannel, TimerId,
    TimerScheduler,
};
use crate::watchdog::Watchdog;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationalState {
    NotInitialized,
    Initialized,
    AssignedToDif,
}

/// Identity of the local IPC process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalProcess {
    pub name: String,
    pub dif_name: Option<String>,
    pub supporting_difs: Vec<String>,
    pub operational_state: OperationalState,
}

impl LocalProcess {
    pub fn new(name: impl Into<String>, supporting_difs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            dif_name: None,
            supporting_difs,
            operational_state: OperationalState::Initialized,
        }
    }

    /// Mark the process as assigned to `dif_name`. Enrollment requests need this.
    pub fn assigned_to(mut self, dif_name: impl Into<String>) -> Self {
        self.dif_name = Some(dif_name.into());
        self.operational_state = OperationalState::AssignedToDif;
        self
    }
}

/// Everything the coordinator talks to.
pub struct Collaborators {
    pub channel: Arc<dyn RemoteOperationChannel>,
    pub flows: Arc<dyn FlowAllocator>,
    pub security: Arc<SecurityManager>,
    pub addresses: Arc<dyn AddressAssigner>,
    pub timers: Arc<dyn TimerScheduler>,
    pub clock: Arc<dyn Clock>,
    pub manager: Arc<dyn ManagerNotifier>,
}

type MachineRef = Arc<Mutex<EnrollmentStateMachine>>;

/// A request waiting for its flow, bounded by the enrollment timeout.
struct PendingFlow {
    request: EnrollmentRequest,
    timer: TimerId,
}

pub struct EnrollmentTask {
    local: RwLock<LocalProcess>,
    config: EnrollmentConfig,
    directory: Arc<NeighborDirectory>,
    events: Arc<EventBus>,
    io: Collaborators,
    machines: Mutex<HashMap<PortId, MachineRef>>,
    pending: Mutex<HashMap<FlowHandle, PendingFlow>>,
    watchdog: Watchdog,
    _dead_neighbors: Subscription,
}

impl EnrollmentTask {
    pub fn new(
        local: LocalProcess,
        config: EnrollmentConfig,
        directory: Arc<NeighborDirectory>,
        events: Arc<EventBus>,
        io: Collaborators,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let dead = [EventKind::NeighborDeclaredDead];
            let subscription = events.subscribe_to(&dead, move |event| {
                if let EnrollmentEvent::NeighborDeclaredDead { neighbor } = event {
                    if let Some(task) = weak.upgrade() {
                        task.neighbor_declared_dead(&neighbor);
                    }
                }
            });

            let watchdog = Watchdog::new(
                config.watchdog_period_ms,
                config.declared_dead_interval_ms,
                directory.clone(),
                io.channel.clone(),
                io.clock.clone(),
                events.clone(),
            );

            Self {
                local: RwLock::new(local),
                config,
                directory,
                events,
                io,
                machines: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                watchdog,
                _dead_neighbors: subscription,
            }
        })
    }

    // ==================== Accessors ====================

    pub fn local(&self) -> LocalProcess {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn operational_state(&self) -> OperationalState {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .operational_state
    }

    pub fn config(&self) -> &EnrollmentConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<NeighborDirectory> {
        &self.directory
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn machine_count(&self) -> usize {
        self.machines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The machine on `port`, removed from the table if `remove` is set.
    pub fn get_state_machine(&self, port: PortId, remove: bool) -> Option<MachineRef> {
        let mut machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
        if remove {
            machines.remove(&port)
        } else {
            machines.get(&port).cloned()
        }
    }

    /// True if a machine for `name` has left NULL (enrolling or enrolled).
    pub fn is_enrolled_to(&self, name: &str) -> bool {
        self.machine_status(name).is_some()
    }

    /// Some(true) if enrolled to `name`, Some(false) if an enrollment is in flight.
    fn machine_status(&self, name: &str) -> Option<bool> {
        let machines: Vec<MachineRef> = self
            .machines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut in_flight = None;
        for machine in machines {
            let machine = machine.lock().unwrap_or_else(|e| e.into_inner());
            if machine.is_terminated() || machine.is_null() || machine.peer_name() != name {
                continue;
            }
            if machine.is_enrolled() {
                return Some(true);
            }
            in_flight = Some(false);
        }
        in_flight
    }

    fn is_pending(&self, name: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|p| p.request.neighbor.name == name)
    }

    fn port_of(&self, name: &str) -> Option<PortId> {
        let machines: Vec<(PortId, MachineRef)> = self
            .machines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(port, m)| (*port, m.clone()))
            .collect();

        machines.into_iter().find_map(|(port, machine)| {
            let machine = machine.lock().unwrap_or_else(|e| e.into_inner());
            (machine.peer_name() == name).then_some(port)
        })
    }

    // ==================== Requests ====================

    /// Entry point for enrollment requests from the IPC manager.
    pub fn process_enrollment_request(&self, request: ManagerEnrollRequest) -> Result<()> {
        let local = self.local();
        let refusal = if local.operational_state != OperationalState::AssignedToDif {
            Some(InternalError::NotAssignedToDif)
        } else if local.dif_name.as_deref() != Some(request.dif_name.as_str()) {
            Some(InternalError::DifMismatch {
                requested: request.dif_name.clone(),
                local: local.dif_name.clone().unwrap_or_default(),
            })
        } else {
            None
        };
        if let Some(err) = refusal {
            warn!("Rejecting enrollment request {}: {}", request.correlation_id, err);
            self.io
                .manager
                .enrollment_result(request.correlation_id, Err(err.to_string()));
            return Err(err.into());
        }

        let name = if request.neighbor_name.is_empty() {
            request.dif_name.clone()
        } else {
            request.neighbor_name.clone()
        };
        let mut neighbor = self
            .directory
            .get(&name)
            .unwrap_or_else(|| Neighbor::new(name));
        neighbor.supporting_difs.retain(|d| d != &request.supporting_dif);
        neighbor.supporting_difs.insert(0, request.supporting_dif.clone());

        self.initiate_enrollment(EnrollmentRequest::from_manager(
            neighbor,
            request.correlation_id,
        ))
    }

    /// Request a flow to the neighbor. Enrollment starts once it is allocated.
    pub fn initiate_enrollment(&self, request: EnrollmentRequest) -> Result<()> {
        let name = request.neighbor.name.clone();
        let refusal = match self.machine_status(&name) {
            Some(true) => Some(InternalError::AlreadyEnrolled(name.clone())),
            Some(false) => Some(InternalError::EnrollmentInProgress(name.clone())),
            None if self.is_pending(&name) => Some(InternalError::EnrollmentInProgress(name.clone())),
            None => None,
        };
        if let Some(err) = refusal {
            warn!("Not enrolling to {}: {}", name, err);
            self.report_failure(&request, err.to_string());
            return Err(err.into());
        }

        match self.io.flows.allocate_flow(&request.neighbor) {
            Ok(handle) => {
                debug!("Requested flow {} to {}", handle, name);
                let timer = self.io.timers.schedule(NO_PORT, self.config.enroll_timeout());
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(handle, PendingFlow { request, timer });
                Ok(())
            }
            Err(e) => {
                let err = InternalError::FlowAllocation(e.to_string());
                warn!("Could not request a flow to {}: {}", name, e);
                self.report_failure(&request, err.to_string());
                Err(err.into())
            }
        }
    }

    fn report_failure(&self, request: &EnrollmentRequest, reason: String) {
        match request.correlation_id() {
            Some(id) => self.io.manager.enrollment_result(id, Err(reason)),
            None => debug!(
                "Background enrollment to {} failed: {}",
                request.neighbor.name, reason
            ),
        }
    }

    // ==================== Flow lifecycle ====================

    /// Remove the request waiting on `handle` and stop its timer.
    fn take_pending(&self, handle: FlowHandle) -> Option<EnrollmentRequest> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)?;
        self.io.timers.cancel(pending.timer);
        Some(pending.request)
    }

    pub fn flow_allocated(&self, handle: FlowHandle, port: PortId) -> Result<()> {
        let Some(request) = self.take_pending(handle) else {
            warn!("Flow {} allocated on port {} but no request is waiting", handle, port);
            if let Err(e) = self.io.flows.deallocate_flow(port) {
                warn!("Problems deallocating flow on port {}: {}", port, e);
            }
            return Ok(());
        };

        {
            let mut machines = self.machines.lock().unwrap_or_else(|e| e.into_inner());
            if machines.contains_key(&port) {
                drop(machines);
                let err = InternalError::MachineExists(port);
                error!("{}", err);
                self.report_failure(&request, err.to_string());
                return Err(err.into());
            }
            machines.insert(
                port,
                Arc::new(Mutex::new(EnrollmentStateMachine::enrollee(port))),
            );
        }

        debug!("Flow to {} allocated on port {}", request.neighbor.name, port);
        self.dispatch(port, MachineEvent::InitiateEnrollment(request))
    }

    pub fn flow_allocation_failed(&self, handle: FlowHandle, reason: &str) {
        match self.take_pending(handle) {
            Some(request) => {
                warn!(
                    "Flow allocation to {} failed: {}",
                    request.neighbor.name, reason
                );
                self.report_failure(&request, format!("Flow allocation failed: {}", reason));
            }
            None => debug!("Allocation failure for unknown flow {}", handle),
        }
    }

    /// The N-1 flow is gone. Nothing more is sent on the port.
    pub fn flow_deallocated(&self, port: PortId) {
        match self.tear_down(port, AbortReason::FlowDeallocated) {
            Some(termination) => debug!(
                "Flow to {} on port {} deallocated",
                termination.peer.name, port
            ),
            None => debug!("Flow on port {} deallocated, no state machine", port),
        }
    }

    /// Remove and terminate the machine on `port` after an external event.
    ///
    /// An enrolled neighbor loses its enrolled flag and connectivity-lost is
    /// emitted. An attempt still in flight is reported failed, and if the flow
    /// itself is gone connectivity-lost follows the failure.
    fn tear_down(&self, port: PortId, reason: AbortReason) -> Option<Termination> {
        let machine = self.get_state_machine(port, true)?;
        let termination = machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminate(self.io.timers.as_ref());

        if termination.was_enrolled {
            if self.directory.set_unenrolled(&termination.peer.name) {
                let neighbor = self
                    .directory
                    .get(&termination.peer.name)
                    .unwrap_or_else(|| termination.peer.clone());
                info!("Lost connectivity to {}", neighbor.name);
                self.events
                    .emit(EnrollmentEvent::ConnectivityToNeighborLost { neighbor });
            }
        } else {
            warn!(
                "Enrollment with {} on port {} cancelled: {}",
                termination.peer.name, port, reason
            );
            if let Some(request) = &termination.request {
                self.report_failure(request, reason.to_string());
            }
            self.io.addresses.release_address(&termination.peer.name);
            self.events.emit(EnrollmentEvent::EnrollmentFailed {
                name: termination.peer.name.clone(),
                port,
                reason: reason.to_string(),
            });

            if reason == AbortReason::FlowDeallocated {
                self.directory.set_unenrolled(&termination.peer.name);
                let neighbor = self
                    .directory
                    .get(&termination.peer.name)
                    .unwrap_or_else(|| termination.peer.clone());
                self.events
                    .emit(EnrollmentEvent::ConnectivityToNeighborLost { neighbor });
            }
        }

        Some(termination)
    }

    // ==================== Remote operations ====================

    /// Route an operation received on `port`.
    pub fn process_remote_operation(&self, port: PortId, operation: RemoteOperation) -> Result<()> {
        debug!("Received {} on port {}", operation.kind(), port);

        let event = match operation {
            RemoteOperation::OpenConnection {
                src,
                auth,
                invoke_id,
                ..
            } => return self.connect(port, src, auth, invoke_id),
            RemoteOperation::CloseConnection => {
                self.release(port);
                return Ok(());
            }
            RemoteOperation::Read { object, invoke_id } => {
                if object == objects::WATCHDOG {
                    self.watchdog.remote_probe(port, invoke_id);
                } else {
                    self.serve_read(port, &object, invoke_id);
                }
                return Ok(());
            }
            RemoteOperation::ReadResult { object, result, .. } if object == objects::WATCHDOG => {
                match self.directory.get_by_port(port) {
                    Some(neighbor) => self.watchdog.probe_response(&neighbor.name, &result),
                    None => debug!("Watchdog response on port {} from unknown neighbor", port),
                }
                return Ok(());
            }
            RemoteOperation::Create { value, .. } => {
                self.commit_create(port, value);
                return Ok(());
            }

            RemoteOperation::OpenConnectionResult { result, .. } => {
                MachineEvent::ConnectResponse { result }
            }
            RemoteOperation::Auth { message } => MachineEvent::AuthMessage(message),
            RemoteOperation::Start {
                object, invoke_id, ..
            } if object == objects::OPERATIONAL_STATUS => MachineEvent::OperationalStart { invoke_id },
            RemoteOperation::Start {
                value, invoke_id, ..
            } => MachineEvent::Start { value, invoke_id },
            RemoteOperation::StartResult { object, result, .. }
                if object == objects::OPERATIONAL_STATUS =>
            {
                MachineEvent::OperationalStartResponse { result }
            }
            RemoteOperation::StartResult { result, value, .. } => {
                MachineEvent::StartResponse { result, value }
            }
            RemoteOperation::Stop {
                value, invoke_id, ..
            } => MachineEvent::Stop { value, invoke_id },
            RemoteOperation::StopResult { result, .. } => MachineEvent::StopResponse { result },
            RemoteOperation::ReadResult {
                object,
                result,
                value,
                ..
            } => MachineEvent::ReadResponse {
                object,
                result,
                value,
            },
        };

        self.dispatch(port, event)
    }

    fn connect(&self, port: PortId, src: String, auth: AuthPolicy, invoke_id: u32) -> Result<()> {
        if self.is_enrolled_to(&src) {
            warn!("Rejecting connect from {}: already enrolled", src);
            let reply = RemoteOperation::OpenConnectionResult {
                result: OperationResult::failure("Already enrolled"),
                auth: None,
                invoke_id,
            };
            if let Err(e) = self.io.channel.send(port, reply) {
                debug!("Could not answer {}: {}", src, e);
            }
            if let Err(e) = self.io.flows.deallocate_flow(port) {
                warn!("Problems deallocating flow on port {}: {}", port, e);
            }
            return Ok(());
        }

        self.machines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(port)
            .or_insert_with(|| Arc::new(Mutex::new(EnrollmentStateMachine::enroller(port))));

        self.dispatch(
            port,
            MachineEvent::Connect {
                peer: src,
                auth,
                invoke_id,
            },
        )
    }

    /// The peer closed the connection.
    fn release(&self, port: PortId) {
        if let Some(termination) = self.tear_down(port, AbortReason::Released) {
            info!("{} released the connection on port {}", termination.peer.name, port);
            if let Err(e) = self.io.flows.deallocate_flow(port) {
                warn!("Problems deallocating flow on port {}: {}", port, e);
            }
        }
    }

    fn serve_read(&self, port: PortId, object: &str, invoke_id: u32) {
        let value = match object {
            objects::DATA_TRANSFER_CONSTANTS => self
                .directory
                .data_transfer_constants()
                .map(ObjectValue::DataTransferConstants),
            objects::QOS_CUBES => {
                let cubes = self.directory.qos_cubes();
                (!cubes.is_empty()).then_some(ObjectValue::QosCubes(cubes))
            }
            objects::NEIGHBORS => Some(ObjectValue::Neighbors(self.neighbors_with_self())),
            objects::DIRECTORY_FORWARDING_TABLE => {
                let entries = self.directory.dft_entries();
                (!entries.is_empty()).then_some(ObjectValue::DirectoryEntries(entries))
            }
            objects::WHATEVERCAST_NAMES => {
                let names = self.directory.whatevercast_names();
                (!names.is_empty()).then_some(ObjectValue::WhatevercastNames(names))
            }
            objects::ADDRESS => Some(ObjectValue::Address(self.directory.address())),
            _ => None,
        };

        let result = if value.is_some() {
            OperationResult::success()
        } else {
            OperationResult::failure(format!("Object {} not available", object))
        };
        let reply = RemoteOperation::ReadResult {
            object: object.to_string(),
            result,
            value,
            invoke_id,
        };
        if let Err(e) = self.io.channel.send(port, reply) {
            warn!("Problems answering read of {} on port {}: {}", object, port, e);
        }
    }

    fn neighbors_with_self(&self) -> Vec<Neighbor> {
        let local = self.local();
        let mut neighbors = self.directory.neighbors();
        let mut me = Neighbor::new(local.name).with_address(self.directory.address());
        me.supporting_difs = local.supporting_difs;
        neighbors.push(me);
        neighbors
    }

    fn commit_create(&self, port: PortId, value: ObjectValue) {
        match value {
            ObjectValue::Neighbors(list) => {
                let local = self.local();
                let added =
                    self.directory
                        .create_neighbors(list, &local.name, &local.supporting_difs);
                for neighbor in added {
                    debug!("Learned about neighbor {}", neighbor.name);
                }
            }
            ObjectValue::DataTransferConstants(constants) => {
                self.directory.set_data_transfer_constants(constants)
            }
            ObjectValue::QosCubes(cubes) => self.directory.add_qos_cubes(cubes),
            ObjectValue::DirectoryEntries(entries) => self.directory.add_dft_entries(entries),
            ObjectValue::WhatevercastNames(names) => self.directory.add_whatevercast_names(names),
            ObjectValue::Address(new_address) => {
                let Some(neighbor) = self.directory.get_by_port(port) else {
                    debug!("Address update on port {} from unknown neighbor", port);
                    return;
                };
                if let Some(old_address) =
                    self.directory.update_neighbor_address(&neighbor.name, new_address)
                {
                    if old_address != new_address {
                        info!(
                            "{} changed address from {} to {}",
                            neighbor.name, old_address, new_address
                        );
                        self.events.emit(EnrollmentEvent::NeighborAddressChanged {
                            name: neighbor.name,
                            old_address,
                            new_address,
                        });
                    }
                }
            }
            ObjectValue::EnrollmentInfo(_) => {
                warn!("Ignoring create of enrollment information on port {}", port)
            }
        }
    }

    // ==================== Machine events ====================

    pub fn timer_expired(&self, id: TimerId) -> Result<()> {
        if self.expire_pending(id) {
            return Ok(());
        }
        if self.get_state_machine(id.port, false).is_none() {
            debug!("Timer for port {} fired after teardown", id.port);
            return Ok(());
        }
        self.dispatch(id.port, MachineEvent::TimerExpired(id))
    }

    /// Give up on a flow request whose allocation outlived the enrollment timeout.
    fn expire_pending(&self, id: TimerId) -> bool {
        let expired = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let handle = pending
                .iter()
                .find_map(|(handle, p)| (p.timer == id).then_some(*handle));
            handle.and_then(|h| pending.remove(&h))
        };
        let Some(expired) = expired else {
            return false;
        };

        let reason = AbortReason::FlowAllocationTimeout;
        warn!("Enrollment to {} failed: {}", expired.request.neighbor.name, reason);
        self.report_failure(&expired.request, reason.to_string());
        true
    }

    fn dispatch(&self, port: PortId, event: MachineEvent) -> Result<()> {
        let Some(machine) = self.get_state_machine(port, false) else {
            warn!("No enrollment state machine for port {}, dropping {}", port, event.name());
            return Err(InternalError::UnknownPort(port).into());
        };

        let local = self.local();
        let env = MachineEnv {
            local: &local,
            config: &self.config,
            directory: self.directory.as_ref(),
            channel: self.io.channel.as_ref(),
            security: self.io.security.as_ref(),
            addresses: self.io.addresses.as_ref(),
            timers: self.io.timers.as_ref(),
            clock: self.io.clock.as_ref(),
        };

        let (outcome, peer) = {
            let mut machine = machine.lock().unwrap_or_else(|e| e.into_inner());
            let outcome = machine.handle(event, &env);
            (outcome, machine.peer_name().to_string())
        };

        match outcome {
            Ok(Step::Continue) | Ok(Step::Ignored) => Ok(()),
            Ok(Step::Enrolled(completion)) => {
                self.enrollment_completed(completion);
                Ok(())
            }
            Err(EnrollmentError::Protocol(failure)) => {
                self.enrollment_failed(&peer, port, &failure.reason, failure.send_release);
                Ok(())
            }
            Err(err) => {
                error!("Enrollment on port {}: {}", port, err);
                Err(err)
            }
        }
    }

    /// Abort the attempt on `port`.
    ///
    /// Removes and terminates the machine, reports an in-flight request once,
    /// optionally sends a release and deallocates the flow.
    pub fn enrollment_failed(
        &self,
        name: &str,
        port: PortId,
        reason: &AbortReason,
        send_release: bool,
    ) {
        error!("Enrollment with {} on port {} failed: {}", name, port, reason);

        let Some(machine) = self.get_state_machine(port, true) else {
            warn!("No enrollment state machine for port {}", port);
            return;
        };
        let termination = machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminate(self.io.timers.as_ref());

        if let Some(request) = &termination.request {
            self.report_failure(request, reason.to_string());
        }
        if !termination.was_enrolled {
            self.io.addresses.release_address(name);
        }
        if termination.was_enrolled && self.directory.set_unenrolled(name) {
            let neighbor = self
                .directory
                .get(name)
                .unwrap_or_else(|| termination.peer.clone());
            self.events
                .emit(EnrollmentEvent::ConnectivityToNeighborLost { neighbor });
        }
        self.events.emit(EnrollmentEvent::EnrollmentFailed {
            name: name.to_string(),
            port,
            reason: reason.to_string(),
        });

        if send_release {
            if let Err(e) = self.io.channel.send(port, RemoteOperation::CloseConnection) {
                debug!("Could not send release to {}: {}", name, e);
            }
        }
        if let Err(e) = self.io.flows.deallocate_flow(port) {
            warn!("Problems deallocating flow on port {}: {}", port, e);
        }
    }

    fn enrollment_completed(&self, completion: Completion) {
        let Completion {
            neighbor,
            enrollee,
            first_assignment,
            request,
        } = completion;

        self.events.emit(EnrollmentEvent::NeighborAdded {
            neighbor: neighbor.clone(),
            enrollee,
        });

        if let Some(id) = request.as_ref().and_then(EnrollmentRequest::correlation_id) {
            self.io.manager.enrollment_result(id, Ok(neighbor));
        }

        if first_assignment {
            self.local
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .operational_state = OperationalState::AssignedToDif;
            let address = self.directory.address();
            info!("Joined the DIF with address {}", address);
            self.events.emit(EnrollmentEvent::AssignedToDif { address });
        }
    }

    // ==================== Neighbors ====================

    /// One pass of the background enroller.
    ///
    /// Retries every known neighbor that is neither enrolled nor being
    /// enrolled, and drops those that ran out of attempts.
    pub fn enroll_neighbors(&self) {
        if self.operational_state() != OperationalState::AssignedToDif {
            return;
        }

        for neighbor in self.directory.neighbors() {
            if neighbor.enrolled
                || self.is_enrolled_to(&neighbor.name)
                || self.is_pending(&neighbor.name)
            {
                continue;
            }

            if neighbor.enrollment_attempts >= self.config.max_enrollment_retries {
                info!(
                    "Giving up on {} after {} enrollment attempts",
                    neighbor.name, neighbor.enrollment_attempts
                );
                self.directory.remove_neighbor(&neighbor.name);
                self.io.addresses.release_address(&neighbor.name);
                continue;
            }

            self.directory.increment_enrollment_attempts(&neighbor.name);
            debug!("Retrying enrollment to {}", neighbor.name);
            let _ = self.initiate_enrollment(EnrollmentRequest::background(neighbor));
        }
    }

    /// Release the connection to a neighbor and forget that we were enrolled.
    ///
    /// Returns false if there was nothing to disconnect.
    pub fn disconnect_neighbor(&self, name: &str) -> bool {
        let port = self
            .port_of(name)
            .or_else(|| self.directory.get(name).and_then(|n| n.underlying_port));
        let Some(port) = port else {
            return false;
        };

        info!("Disconnecting from {} on port {}", name, port);
        if let Err(e) = self.io.channel.send(port, RemoteOperation::CloseConnection) {
            debug!("Could not send release to {}: {}", name, e);
        }
        self.tear_down(port, AbortReason::Released);
        self.directory.set_unenrolled(name);
        if let Err(e) = self.io.flows.deallocate_flow(port) {
            warn!("Problems deallocating flow on port {}: {}", port, e);
        }
        true
    }

    /// Take a new local address and announce it on every enrollment session.
    ///
    /// Returns the number of peers the new address was sent to.
    pub fn change_address(&self, new_address: u64) -> usize {
        let old_address = self.directory.address();
        self.directory.set_address(new_address);
        info!("Local address changed from {} to {}", old_address, new_address);

        let mut ports: Vec<PortId> = self
            .machines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ports.sort_unstable();

        let mut announced = 0;
        for port in ports {
            let update = RemoteOperation::create(ObjectValue::Address(new_address));
            match self.io.channel.send(port, update) {
                Ok(()) => announced += 1,
                Err(e) => warn!("Problems announcing address on port {}: {}", port, e),
            }
        }
        announced
    }

    /// Drop the flow to a neighbor the watchdog gave up on.
    pub fn neighbor_declared_dead(&self, neighbor: &Neighbor) {
        let port = self
            .directory
            .get(&neighbor.name)
            .and_then(|n| n.underlying_port);
        match port {
            Some(port) => {
                warn!("{} declared dead, deallocating port {}", neighbor.name, port);
                if let Err(e) = self.io.flows.deallocate_flow(port) {
                    warn!("Problems deallocating flow on port {}: {}", port, e);
                }
            }
            None => debug!("{} declared dead but has no flow", neighbor.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::EnrollmentInformation;
    use crate::security::AUTH_NONE;
    use crate::testing::TestNode;
    use std::time::Duration;

    fn member(name: &str) -> TestNode {
        TestNode::new(
            LocalProcess::new(name, vec!["shim".into()]).assigned_to("normal.DIF"),
            EnrollmentConfig::default(),
        )
    }

    fn manager_request(id: u64, neighbor: &str) -> ManagerEnrollRequest {
        ManagerEnrollRequest {
            correlation_id: id,
            dif_name: "normal.DIF".into(),
            supporting_dif: "shim".into(),
            neighbor_name: neighbor.into(),
        }
    }

    /// Play a joining `peer` up to its start request. Returns the address it was given.
    fn connect_and_start(node: &TestNode, port: PortId, peer: &str) -> Option<u64> {
        node.task
            .process_remote_operation(
                port,
                RemoteOperation::OpenConnection {
                    src: peer.into(),
                    dest: "b".into(),
                    auth: AuthPolicy::new(AUTH_NONE),
                    invoke_id: 1,
                },
            )
            .unwrap();
        node.task
            .process_remote_operation(
                port,
                RemoteOperation::Start {
                    object: objects::ENROLLMENT.into(),
                    value: Some(ObjectValue::EnrollmentInfo(EnrollmentInformation {
                        address: 0,
                        allowed_to_start_early: false,
                        supporting_difs: vec!["shim".into()],
                    })),
                    invoke_id: 2,
                },
            )
            .unwrap();

        node.channel
            .sent_on(port)
            .into_iter()
            .find_map(|op| match op {
                RemoteOperation::StartResult {
                    value: Some(ObjectValue::EnrollmentInfo(info)),
                    ..
                } => Some(info.address),
                _ => None,
            })
    }

    // ==================== Requests ====================

    #[test]
    fn test_request_rejected_when_not_assigned() {
        let node = TestNode::new(
            LocalProcess::new("a", vec!["shim".into()]),
            EnrollmentConfig::default(),
        );

        let err = node
            .task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap_err();
        assert_eq!(err, EnrollmentError::from(InternalError::NotAssignedToDif));
        assert_eq!(node.notifier.failures_for(1).len(), 1);
        assert!(node.flows.allocations().is_empty());
    }

    #[test]
    fn test_request_rejected_for_other_dif() {
        let node = member("a");
        let mut request = manager_request(1, "b");
        request.dif_name = "other.DIF".into();

        assert!(node.task.process_enrollment_request(request).is_err());
        assert_eq!(node.notifier.failures_for(1).len(), 1);
    }

    #[test]
    fn test_request_allocates_flow() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();

        let allocations = node.flows.allocations();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].1.name, "b");
        assert_eq!(allocations[0].1.supporting_difs, vec!["shim".to_string()]);
        assert_eq!(node.task.pending_count(), 1);
        assert!(!node.directory.contains("b"));
    }

    #[test]
    fn test_duplicate_request_is_refused() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();

        let err = node
            .task
            .process_enrollment_request(manager_request(2, "b"))
            .unwrap_err();
        assert_eq!(
            err,
            EnrollmentError::from(InternalError::EnrollmentInProgress("b".into()))
        );
        assert_eq!(node.notifier.failures_for(2).len(), 1);
        assert!(node.notifier.failures_for(1).is_empty());
    }

    #[test]
    fn test_synchronous_allocation_failure_is_reported() {
        let node = member("a");
        node.flows.set_failing(true);

        assert!(node
            .task
            .process_enrollment_request(manager_request(1, "b"))
            .is_err());
        assert_eq!(node.notifier.failures_for(1).len(), 1);
        assert_eq!(node.task.pending_count(), 0);
    }

    // ==================== Flow lifecycle ====================

    #[test]
    fn test_flow_allocated_starts_enrollee() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        let handle = node.flows.allocations()[0].0;

        node.task.flow_allocated(handle, 10).unwrap();
        assert_eq!(node.task.machine_count(), 1);
        assert_eq!(node.task.pending_count(), 0);
        assert!(node.task.is_enrolled_to("b"));
        assert!(matches!(
            node.channel.sent_on(10).first(),
            Some(RemoteOperation::OpenConnection { .. })
        ));
    }

    #[test]
    fn test_flow_allocation_failure_reports_once() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        let handle = node.flows.allocations()[0].0;

        node.task.flow_allocation_failed(handle, "no route");
        node.task.flow_allocation_failed(handle, "no route");
        assert_eq!(
            node.notifier.failures_for(1),
            vec!["Flow allocation failed: no route".to_string()]
        );
    }

    #[test]
    fn test_flow_request_times_out() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        let timer = node.timers.armed_on(NO_PORT).expect("allocation timer armed");
        assert_eq!(node.timers.duration_of(timer), Some(Duration::from_secs(10)));

        node.task.timer_expired(timer).unwrap();
        assert_eq!(
            node.notifier.failures_for(1),
            vec!["Timeout waiting for flow allocation".to_string()]
        );
        assert_eq!(node.task.pending_count(), 0);

        // A flow that shows up afterwards is handed back
        let handle = node.flows.allocations()[0].0;
        node.task.flow_allocated(handle, 10).unwrap();
        assert_eq!(node.task.machine_count(), 0);
        assert_eq!(node.flows.deallocated(), vec![10]);
        assert_eq!(node.notifier.results().len(), 1);
    }

    #[test]
    fn test_allocation_outcome_stops_timer() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        node.task
            .process_enrollment_request(manager_request(2, "c"))
            .unwrap();
        let allocations = node.flows.allocations();

        node.task.flow_allocated(allocations[0].0, 10).unwrap();
        node.task.flow_allocation_failed(allocations[1].0, "no route");
        assert!(node.timers.armed_on(NO_PORT).is_none());
    }

    #[test]
    fn test_flow_loss_in_flight_loses_connectivity() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        let handle = node.flows.allocations()[0].0;
        node.task.flow_allocated(handle, 10).unwrap();
        node.channel.clear();

        node.task.flow_deallocated(10);

        assert_eq!(
            node.notifier.failures_for(1),
            vec!["Underlying flow deallocated".to_string()]
        );
        let kinds: Vec<EventKind> = node.events_seen().iter().map(EnrollmentEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::EnrollmentFailed, EventKind::ConnectivityToNeighborLost]
        );
        assert!(node.channel.sent().is_empty());
        assert!(node.flows.deallocated().is_empty());
    }

    #[test]
    fn test_unknown_port_is_dropped() {
        let node = member("a");
        let err = node
            .task
            .process_remote_operation(
                42,
                RemoteOperation::StopResult {
                    object: objects::ENROLLMENT.into(),
                    result: OperationResult::success(),
                    invoke_id: 1,
                },
            )
            .unwrap_err();
        assert_eq!(err, EnrollmentError::from(InternalError::UnknownPort(42)));
        assert!(node.channel.sent().is_empty());
    }

    // ==================== Abort funnel ====================

    #[test]
    fn test_enrollment_failed_runs_once() {
        let node = member("a");
        node.task
            .process_enrollment_request(manager_request(1, "b"))
            .unwrap();
        let handle = node.flows.allocations()[0].0;
        node.task.flow_allocated(handle, 10).unwrap();

        node.task
            .enrollment_failed("b", 10, &AbortReason::ConnectResponseTimeout, true);
        node.task
            .enrollment_failed("b", 10, &AbortReason::ConnectResponseTimeout, true);

        assert_eq!(
            node.notifier.failures_for(1),
            vec!["Timeout waiting for connect response".to_string()]
        );
        assert_eq!(node.flows.deallocated(), vec![10]);
        assert!(matches!(
            node.channel.sent_on(10).last(),
            Some(RemoteOperation::CloseConnection)
        ));
        assert!(node.timers.armed().is_empty());
        assert_eq!(node.task.machine_count(), 0);
    }

    // ==================== Reads and creates ====================

    #[test]
    fn test_serves_bootstrap_reads() {
        let node = member("b");
        node.directory.set_address(3);

        node.task
            .process_remote_operation(
                5,
                RemoteOperation::Read {
                    object: objects::QOS_CUBES.into(),
                    invoke_id: 8,
                },
            )
            .unwrap();
        node.task
            .process_remote_operation(
                5,
                RemoteOperation::Read {
                    object: objects::NEIGHBORS.into(),
                    invoke_id: 9,
                },
            )
            .unwrap();

        let sent = node.channel.sent_on(5);
        match &sent[0] {
            RemoteOperation::ReadResult { result, value, .. } => {
                assert!(!result.is_success());
                assert!(value.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match &sent[1] {
            RemoteOperation::ReadResult {
                value: Some(ObjectValue::Neighbors(list)),
                invoke_id,
                ..
            } => {
                assert_eq!(*invoke_id, 9);
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].name, "b");
                assert_eq!(list[0].address, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_create_neighbors_skips_self_and_foreign_difs() {
        let node = member("a");
        node.task
            .process_remote_operation(
                5,
                RemoteOperation::create(ObjectValue::Neighbors(vec![
                    Neighbor::new("a").with_supporting_dif("shim"),
                    Neighbor::new("c").with_supporting_dif("shim").with_address(4),
                    Neighbor::new("d").with_supporting_dif("elsewhere"),
                ])),
            )
            .unwrap();

        assert!(!node.directory.contains("a"));
        assert_eq!(node.directory.get("c").map(|n| n.address), Some(4));
        assert!(!node.directory.contains("d"));
    }

    #[test]
    fn test_address_change_is_announced() {
        let node = member("a");
        let mut neighbor = Neighbor::new("c").with_address(4);
        neighbor.enrolled = true;
        neighbor.underlying_port = Some(5);
        node.directory.add_neighbor(neighbor);

        node.task
            .process_remote_operation(5, RemoteOperation::create(ObjectValue::Address(9)))
            .unwrap();

        assert_eq!(node.directory.get("c").map(|n| n.address), Some(9));
        assert!(node.events_seen().contains(&EnrollmentEvent::NeighborAddressChanged {
            name: "c".into(),
            old_address: 4,
            new_address: 9,
        }));
    }

    // ==================== Addresses ====================

    #[test]
    fn test_aborted_enrollment_frees_assigned_address() {
        let node = member("b");
        node.directory.set_address(1);

        assert_eq!(connect_and_start(&node, 20, "a"), Some(2));
        node.task
            .enrollment_failed("a", 20, &AbortReason::StopEnrollmentResponseTimeout, true);

        assert_eq!(connect_and_start(&node, 21, "c"), Some(2));
    }

    #[test]
    fn test_change_address_is_sent_on_every_session() {
        let node = member("b");
        node.directory.set_address(1);
        connect_and_start(&node, 20, "a");
        connect_and_start(&node, 21, "c");
        node.channel.clear();

        assert_eq!(node.task.change_address(5), 2);
        assert_eq!(node.directory.address(), 5);
        for port in [20, 21] {
            assert_eq!(
                node.channel.sent_on(port),
                vec![RemoteOperation::create(ObjectValue::Address(5))]
            );
        }
    }

    // ==================== Background enroller ====================

    #[test]
    fn test_enroll_neighbors_retries_then_drops() {
        let mut config = EnrollmentConfig::default();
        config.max_enrollment_retries = 2;
        let node = TestNode::new(
            LocalProcess::new("a", vec!["shim".into()]).assigned_to("normal.DIF"),
            config,
        );
        node.directory
            .add_neighbor(Neighbor::new("c").with_supporting_dif("shim"));

        for _ in 0..2 {
            node.task.enroll_neighbors();
            let handle = node.flows.allocations().last().map(|a| a.0).unwrap();
            node.task.flow_allocation_failed(handle, "unreachable");
        }
        assert_eq!(node.flows.allocations().len(), 2);
        assert!(node.directory.contains("c"));

        node.task.enroll_neighbors();
        assert_eq!(node.flows.allocations().len(), 2);
        assert!(!node.directory.contains("c"));
        assert!(node.notifier.results().is_empty());
    }

    #[test]
    fn test_enroll_neighbors_skips_in_flight() {
        let node = member("a");
        node.directory
            .add_neighbor(Neighbor::new("c").with_supporting_dif("shim"));

        node.task.enroll_neighbors();
        node.task.enroll_neighbors();
        assert_eq!(node.flows.allocations().len(), 1);
        assert_eq!(node.directory.get("c").map(|n| n.enrollment_attempts), Some(1));
    }

    #[test]
    fn test_declared_dead_deallocates_flow() {
        let node = member("a");
        let mut neighbor = Neighbor::new("c");
        neighbor.enrolled = true;
        neighbor.underlying_port = Some(12);
        node.directory.add_neighbor(neighbor.clone());

        node.events
            .emit(EnrollmentEvent::NeighborDeclaredDead { neighbor });
        assert_eq!(node.flows.deallocated(), vec![12]);
    }
}
