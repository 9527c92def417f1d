//! Enrollment state machines.
//!
//! One machine exists per port. Its role is fixed at construction:
//! - [`Enrollee`]: the joining side, which initiates the exchange
//! - [`Enroller`]: the existing member, which answers a connect
//!
//! Machines are driven by [`MachineEvent`]s, protocol callbacks and timer
//! expiries alike, through [`EnrollmentStateMachine::handle`]. They never call
//! back into the coordinator: completion is returned as [`Step::Enrolled`] and
//! any failure as an error that the coordinator turns into an abort.

mod enrollee;
mod enroller;

pub use enrollee::{Enrollee, EnrolleeState};
pub use enroller::{Enroller, EnrollerState};

use crate::addressing::AddressAssigner;
use crate::config::EnrollmentConfig;
use crate::directory::{Neighbor, NeighborDirectory};
use crate::enrollment_task::LocalProcess;
use crate::error::{AbortReason, EnrollmentError, ProtocolFailure, Result};
use crate::messages::{ObjectValue, OperationResult, RemoteOperation};
use crate::request::EnrollmentRequest;
use crate::security::{AuthMessage, AuthPolicy, Authenticator, SecurityManager};
use crate::transport::{Clock, PortId, RemoteOperationChannel, TimerId, TimerScheduler};

/// Everything a machine may touch while handling one event.
pub struct MachineEnv<'a> {
    pub local: &'a LocalProcess,
    pub config: &'a EnrollmentConfig,
    pub directory: &'a NeighborDirectory,
    pub channel: &'a dyn RemoteOperationChannel,
    pub security: &'a SecurityManager,
    pub addresses: &'a dyn AddressAssigner,
    pub timers: &'a dyn TimerScheduler,
    pub clock: &'a dyn Clock,
}

/// Input to a state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// Enrollee: start enrolling over this machine's port.
    InitiateEnrollment(EnrollmentRequest),
    /// Enroller: a peer opened a connection.
    Connect {
        peer: String,
        auth: AuthPolicy,
        invoke_id: u32,
    },
    ConnectResponse {
        result: OperationResult,
    },
    AuthMessage(AuthMessage),
    /// Enroller: start on the enrollment object.
    Start {
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    /// Enrollee: response to its start.
    StartResponse {
        result: OperationResult,
        value: Option<ObjectValue>,
    },
    /// Enrollee: stop on the enrollment object.
    Stop {
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    /// Enroller: response to its stop.
    StopResponse {
        result: OperationResult,
    },
    /// Enrollee: response to a bootstrap read.
    ReadResponse {
        object: String,
        result: OperationResult,
        value: Option<ObjectValue>,
    },
    /// Enrollee: start on the operational-status object.
    OperationalStart {
        invoke_id: u32,
    },
    /// Enroller: response to its operational-status start.
    OperationalStartResponse {
        result: OperationResult,
    },
    TimerExpired(TimerId),
}

impl MachineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::InitiateEnrollment(_) => "InitiateEnrollment",
            MachineEvent::Connect { .. } => "Connect",
            MachineEvent::ConnectResponse { .. } => "ConnectResponse",
            MachineEvent::AuthMessage(_) => "AuthMessage",
            MachineEvent::Start { .. } => "Start",
            MachineEvent::StartResponse { .. } => "StartResponse",
            MachineEvent::Stop { .. } => "Stop",
            MachineEvent::StopResponse { .. } => "StopResponse",
            MachineEvent::ReadResponse { .. } => "ReadResponse",
            MachineEvent::OperationalStart { .. } => "OperationalStart",
            MachineEvent::OperationalStartResponse { .. } => "OperationalStartResponse",
            MachineEvent::TimerExpired(_) => "TimerExpired",
        }
    }
}

/// Outcome of handling an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The machine moved on and is waiting for the next event.
    Continue,
    /// The event did not apply (stale timer, repeated start, terminated machine).
    Ignored,
    Enrolled(Completion),
}

/// A finished enrollment, handed to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Neighbor record as stored in the directory
    pub neighbor: Neighbor,
    pub enrollee: bool,
    /// True if this enrollment made the local process a DIF member
    pub first_assignment: bool,
    pub request: Option<EnrollmentRequest>,
}

/// What remains of a machine torn down from outside.
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub peer: Neighbor,
    pub was_enrolled: bool,
    pub request: Option<EnrollmentRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Enrollee,
    Enroller,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArmedTimer {
    pub id: TimerId,
    pub reason: AbortReason,
}

/// State shared by both roles.
pub(crate) struct Session {
    pub port: PortId,
    pub peer: Neighbor,
    pub timer: Option<ArmedTimer>,
    pub authenticator: Option<Box<dyn Authenticator>>,
    pub terminated: bool,
    next_invoke_id: u32,
}

impl Session {
    fn new(port: PortId) -> Self {
        Self {
            port,
            peer: Neighbor::new(""),
            timer: None,
            authenticator: None,
            terminated: false,
            next_invoke_id: 1,
        }
    }

    pub fn send(&self, env: &MachineEnv<'_>, operation: RemoteOperation) -> Result<()> {
        tracing::debug!(
            "Sending {} to {} on port {}",
            operation.kind(),
            self.peer.name,
            self.port
        );
        env.channel.send(self.port, operation)?;
        Ok(())
    }

    /// Send without aborting on failure. Used for replies on paths that abort anyway.
    pub fn send_best_effort(&self, env: &MachineEnv<'_>, operation: RemoteOperation) {
        if let Err(e) = env.channel.send(self.port, operation) {
            tracing::warn!("Problems sending message to {}: {}", self.peer.name, e);
        }
    }

    /// Arm the failure timer for the next wait state, replacing any armed one.
    pub fn arm(&mut self, env: &MachineEnv<'_>, reason: AbortReason) {
        self.cancel_timer(env.timers);
        let id = env.timers.schedule(self.port, env.config.enroll_timeout());
        self.timer = Some(ArmedTimer { id, reason });
    }

    pub fn cancel_timer(&mut self, timers: &dyn TimerScheduler) {
        if let Some(timer) = self.timer.take() {
            timers.cancel(timer.id);
        }
    }

    pub fn next_invoke_id(&mut self) -> u32 {
        let id = self.next_invoke_id;
        self.next_invoke_id += 1;
        id
    }

    fn timer_expired(&mut self, id: TimerId) -> Result<Step> {
        match &self.timer {
            Some(timer) if timer.id == id => {
                let reason = timer.reason.clone();
                self.timer = None;
                tracing::warn!("{} (peer {}, port {})", reason, self.peer.name, self.port);
                Err(abort(reason))
            }
            _ => Ok(Step::Ignored),
        }
    }
}

/// Error for an aborted attempt. The peer is always sent a release.
pub(crate) fn abort(reason: AbortReason) -> EnrollmentError {
    EnrollmentError::Protocol(ProtocolFailure::new(reason))
}

/// An enrollment state machine in one of its two roles.
pub enum EnrollmentStateMachine {
    Enrollee(Enrollee),
    Enroller(Enroller),
}

impl EnrollmentStateMachine {
    pub fn enrollee(port: PortId) -> Self {
        EnrollmentStateMachine::Enrollee(Enrollee::new(port))
    }

    pub fn enroller(port: PortId) -> Self {
        EnrollmentStateMachine::Enroller(Enroller::new(port))
    }

    fn session(&self) -> &Session {
        match self {
            EnrollmentStateMachine::Enrollee(m) => &m.session,
            EnrollmentStateMachine::Enroller(m) => &m.session,
        }
    }

    fn session_mut(&mut self) -> &mut Session {
        match self {
            EnrollmentStateMachine::Enrollee(m) => &mut m.session,
            EnrollmentStateMachine::Enroller(m) => &mut m.session,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            EnrollmentStateMachine::Enrollee(_) => Role::Enrollee,
            EnrollmentStateMachine::Enroller(_) => Role::Enroller,
        }
    }

    pub fn port(&self) -> PortId {
        self.session().port
    }

    /// Name of the remote peer, empty until bound.
    pub fn peer_name(&self) -> &str {
        &self.session().peer.name
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            EnrollmentStateMachine::Enrollee(m) => m.state().name(),
            EnrollmentStateMachine::Enroller(m) => m.state().name(),
        }
    }

    /// True until the machine has left NULL.
    pub fn is_null(&self) -> bool {
        match self {
            EnrollmentStateMachine::Enrollee(m) => m.state() == EnrolleeState::Null,
            EnrollmentStateMachine::Enroller(m) => m.state() == EnrollerState::Null,
        }
    }

    pub fn is_enrolled(&self) -> bool {
        match self {
            EnrollmentStateMachine::Enrollee(m) => m.state() == EnrolleeState::Enrolled,
            EnrollmentStateMachine::Enroller(m) => m.state() == EnrollerState::Enrolled,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.session().terminated
    }

    /// Whether a failure timer is currently armed.
    pub fn has_armed_timer(&self) -> bool {
        self.session().timer.is_some()
    }

    /// Handle one event. Errors carrying a [`ProtocolFailure`] must be aborted.
    pub fn handle(&mut self, event: MachineEvent, env: &MachineEnv<'_>) -> Result<Step> {
        if self.is_terminated() {
            tracing::debug!(
                "Dropping {} for terminated machine on port {}",
                event.name(),
                self.port()
            );
            return Ok(Step::Ignored);
        }

        match (self, event) {
            (this, MachineEvent::TimerExpired(id)) => this.session_mut().timer_expired(id),

            (EnrollmentStateMachine::Enrollee(m), MachineEvent::InitiateEnrollment(request)) => {
                m.initiate_enrollment(request, env)
            }
            (EnrollmentStateMachine::Enrollee(m), MachineEvent::ConnectResponse { result }) => {
                m.connect_response(result, env)
            }
            (EnrollmentStateMachine::Enrollee(m), MachineEvent::AuthMessage(message)) => {
                m.process_authentication_message(&message, env)
            }
            (EnrollmentStateMachine::Enrollee(m), MachineEvent::StartResponse { result, value }) => {
                m.start_response(result, value, env)
            }
            (EnrollmentStateMachine::Enrollee(m), MachineEvent::Stop { value, invoke_id }) => {
                m.stop(value, invoke_id, env)
            }
            (
                EnrollmentStateMachine::Enrollee(m),
                MachineEvent::ReadResponse {
                    object,
                    result,
                    value,
                },
            ) => m.read_response(&object, result, value, env),
            (EnrollmentStateMachine::Enrollee(m), MachineEvent::OperationalStart { invoke_id }) => {
                m.operational_start(invoke_id, env)
            }

            (
                EnrollmentStateMachine::Enroller(m),
                MachineEvent::Connect {
                    peer,
                    auth,
                    invoke_id,
                },
            ) => m.connect(&peer, &auth, invoke_id, env),
            (EnrollmentStateMachine::Enroller(m), MachineEvent::AuthMessage(message)) => {
                m.process_authentication_message(&message, env)
            }
            (EnrollmentStateMachine::Enroller(m), MachineEvent::Start { value, invoke_id }) => {
                m.start(value, invoke_id, env)
            }
            (EnrollmentStateMachine::Enroller(m), MachineEvent::StopResponse { result }) => {
                m.stop_response(result, env)
            }
            (
                EnrollmentStateMachine::Enroller(m),
                MachineEvent::OperationalStartResponse { result },
            ) => m.operational_start_response(result),

            (this, event) => {
                tracing::error!(
                    "{} is not valid for the {:?} on port {}",
                    event.name(),
                    this.role(),
                    this.port()
                );
                Err(abort(AbortReason::UnexpectedEvent))
            }
        }
    }

    /// Tear the machine down from outside (flow loss, release, abort).
    ///
    /// Cancels the armed timer and hands back the request, if still owned.
    /// Later events are ignored.
    pub fn terminate(&mut self, timers: &dyn TimerScheduler) -> Termination {
        let was_enrolled = self.is_enrolled();
        let request = match self {
            EnrollmentStateMachine::Enrollee(m) => m.take_request(),
            EnrollmentStateMachine::Enroller(_) => None,
        };
        let session = self.session_mut();
        session.cancel_timer(timers);
        session.terminated = true;

        Termination {
            peer: session.peer.clone(),
            was_enrolled,
            request,
        }
    }
}
