//! Joining side of enrollment.
//!
//! ```text
//! NULL -> WAIT_CONNECT_RESPONSE -> WAIT_START_ENROLLMENT_RESPONSE
//!      -> WAIT_STOP_ENROLLMENT_RESPONSE -> [WAIT_READ_RESPONSE]* -> [WAIT_START]
//!      -> ENROLLED
//! ```
//!
//! Authentication rounds, if the policy has any, are exchanged while waiting
//! for the connect response.

use super::{MachineEnv, Session, Step, abort};
use crate::error::{AbortReason, InternalError, Result};
use crate::messages::{
    EnrollmentInformation, ObjectValue, OperationResult, RemoteOperation, objects,
};
use crate::request::EnrollmentRequest;
use crate::security::{AuthMessage, AuthStatus};
use crate::state_machine::Completion;
use crate::transport::PortId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrolleeState {
    Null,
    WaitConnectResponse,
    WaitStartEnrollmentResponse,
    WaitStopEnrollmentResponse,
    WaitReadResponse,
    WaitStart,
    Enrolled,
}

impl EnrolleeState {
    pub fn name(&self) -> &'static str {
        match self {
            EnrolleeState::Null => "NULL",
            EnrolleeState::WaitConnectResponse => "WAIT_CONNECT_RESPONSE",
            EnrolleeState::WaitStartEnrollmentResponse => "WAIT_START_ENROLLMENT_RESPONSE",
            EnrolleeState::WaitStopEnrollmentResponse => "WAIT_STOP_ENROLLMENT_RESPONSE",
            EnrolleeState::WaitReadResponse => "WAIT_READ_RESPONSE",
            EnrolleeState::WaitStart => "WAIT_START",
            EnrolleeState::Enrolled => "ENROLLED",
        }
    }
}

pub struct Enrollee {
    state: EnrolleeState,
    pub(super) session: Session,
    request: Option<EnrollmentRequest>,
    /// Whether the local process had an address before this enrollment
    was_dif_member: bool,
    allowed_to_start_early: bool,
    stop_invoke_id: u32,
    pending_read: Option<&'static str>,
}

impl Enrollee {
    pub(super) fn new(port: PortId) -> Self {
        Self {
            state: EnrolleeState::Null,
            session: Session::new(port),
            request: None,
            was_dif_member: false,
            allowed_to_start_early: false,
            stop_invoke_id: 0,
            pending_read: None,
        }
    }

    pub fn state(&self) -> EnrolleeState {
        self.state
    }

    pub(super) fn take_request(&mut self) -> Option<EnrollmentRequest> {
        self.request.take()
    }

    fn set_state(&mut self, state: EnrolleeState) {
        tracing::debug!(
            "Enrollee on port {}: {} -> {}",
            self.session.port,
            self.state.name(),
            state.name()
        );
        self.state = state;
    }

    pub(super) fn initiate_enrollment(
        &mut self,
        request: EnrollmentRequest,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::Null {
            return Err(InternalError::NotInNullState(self.state.name()).into());
        }

        let mut peer = request.neighbor.clone();
        peer.underlying_port = Some(self.session.port);
        self.session.peer = peer;
        self.request = Some(request);

        let Some(authenticator) = env
            .security
            .authenticator_for(self.session.peer.supporting_dif())
        else {
            return Err(abort(AbortReason::UnsupportedAuthPolicy));
        };
        let descriptor = authenticator.descriptor();
        self.session.authenticator = Some(authenticator);

        let invoke_id = self.session.next_invoke_id();
        self.session.send(
            env,
            RemoteOperation::OpenConnection {
                src: env.local.name.clone(),
                dest: self.session.peer.name.clone(),
                auth: descriptor,
                invoke_id,
            },
        )?;

        self.session.arm(env, AbortReason::ConnectResponseTimeout);
        self.set_state(EnrolleeState::WaitConnectResponse);
        Ok(Step::Continue)
    }

    pub(super) fn process_authentication_message(
        &mut self,
        message: &AuthMessage,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::WaitConnectResponse {
            return Err(abort(AbortReason::OutOfOrder));
        }

        let step = match self.session.authenticator.as_mut() {
            Some(authenticator) => authenticator.process_incoming_message(message),
            None => return Err(abort(AbortReason::UnsupportedAuthPolicy)),
        };

        if let Some(reply) = step.reply {
            self.session
                .send(env, RemoteOperation::Auth { message: reply })?;
        }

        match step.status {
            AuthStatus::Failed => Err(abort(AbortReason::AuthenticationFailed)),
            _ => Ok(Step::Continue),
        }
    }

    pub(super) fn connect_response(
        &mut self,
        result: OperationResult,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::WaitConnectResponse {
            return Err(abort(AbortReason::OutOfOrder));
        }

        self.session.cancel_timer(env.timers);
        if !result.is_success() {
            return Err(abort(AbortReason::PeerRejected(result.reason_or_default())));
        }

        let address = env.directory.address();
        self.was_dif_member = address != 0;

        let info = EnrollmentInformation {
            address,
            allowed_to_start_early: false,
            supporting_difs: env.local.supporting_difs.clone(),
        };
        let invoke_id = self.session.next_invoke_id();
        self.session.send(
            env,
            RemoteOperation::Start {
                object: objects::ENROLLMENT.to_string(),
                value: Some(ObjectValue::EnrollmentInfo(info)),
                invoke_id,
            },
        )?;

        self.session.arm(env, AbortReason::StartResponseTimeout);
        self.set_state(EnrolleeState::WaitStartEnrollmentResponse);
        Ok(Step::Continue)
    }

    pub(super) fn start_response(
        &mut self,
        result: OperationResult,
        value: Option<ObjectValue>,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::WaitStartEnrollmentResponse {
            return Err(abort(AbortReason::StartResponseInBadState));
        }

        self.session.cancel_timer(env.timers);
        if !result.is_success() {
            return Err(abort(AbortReason::PeerRejected(result.reason_or_default())));
        }

        // A value means the enroller assigned us an address
        if let Some(ObjectValue::EnrollmentInfo(info)) = value {
            if info.address != 0 {
                tracing::info!(
                    "Address {} assigned by {}",
                    info.address,
                    self.session.peer.name
                );
                env.directory.set_address(info.address);
            }
        }

        self.session.arm(env, AbortReason::StopEnrollmentTimeout);
        self.set_state(EnrolleeState::WaitStopEnrollmentResponse);
        Ok(Step::Continue)
    }

    pub(super) fn stop(
        &mut self,
        value: Option<ObjectValue>,
        invoke_id: u32,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::WaitStopEnrollmentResponse {
            return Err(abort(AbortReason::StopInBadState));
        }

        self.session.cancel_timer(env.timers);
        let Some(ObjectValue::EnrollmentInfo(info)) = value else {
            return Err(abort(AbortReason::StopWithNoObjectValue));
        };

        self.allowed_to_start_early = info.allowed_to_start_early;
        self.stop_invoke_id = invoke_id;

        if !self.allowed_to_start_early && env.config.abort_without_early_start {
            self.session.send_best_effort(
                env,
                RemoteOperation::StopResult {
                    object: objects::ENROLLMENT.to_string(),
                    result: OperationResult::failure(AbortReason::EarlyStartWithheld.to_string()),
                    invoke_id,
                },
            );
            return Err(abort(AbortReason::EarlyStartWithheld));
        }

        self.request_more_information_or_start(env)
    }

    /// Read the next missing bootstrap object, or finish the stop exchange.
    fn request_more_information_or_start(&mut self, env: &MachineEnv<'_>) -> Result<Step> {
        if let Some(object) = next_missing_object(env) {
            let invoke_id = self.session.next_invoke_id();
            self.session.send(
                env,
                RemoteOperation::Read {
                    object: object.to_string(),
                    invoke_id,
                },
            )?;
            self.pending_read = Some(object);
            self.session.arm(env, AbortReason::ReadResponseTimeout);
            self.set_state(EnrolleeState::WaitReadResponse);
            return Ok(Step::Continue);
        }

        self.session.send(
            env,
            RemoteOperation::StopResult {
                object: objects::ENROLLMENT.to_string(),
                result: OperationResult::success(),
                invoke_id: self.stop_invoke_id,
            },
        )?;

        if self.allowed_to_start_early {
            return self.enrollment_completed(env);
        }

        self.session.arm(env, AbortReason::StartTimeout);
        self.set_state(EnrolleeState::WaitStart);
        Ok(Step::Continue)
    }

    pub(super) fn read_response(
        &mut self,
        object: &str,
        result: OperationResult,
        value: Option<ObjectValue>,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrolleeState::WaitReadResponse {
            return Err(abort(AbortReason::ReadResponseInBadState));
        }

        self.session.cancel_timer(env.timers);
        let expected = self.pending_read.take();
        if !result.is_success() || expected != Some(object) {
            return Err(abort(AbortReason::UnsuccessfulReadResponse));
        }

        match value {
            Some(ObjectValue::DataTransferConstants(constants))
                if object == objects::DATA_TRANSFER_CONSTANTS =>
            {
                env.directory.set_data_transfer_constants(constants);
            }
            Some(ObjectValue::QosCubes(cubes))
                if object == objects::QOS_CUBES && !cubes.is_empty() =>
            {
                env.directory.add_qos_cubes(cubes);
            }
            Some(ObjectValue::Neighbors(list))
                if object == objects::NEIGHBORS && !list.is_empty() =>
            {
                for mut neighbor in list {
                    if neighbor.name == env.local.name {
                        continue;
                    }
                    if neighbor.name == self.session.peer.name && neighbor.address != 0 {
                        self.session.peer.address = neighbor.address;
                    }
                    neighbor.enrolled = false;
                    neighbor.underlying_port = None;
                    neighbor.enrollment_attempts = 0;
                    neighbor.last_heard_from_ms = 0;
                    env.directory.add_neighbor(neighbor);
                }
            }
            _ => return Err(abort(AbortReason::UnsuccessfulReadResponse)),
        }

        self.request_more_information_or_start(env)
    }

    pub(super) fn operational_start(
        &mut self,
        invoke_id: u32,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state == EnrolleeState::Enrolled {
            tracing::debug!(
                "Already operational, ignoring start from {}",
                self.session.peer.name
            );
            return Ok(Step::Ignored);
        }
        if self.state != EnrolleeState::WaitStart {
            return Err(abort(AbortReason::StartInBadState));
        }

        self.session.cancel_timer(env.timers);
        self.session.send(
            env,
            RemoteOperation::StartResult {
                object: objects::OPERATIONAL_STATUS.to_string(),
                result: OperationResult::success(),
                value: None,
                invoke_id,
            },
        )?;

        self.enrollment_completed(env)
    }

    fn enrollment_completed(&mut self, env: &MachineEnv<'_>) -> Result<Step> {
        self.set_state(EnrolleeState::Enrolled);

        let peer = &mut self.session.peer;
        if peer.address == 0 {
            if let Some(known) = env.directory.get(&peer.name) {
                peer.address = known.address;
            }
        }
        peer.enrolled = true;
        peer.underlying_port = Some(self.session.port);
        peer.enrollment_attempts = 0;
        peer.last_heard_from_ms = env.clock.now_ms();
        let stored = env.directory.add_or_update_neighbor(peer.clone());

        let entries = env.directory.dft_entries();
        if !entries.is_empty() {
            self.session.send_best_effort(
                env,
                RemoteOperation::create(ObjectValue::DirectoryEntries(entries)),
            );
        }

        tracing::info!(
            "Enrolled to {} (address {}) on port {}",
            stored.name,
            stored.address,
            self.session.port
        );

        Ok(Step::Enrolled(Completion {
            neighbor: stored,
            enrollee: true,
            first_assignment: !self.was_dif_member,
            request: self.request.take(),
        }))
    }
}

/// Bootstrap objects are requested in this order until all are present.
fn next_missing_object(env: &MachineEnv<'_>) -> Option<&'static str> {
    if env.directory.data_transfer_constants().is_none() {
        Some(objects::DATA_TRANSFER_CONSTANTS)
    } else if env.directory.qos_cubes().is_empty() {
        Some(objects::QOS_CUBES)
    } else if env.directory.neighbor_count() == 0 {
        Some(objects::NEIGHBORS)
    } else {
        None
    }
}
