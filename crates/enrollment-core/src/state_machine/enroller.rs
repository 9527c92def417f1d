//! Accepting side of enrollment, run by an existing DIF member.
//!
//! ```text
//! NULL -> [AUTHENTICATING] -> WAIT_START_ENROLLMENT
//!      -> WAIT_STOP_ENROLLMENT_RESPONSE -> ENROLLED
//! ```

use super::{Completion, MachineEnv, Session, Step, abort};
use crate::directory::Neighbor;
use crate::error::{AbortReason, Result};
use crate::messages::{
    EnrollmentInformation, ObjectValue, OperationResult, RemoteOperation, objects,
};
use crate::security::{AuthMessage, AuthPolicy, AuthStatus};
use crate::transport::PortId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollerState {
    Null,
    Authenticating,
    WaitStartEnrollment,
    WaitStopEnrollmentResponse,
    Enrolled,
}

impl EnrollerState {
    pub fn name(&self) -> &'static str {
        match self {
            EnrollerState::Null => "NULL",
            EnrollerState::Authenticating => "AUTHENTICATING",
            EnrollerState::WaitStartEnrollment => "WAIT_START_ENROLLMENT",
            EnrollerState::WaitStopEnrollmentResponse => "WAIT_STOP_ENROLLMENT_RESPONSE",
            EnrollerState::Enrolled => "ENROLLED",
        }
    }
}

pub struct Enroller {
    state: EnrollerState,
    pub(super) session: Session,
    connect_invoke_id: u32,
}

impl Enroller {
    pub(super) fn new(port: PortId) -> Self {
        Self {
            state: EnrollerState::Null,
            session: Session::new(port),
            connect_invoke_id: 0,
        }
    }

    pub fn state(&self) -> EnrollerState {
        self.state
    }

    fn set_state(&mut self, state: EnrollerState) {
        tracing::debug!(
            "Enroller on port {}: {} -> {}",
            self.session.port,
            self.state.name(),
            state.name()
        );
        self.state = state;
    }

    /// Answer the connect with a negative result. The attempt is aborted by the caller.
    fn reject_connect(&self, env: &MachineEnv<'_>, reason: &AbortReason) {
        self.session.send_best_effort(
            env,
            RemoteOperation::OpenConnectionResult {
                result: OperationResult::failure(reason.to_string()),
                auth: None,
                invoke_id: self.connect_invoke_id,
            },
        );
    }

    pub(super) fn connect(
        &mut self,
        peer_name: &str,
        offered: &AuthPolicy,
        invoke_id: u32,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrollerState::Null {
            return Err(abort(AbortReason::ConnectInNotNull));
        }

        let mut peer = env
            .directory
            .get(peer_name)
            .unwrap_or_else(|| Neighbor::new(peer_name));
        peer.underlying_port = Some(self.session.port);
        self.session.peer = peer;
        self.connect_invoke_id = invoke_id;

        let Some(mut authenticator) = env
            .security
            .authenticator_for_offer(offered, self.session.peer.supporting_dif())
        else {
            tracing::warn!(
                "{} offered unsupported authentication policy {}",
                peer_name,
                offered.name
            );
            self.reject_connect(env, &AbortReason::AuthenticationFailed);
            return Err(abort(AbortReason::UnsupportedAuthPolicy));
        };

        let step = authenticator.initiate_authentication(offered);
        self.session.authenticator = Some(authenticator);

        if let Some(reply) = step.reply {
            self.session
                .send(env, RemoteOperation::Auth { message: reply })?;
        }

        match step.status {
            AuthStatus::Failed => {
                self.reject_connect(env, &AbortReason::AuthenticationFailed);
                Err(abort(AbortReason::AuthenticationFailed))
            }
            AuthStatus::InProgress => {
                self.session.arm(env, AbortReason::AuthenticationTimeout);
                self.set_state(EnrollerState::Authenticating);
                Ok(Step::Continue)
            }
            AuthStatus::Successful => self.authentication_successful(env),
        }
    }

    pub(super) fn process_authentication_message(
        &mut self,
        message: &AuthMessage,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrollerState::Authenticating {
            return Err(abort(AbortReason::OutOfOrder));
        }

        let step = match self.session.authenticator.as_mut() {
            Some(authenticator) => authenticator.process_incoming_message(message),
            None => return Err(abort(AbortReason::OutOfOrder)),
        };

        if let Some(reply) = step.reply {
            self.session
                .send(env, RemoteOperation::Auth { message: reply })?;
        }

        match step.status {
            AuthStatus::InProgress => Ok(Step::Continue),
            AuthStatus::Failed => {
                self.session.cancel_timer(env.timers);
                self.reject_connect(env, &AbortReason::AuthenticationFailed);
                Err(abort(AbortReason::AuthenticationFailed))
            }
            AuthStatus::Successful => {
                self.session.cancel_timer(env.timers);
                self.authentication_successful(env)
            }
        }
    }

    fn authentication_successful(&mut self, env: &MachineEnv<'_>) -> Result<Step> {
        if !env.security.is_allowed_to_join(&self.session.peer) {
            tracing::warn!(
                "Security manager rejected enrollment of {}",
                self.session.peer.name
            );
            self.reject_connect(env, &AbortReason::EnrollmentNotAllowed);
            return Err(abort(AbortReason::EnrollmentNotAllowed));
        }

        let descriptor = self.session.authenticator.as_ref().map(|a| a.descriptor());
        self.session.send(
            env,
            RemoteOperation::OpenConnectionResult {
                result: OperationResult::success(),
                auth: descriptor,
                invoke_id: self.connect_invoke_id,
            },
        )?;

        self.session.arm(env, AbortReason::StartEnrollmentTimeout);
        self.set_state(EnrollerState::WaitStartEnrollment);
        Ok(Step::Continue)
    }

    pub(super) fn start(
        &mut self,
        value: Option<ObjectValue>,
        invoke_id: u32,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrollerState::WaitStartEnrollment {
            return Err(abort(AbortReason::StartInBadState));
        }

        self.session.cancel_timer(env.timers);

        let mut info = match value {
            Some(ObjectValue::EnrollmentInfo(info)) => info,
            _ => EnrollmentInformation::default(),
        };
        let peer_name = self.session.peer.name.clone();
        let requires_initialization =
            info.address == 0 || !env.addresses.is_valid_address(info.address, &peer_name);

        for dif in &info.supporting_difs {
            if !self.session.peer.supporting_difs.contains(dif) {
                self.session.peer.supporting_difs.push(dif.clone());
            }
        }

        if requires_initialization {
            match env.addresses.get_valid_address(&peer_name) {
                Some(address) => {
                    tracing::debug!("Assigning address {} to {}", address, peer_name);
                    info.address = address;
                }
                None => {
                    self.session.send_best_effort(
                        env,
                        RemoteOperation::StartResult {
                            object: objects::ENROLLMENT.to_string(),
                            result: OperationResult::failure(
                                AbortReason::AddressUnavailable.to_string(),
                            ),
                            value: None,
                            invoke_id,
                        },
                    );
                    return Err(abort(AbortReason::AddressUnavailable));
                }
            }
        }

        // Only send a value back if the address was (re)assigned
        self.session.send(
            env,
            RemoteOperation::StartResult {
                object: objects::ENROLLMENT.to_string(),
                result: OperationResult::success(),
                value: requires_initialization.then(|| ObjectValue::EnrollmentInfo(info.clone())),
                invoke_id,
            },
        )?;
        self.session.peer.address = info.address;

        if requires_initialization {
            self.send_static_information(env)?;
        }
        self.send_dynamic_information(env)?;

        let stop_info = EnrollmentInformation {
            address: info.address,
            allowed_to_start_early: env.config.grant_early_start,
            supporting_difs: env.local.supporting_difs.clone(),
        };
        let stop_invoke_id = self.session.next_invoke_id();
        self.session.send(
            env,
            RemoteOperation::Stop {
                object: objects::ENROLLMENT.to_string(),
                value: Some(ObjectValue::EnrollmentInfo(stop_info)),
                invoke_id: stop_invoke_id,
            },
        )?;

        self.session
            .arm(env, AbortReason::StopEnrollmentResponseTimeout);
        self.set_state(EnrollerState::WaitStopEnrollmentResponse);
        Ok(Step::Continue)
    }

    /// Objects a new member needs once: naming rules, constants, QoS cubes.
    fn send_static_information(&self, env: &MachineEnv<'_>) -> Result<()> {
        let names = env.directory.whatevercast_names();
        if !names.is_empty() {
            self.session.send(
                env,
                RemoteOperation::create(ObjectValue::WhatevercastNames(names)),
            )?;
        }

        if let Some(constants) = env.directory.data_transfer_constants() {
            self.session.send(
                env,
                RemoteOperation::create(ObjectValue::DataTransferConstants(constants)),
            )?;
        }

        let cubes = env.directory.qos_cubes();
        if !cubes.is_empty() {
            self.session
                .send(env, RemoteOperation::create(ObjectValue::QosCubes(cubes)))?;
        }

        Ok(())
    }

    /// Objects sent on every enrollment: directory entries and the neighbor list.
    fn send_dynamic_information(&self, env: &MachineEnv<'_>) -> Result<()> {
        let entries = env.directory.dft_entries();
        if !entries.is_empty() {
            self.session.send(
                env,
                RemoteOperation::create(ObjectValue::DirectoryEntries(entries)),
            )?;
        }

        let mut neighbors = env.directory.neighbors();
        let mut local = Neighbor::new(env.local.name.clone()).with_address(env.directory.address());
        local.supporting_difs = env.local.supporting_difs.clone();
        neighbors.push(local);

        self.session.send(
            env,
            RemoteOperation::create(ObjectValue::Neighbors(neighbors)),
        )
    }

    pub(super) fn stop_response(
        &mut self,
        result: OperationResult,
        env: &MachineEnv<'_>,
    ) -> Result<Step> {
        if self.state != EnrollerState::WaitStopEnrollmentResponse {
            return Err(abort(AbortReason::StopResponseInBadState));
        }

        self.session.cancel_timer(env.timers);
        if !result.is_success() {
            return Err(abort(AbortReason::PeerRejected(result.reason_or_default())));
        }

        let invoke_id = self.session.next_invoke_id();
        self.session.send(
            env,
            RemoteOperation::Start {
                object: objects::OPERATIONAL_STATUS.to_string(),
                value: None,
                invoke_id,
            },
        )?;

        self.enrollment_completed(env)
    }

    pub(super) fn operational_start_response(&mut self, result: OperationResult) -> Result<Step> {
        if self.state != EnrollerState::Enrolled {
            return Err(abort(AbortReason::StartResponseInBadState));
        }
        if !result.is_success() {
            tracing::warn!(
                "{} answered the operational start with: {}",
                self.session.peer.name,
                result.reason_or_default()
            );
        }
        Ok(Step::Ignored)
    }

    fn enrollment_completed(&mut self, env: &MachineEnv<'_>) -> Result<Step> {
        self.set_state(EnrollerState::Enrolled);

        let peer = &mut self.session.peer;
        peer.enrolled = true;
        peer.underlying_port = Some(self.session.port);
        peer.enrollment_attempts = 0;
        peer.last_heard_from_ms = env.clock.now_ms();
        let stored = env.directory.add_or_update_neighbor(peer.clone());

        tracing::info!(
            "{} (address {}) enrolled through port {}",
            stored.name,
            stored.address,
            self.session.port
        );

        Ok(Step::Enrolled(Completion {
            neighbor: stored,
            enrollee: false,
            first_assignment: false,
            request: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DataTransferConstants, QosCube, WhatevercastName};
    use crate::security::{AUTH_NONE, AUTH_PASSWORD, AllowList, AuthProfile, PasswordAuth};
    use crate::security::Authenticator;
    use crate::state_machine::test_support::*;
    use crate::state_machine::{EnrollmentStateMachine, MachineEvent};
    use std::sync::Arc;

    const PORT: PortId = 6;

    fn connect(machine: &mut EnrollmentStateMachine, fx: &Fixture, policy: &str) -> Result<Step> {
        machine.handle(
            MachineEvent::Connect {
                peer: "a".into(),
                auth: AuthPolicy::new(policy),
                invoke_id: 1,
            },
            &fx.env(),
        )
    }

    fn start(machine: &mut EnrollmentStateMachine, fx: &Fixture, address: u64) -> Result<Step> {
        machine.handle(
            MachineEvent::Start {
                value: Some(ObjectValue::EnrollmentInfo(EnrollmentInformation {
                    address,
                    allowed_to_start_early: false,
                    supporting_difs: vec!["shim".into()],
                })),
                invoke_id: 2,
            },
            &fx.env(),
        )
    }

    fn connect_result(fx: &Fixture) -> OperationResult {
        fx.channel
            .sent()
            .into_iter()
            .find_map(|(_, op)| match op {
                RemoteOperation::OpenConnectionResult { result, .. } => Some(result),
                _ => None,
            })
            .expect("no connect result sent")
    }

    // ==================== Connect ====================

    #[test]
    fn test_connect_without_authentication() {
        let fx = Fixture::new("b");
        let mut machine = EnrollmentStateMachine::enroller(PORT);

        assert_eq!(connect(&mut machine, &fx, AUTH_NONE).unwrap(), Step::Continue);
        assert_eq!(machine.state_name(), "WAIT_START_ENROLLMENT");
        assert!(connect_result(&fx).is_success());
        assert_eq!(fx.timers.armed().len(), 1);
    }

    #[test]
    fn test_connect_with_unknown_policy_is_rejected() {
        let fx = Fixture::new("b");
        let mut machine = EnrollmentStateMachine::enroller(PORT);

        let err = connect(&mut machine, &fx, "PSOC_authentication-ssh2").unwrap_err();
        assert_eq!(reason_of(err), AbortReason::UnsupportedAuthPolicy);
        assert_eq!(
            connect_result(&fx),
            OperationResult::failure("Authentication failed")
        );
    }

    #[test]
    fn test_weaker_offer_than_configured_is_rejected() {
        let mut fx = Fixture::new("b");
        fx.security = crate::security::SecurityManager::new().with_default_profile(AuthProfile {
            policy: AUTH_PASSWORD.into(),
            password: Some("secret".into()),
        });
        let mut machine = EnrollmentStateMachine::enroller(PORT);

        let err = connect(&mut machine, &fx, AUTH_NONE).unwrap_err();
        assert_eq!(reason_of(err), AbortReason::UnsupportedAuthPolicy);
        assert_eq!(
            connect_result(&fx),
            OperationResult::failure("Authentication failed")
        );
        assert!(fx.timers.armed().is_empty());
    }

    #[test]
    fn test_second_connect_aborts() {
        let fx = Fixture::new("b");
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();

        let err = connect(&mut machine, &fx, AUTH_NONE).unwrap_err();
        assert_eq!(reason_of(err), AbortReason::ConnectInNotNull);
    }

    #[test]
    fn test_access_control_refusal() {
        let mut fx = Fixture::new("b");
        fx.security = crate::security::SecurityManager::new()
            .with_access_control(Arc::new(AllowList::new(["someone-else"])));
        let mut machine = EnrollmentStateMachine::enroller(PORT);

        let err = connect(&mut machine, &fx, AUTH_NONE).unwrap_err();
        assert_eq!(reason_of(err), AbortReason::EnrollmentNotAllowed);
        assert!(!connect_result(&fx).is_success());
    }

    // ==================== Authentication ====================

    #[test]
    fn test_password_challenge_round_trip() {
        let mut fx = Fixture::new("b");
        fx.security = crate::security::SecurityManager::new().with_default_profile(AuthProfile {
            policy: AUTH_PASSWORD.into(),
            password: Some("secret".into()),
        });
        let mut machine = EnrollmentStateMachine::enroller(PORT);

        connect(&mut machine, &fx, AUTH_PASSWORD).unwrap();
        assert_eq!(machine.state_name(), "AUTHENTICATING");

        let challenge = match fx.channel.sent().last() {
            Some((_, RemoteOperation::Auth { message })) => message.clone(),
            other => panic!("unexpected {:?}", other),
        };

        let mut joining = PasswordAuth::new("secret");
        let answer = joining
            .process_incoming_message(&challenge)
            .reply
            .expect("answer");

        machine
            .handle(MachineEvent::AuthMessage(answer), &fx.env())
            .unwrap();
        assert_eq!(machine.state_name(), "WAIT_START_ENROLLMENT");
        assert!(connect_result(&fx).is_success());
    }

    #[test]
    fn test_wrong_password_fails() {
        let mut fx = Fixture::new("b");
        fx.security = crate::security::SecurityManager::new().with_default_profile(AuthProfile {
            policy: AUTH_PASSWORD.into(),
            password: Some("secret".into()),
        });
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_PASSWORD).unwrap();

        let challenge = match fx.channel.sent().last() {
            Some((_, RemoteOperation::Auth { message })) => message.clone(),
            other => panic!("unexpected {:?}", other),
        };
        let answer = PasswordAuth::new("guess")
            .process_incoming_message(&challenge)
            .reply
            .expect("answer");

        let err = machine
            .handle(MachineEvent::AuthMessage(answer), &fx.env())
            .unwrap_err();
        assert_eq!(reason_of(err), AbortReason::AuthenticationFailed);
        assert!(fx.timers.armed().is_empty());
    }

    // ==================== Start ====================

    #[test]
    fn test_start_assigns_address_and_pushes_bootstrap() {
        let fx = Fixture::new("b");
        fx.directory.set_address(1);
        fx.directory
            .set_data_transfer_constants(DataTransferConstants::default());
        fx.directory.add_qos_cubes(vec![QosCube::new(1, "reliable")]);
        fx.directory.add_whatevercast_names(vec![WhatevercastName {
            name: "all".into(),
            rule: "members".into(),
            members: vec![],
        }]);

        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();
        assert_eq!(start(&mut machine, &fx, 0).unwrap(), Step::Continue);
        assert_eq!(machine.state_name(), "WAIT_STOP_ENROLLMENT_RESPONSE");

        let kinds: Vec<&str> = fx.channel.sent().iter().map(|(_, op)| op.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "M_CONNECT_R",
                "M_START_R",
                "M_CREATE",
                "M_CREATE",
                "M_CREATE",
                "M_CREATE",
                "M_STOP"
            ]
        );

        let sent = fx.channel.sent();
        match &sent[1].1 {
            RemoteOperation::StartResult {
                value: Some(ObjectValue::EnrollmentInfo(info)),
                ..
            } => assert_eq!(info.address, 2),
            other => panic!("unexpected {:?}", other),
        }
        match &sent[5].1 {
            RemoteOperation::Create {
                value: ObjectValue::Neighbors(list),
                ..
            } => {
                assert!(list.iter().any(|n| n.name == "b" && n.address == 1));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &sent[6].1 {
            RemoteOperation::Stop {
                value: Some(ObjectValue::EnrollmentInfo(info)),
                ..
            } => {
                assert_eq!(info.address, 2);
                assert!(info.allowed_to_start_early);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_start_with_valid_address_skips_static_information() {
        let fx = Fixture::new("b");
        fx.directory.set_address(1);
        fx.directory
            .set_data_transfer_constants(DataTransferConstants::default());

        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();
        start(&mut machine, &fx, 5).unwrap();

        let sent = fx.channel.sent();
        match &sent[1].1 {
            RemoteOperation::StartResult { value, .. } => assert!(value.is_none()),
            other => panic!("unexpected {:?}", other),
        }
        let creates = sent
            .iter()
            .filter(|(_, op)| matches!(op, RemoteOperation::Create { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_start_before_connect_aborts() {
        let fx = Fixture::new("b");
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        let err = start(&mut machine, &fx, 0).unwrap_err();
        assert_eq!(reason_of(err), AbortReason::StartInBadState);
    }

    // ==================== Stop response ====================

    #[test]
    fn test_stop_response_completes() {
        let fx = Fixture::new("b");
        fx.directory.set_address(1);
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();
        start(&mut machine, &fx, 0).unwrap();

        let step = machine
            .handle(
                MachineEvent::StopResponse {
                    result: OperationResult::success(),
                },
                &fx.env(),
            )
            .unwrap();

        match step {
            Step::Enrolled(completion) => {
                assert!(!completion.enrollee);
                assert_eq!(completion.neighbor.name, "a");
                assert_eq!(completion.neighbor.address, 2);
                assert_eq!(completion.neighbor.supporting_difs, vec!["shim".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match fx.channel.sent().last() {
            Some((_, RemoteOperation::Start { object, .. })) => {
                assert_eq!(object, objects::OPERATIONAL_STATUS)
            }
            other => panic!("unexpected {:?}", other),
        }

        let step = machine
            .handle(
                MachineEvent::OperationalStartResponse {
                    result: OperationResult::success(),
                },
                &fx.env(),
            )
            .unwrap();
        assert_eq!(step, Step::Ignored);
    }

    #[test]
    fn test_negative_stop_response_aborts() {
        let fx = Fixture::new("b");
        fx.directory.set_address(1);
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();
        start(&mut machine, &fx, 0).unwrap();

        let err = machine
            .handle(
                MachineEvent::StopResponse {
                    result: OperationResult::failure("Enroller did not allow early start"),
                },
                &fx.env(),
            )
            .unwrap_err();
        assert_eq!(
            reason_of(err),
            AbortReason::PeerRejected("Enroller did not allow early start".into())
        );
    }

    #[test]
    fn test_stop_response_timeout() {
        let fx = Fixture::new("b");
        fx.directory.set_address(1);
        let mut machine = EnrollmentStateMachine::enroller(PORT);
        connect(&mut machine, &fx, AUTH_NONE).unwrap();
        start(&mut machine, &fx, 0).unwrap();

        let id = fx.timers.armed()[0];
        let err = machine
            .handle(MachineEvent::TimerExpired(id), &fx.env())
            .unwrap_err();
        assert_eq!(reason_of(err), AbortReason::StopEnrollmentResponseTimeout);
    }
}
