//! Error types for enrollment.
//!
//! Two classes are kept apart:
//! - [`ProtocolFailure`]: an expected failure of an enrollment attempt (timeout,
//!   negative response, bad state, authentication). Drives the abort path.
//! - [`InternalError`]: a precondition violation by the caller. Never aborts a
//!   peer session on its own; it is logged and returned.

use crate::transport::{PortId, TransportError};
use std::fmt;
use thiserror::Error;

/// Named reason an enrollment attempt was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    ConnectResponseTimeout,
    StartResponseTimeout,
    StopEnrollmentTimeout,
    ReadResponseTimeout,
    StartTimeout,
    StartEnrollmentTimeout,
    StopEnrollmentResponseTimeout,
    AuthenticationTimeout,
    FlowAllocationTimeout,
    StartInBadState,
    StartResponseInBadState,
    StopInBadState,
    StopWithNoObjectValue,
    StopResponseInBadState,
    ReadResponseInBadState,
    UnsuccessfulReadResponse,
    ConnectInNotNull,
    EnrollmentNotAllowed,
    AuthenticationFailed,
    UnsupportedAuthPolicy,
    OutOfOrder,
    EarlyStartWithheld,
    AddressUnavailable,
    UnexpectedEvent,
    /// Negative result from the peer, carrying its reason.
    PeerRejected(String),
    SendFailed(String),
    FlowDeallocated,
    Released,
}

impl AbortReason {
    /// True for reasons raised by an expired timer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            AbortReason::ConnectResponseTimeout
                | AbortReason::StartResponseTimeout
                | AbortReason::StopEnrollmentTimeout
                | AbortReason::ReadResponseTimeout
                | AbortReason::StartTimeout
                | AbortReason::StartEnrollmentTimeout
                | AbortReason::StopEnrollmentResponseTimeout
                | AbortReason::AuthenticationTimeout
                | AbortReason::FlowAllocationTimeout
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::ConnectResponseTimeout => "Timeout waiting for connect response",
            AbortReason::StartResponseTimeout => "Timeout waiting for start response",
            AbortReason::StopEnrollmentTimeout => "Timeout waiting for stop enrolment response",
            AbortReason::ReadResponseTimeout => "Timeout waiting for read response",
            AbortReason::StartTimeout => "Timeout waiting for start",
            AbortReason::StartEnrollmentTimeout => "Timeout waiting for start enrollment request",
            AbortReason::StopEnrollmentResponseTimeout => {
                "Timeout waiting for stop enrollment response"
            }
            AbortReason::AuthenticationTimeout => "Timeout waiting for authentication to complete",
            AbortReason::FlowAllocationTimeout => "Timeout waiting for flow allocation",
            AbortReason::StartInBadState => "Received a START message in a wrong state",
            AbortReason::StartResponseInBadState => {
                "Received a START_RESPONSE message in a wrong state"
            }
            AbortReason::StopInBadState => "Received a STOP message in a wrong state",
            AbortReason::StopWithNoObjectValue => "Received STOP message with null object value",
            AbortReason::StopResponseInBadState => {
                "Received a STOP Response message in a wrong state"
            }
            AbortReason::ReadResponseInBadState => {
                "Received a READ_RESPONSE message in a wrong state"
            }
            AbortReason::UnsuccessfulReadResponse => {
                "Received an unsuccessful read response or a read response with a null object value"
            }
            AbortReason::ConnectInNotNull => "Received a CONNECT message while not in NULL state",
            AbortReason::EnrollmentNotAllowed => "Enrollment rejected by security manager",
            AbortReason::AuthenticationFailed => "Authentication failed",
            AbortReason::UnsupportedAuthPolicy => "Unsupported authentication policy set",
            AbortReason::OutOfOrder => "Message received in wrong order",
            AbortReason::EarlyStartWithheld => "Enroller did not allow early start",
            AbortReason::AddressUnavailable => "Could not assign a valid address",
            AbortReason::UnexpectedEvent => {
                "Received an operation that does not apply to this role"
            }
            AbortReason::PeerRejected(reason) => return f.write_str(reason),
            AbortReason::SendFailed(reason) => {
                return write!(f, "Problems sending message: {}", reason);
            }
            AbortReason::FlowDeallocated => "Underlying flow deallocated",
            AbortReason::Released => "Connection released by peer",
        };
        f.write_str(text)
    }
}

/// A failed enrollment attempt. Handled by the coordinator's abort path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ProtocolFailure {
    pub reason: AbortReason,
    /// Whether the peer should be sent a close-connection before the flow is released.
    pub send_release: bool,
}

impl ProtocolFailure {
    pub fn new(reason: AbortReason) -> Self {
        Self {
            reason,
            send_release: true,
        }
    }
}

impl From<TransportError> for ProtocolFailure {
    fn from(err: TransportError) -> Self {
        ProtocolFailure::new(AbortReason::SendFailed(err.to_string()))
    }
}

/// Precondition violations. These indicate a caller bug, not a peer problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("A state machine already exists for port {0}")]
    MachineExists(PortId),

    #[error("No state machine for port {0}")]
    UnknownPort(PortId),

    #[error("Enrollment can only be initiated from the NULL state (current: {0})")]
    NotInNullState(&'static str),

    #[error("Already enrolled to {0}")]
    AlreadyEnrolled(String),

    #[error("Enrollment to {0} already in progress")]
    EnrollmentInProgress(String),

    #[error("Process is not assigned to a DIF")]
    NotAssignedToDif,

    #[error("Requested DIF {requested} does not match local DIF {local}")]
    DifMismatch { requested: String, local: String },

    #[error("Flow allocation failed: {0}")]
    FlowAllocation(String),
}

/// Any error returned by the enrollment engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrollmentError {
    #[error(transparent)]
    Protocol(#[from] ProtocolFailure),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl From<AbortReason> for EnrollmentError {
    fn from(reason: AbortReason) -> Self {
        EnrollmentError::Protocol(ProtocolFailure::new(reason))
    }
}

impl From<TransportError> for EnrollmentError {
    fn from(err: TransportError) -> Self {
        EnrollmentError::Protocol(err.into())
    }
}

pub type Result<T> = std::result::Result<T, EnrollmentError>;
