//! enrollment-core: enrollment of IPC processes into a DIF.
//!
//! This crate provides the runtime-free part of enrollment:
//! - Enrollee and enroller state machines driven by remote operations
//! - The Enrollment Task, which owns the machines and the retry loop step
//! - A watchdog that probes enrolled neighbors
//! - The neighbor directory, security policies and address assignment
//!
//! Timers, flows and message delivery are reached through the traits in
//! [`transport`]; a runtime supplies them.

pub mod addressing;
pub mod config;
pub mod directory;
pub mod enrollment_task;
pub mod error;
pub mod events;
pub mod messages;
pub mod request;
pub mod security;
pub mod state_machine;
pub mod testing;
pub mod transport;
pub mod watchdog;

pub use addressing::{AddressAssigner, RangeAddressAssigner};
pub use config::{ConfigError, EnrollmentConfig};
pub use directory::{Neighbor, NeighborDirectory};
pub use enrollment_task::{Collaborators, EnrollmentTask, LocalProcess, OperationalState};
pub use error::{AbortReason, EnrollmentError, InternalError, ProtocolFailure};
pub use events::{EnrollmentEvent, EventBus, EventKind, Subscription};
pub use messages::{ObjectValue, OperationResult, RemoteOperation, objects};
pub use request::{EnrollmentRequest, LoggingNotifier, ManagerEnrollRequest, ManagerNotifier};
pub use security::{AuthProfile, SecurityManager};
pub use state_machine::{EnrollmentStateMachine, MachineEvent, Step};
pub use transport::{
    Clock, FlowAllocator, FlowHandle, NO_PORT, PortId, RemoteOperationChannel, SystemClock,
    TimerId, TimerScheduler, TransportError,
};
pub use watchdog::Watchdog;
