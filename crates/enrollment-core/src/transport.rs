//! Seams to the layers below the enrollment engine.
//!
//! - [`RemoteOperationChannel`]: sends remote operations on a port
//! - [`FlowAllocator`]: allocates and releases N-1 flows
//! - [`TimerScheduler`]: arms and cancels failure timers
//! - [`Clock`]: wall-clock milliseconds

use crate::messages::RemoteOperation;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

/// Identifier of an N-1 flow and of the remote-operation session on it.
pub type PortId = u32;

/// Port of timers that belong to no flow yet. Allocators never hand it out.
pub const NO_PORT: PortId = 0;

/// Correlates an asynchronous flow allocation with its outcome.
pub type FlowHandle = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(PortId),

    #[error("Flow allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Sends remote operations to the peer on the other end of a port.
///
/// Sends never block on the peer. A response, if any, is delivered later
/// through `EnrollmentTask::process_remote_operation`.
pub trait RemoteOperationChannel: Send + Sync {
    fn send(&self, port: PortId, operation: RemoteOperation) -> Result<()>;
}

/// Allocates N-1 flows toward neighbors.
pub trait FlowAllocator: Send + Sync {
    /// Request a flow to the neighbor.
    ///
    /// The outcome arrives later as `flow_allocated` or `flow_allocation_failed`.
    fn allocate_flow(&self, neighbor: &crate::directory::Neighbor) -> Result<FlowHandle>;

    /// Release the flow. Deallocation is reported back as `flow_deallocated`.
    fn deallocate_flow(&self, port: PortId) -> Result<()>;
}

/// Identifier of one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub port: PortId,
    pub seq: u64,
}

/// Schedules failure timers for state machines.
///
/// An expired timer must be reported as `EnrollmentTask::timer_expired(id)`.
pub trait TimerScheduler: Send + Sync {
    fn schedule(&self, port: PortId, after: Duration) -> TimerId;
    fn cancel(&self, timer: TimerId);
}

/// Wall-clock time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) {
        self.now.fetch_add(by_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1250);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_ms() > 1_600_000_000_000);
    }
}
