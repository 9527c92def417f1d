//! Enrollment requests and the IPC-manager-facing seam.

use crate::directory::Neighbor;
use serde::{Deserialize, Serialize};

/// Who asked for an enrollment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestOrigin {
    /// The IPC manager. Gets exactly one response.
    Manager { correlation_id: u64 },
    /// The background neighbors enroller. Failures are only logged.
    Background,
}

/// Trigger for one enrollment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRequest {
    pub neighbor: Neighbor,
    pub origin: RequestOrigin,
}

impl EnrollmentRequest {
    pub fn from_manager(neighbor: Neighbor, correlation_id: u64) -> Self {
        Self {
            neighbor,
            origin: RequestOrigin::Manager { correlation_id },
        }
    }

    pub fn background(neighbor: Neighbor) -> Self {
        Self {
            neighbor,
            origin: RequestOrigin::Background,
        }
    }

    pub fn correlation_id(&self) -> Option<u64> {
        match self.origin {
            RequestOrigin::Manager { correlation_id } => Some(correlation_id),
            RequestOrigin::Background => None,
        }
    }
}

/// Enrollment request as received from the IPC manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerEnrollRequest {
    pub correlation_id: u64,
    /// DIF the neighbor is a member of
    pub dif_name: String,
    /// N-1 DIF to reach the neighbor through
    pub supporting_dif: String,
    /// Neighbor to enroll to. Empty means any member of `dif_name`.
    #[serde(default)]
    pub neighbor_name: String,
}

/// Receives the outcome of manager-initiated enrollments.
pub trait ManagerNotifier: Send + Sync {
    fn enrollment_result(&self, correlation_id: u64, result: Result<Neighbor, String>);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl ManagerNotifier for LoggingNotifier {
    fn enrollment_result(&self, correlation_id: u64, result: Result<Neighbor, String>) {
        match result {
            Ok(neighbor) => tracing::info!(
                "Enrollment request {} succeeded: enrolled to {}",
                correlation_id,
                neighbor.name
            ),
            Err(reason) => {
                tracing::warn!("Enrollment request {} failed: {}", correlation_id, reason)
            }
        }
    }
}
