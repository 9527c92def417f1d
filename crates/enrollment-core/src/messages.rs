//! Remote operations and the payloads exchanged during enrollment.
//!
//! Operations address objects by name (see [`objects`]) and carry an
//! optional [`ObjectValue`]. JSON helpers exist for transports that need a
//! byte encoding.

use crate::directory::Neighbor;
use crate::security::{AuthMessage, AuthPolicy};
use serde::{Deserialize, Serialize};

/// Names of the objects touched by enrollment and the watchdog.
pub mod objects {
    pub const ENROLLMENT: &str = "/difm/enr";
    pub const NEIGHBORS: &str = "/difManagement/enrollment/neighbors";
    pub const WATCHDOG: &str = "/difManagement/enrollment/watchdog";
    pub const OPERATIONAL_STATUS: &str = "/difManagement/opstatus";
    pub const DATA_TRANSFER_CONSTANTS: &str = "/dt";
    pub const QOS_CUBES: &str = "/resalloc/qoscubes";
    pub const DIRECTORY_FORWARDING_TABLE: &str = "/difm/nsm/dft";
    pub const WHATEVERCAST_NAMES: &str = "/difm/nsm/whatnms";
    pub const ADDRESS: &str = "/difManagement/naming/address";
}

/// Outcome of a remote operation. Code 0 is success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OperationResult {
    pub fn success() -> Self {
        Self {
            code: 0,
            reason: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            code: -1,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Reason text for a failed result.
    pub fn reason_or_default(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("Operation failed with code {}", self.code))
    }
}

/// Information exchanged on the enrollment object (start and stop).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentInformation {
    /// Candidate or assigned address. 0 means unset.
    pub address: u64,
    #[serde(default)]
    pub allowed_to_start_early: bool,
    #[serde(default)]
    pub supporting_difs: Vec<String>,
}

/// Data-transfer constants shared by every member of a DIF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferConstants {
    pub address_length: u16,
    pub cep_id_length: u16,
    pub length_length: u16,
    pub port_id_length: u16,
    pub qos_id_length: u16,
    pub sequence_number_length: u16,
    pub max_pdu_size: u32,
    pub max_pdu_lifetime_ms: u32,
    #[serde(default)]
    pub dif_integrity: bool,
}

impl Default for DataTransferConstants {
    fn default() -> Self {
        Self {
            address_length: 2,
            cep_id_length: 2,
            length_length: 2,
            port_id_length: 2,
            qos_id_length: 1,
            sequence_number_length: 4,
            max_pdu_size: 10000,
            max_pdu_lifetime_ms: 60000,
            dif_integrity: false,
        }
    }
}

/// A class of service offered by the DIF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosCube {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub average_bandwidth: u64,
    #[serde(default)]
    pub delay_ms: u32,
    #[serde(default)]
    pub jitter_ms: u32,
    #[serde(default)]
    pub max_allowable_gap: i32,
    #[serde(default)]
    pub ordered_delivery: bool,
    #[serde(default)]
    pub partial_delivery: bool,
}

impl QosCube {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            average_bandwidth: 0,
            delay_ms: 0,
            jitter_ms: 0,
            max_allowable_gap: -1,
            ordered_delivery: false,
            partial_delivery: true,
        }
    }
}

/// Maps an application name to the address of the process serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryForwardingEntry {
    pub application_name: String,
    pub address: u64,
    #[serde(default)]
    pub seq_number: u64,
}

/// A naming rule resolving one name to a set of members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatevercastName {
    pub name: String,
    pub rule: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Payload carried by a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum ObjectValue {
    EnrollmentInfo(EnrollmentInformation),
    DataTransferConstants(DataTransferConstants),
    QosCubes(Vec<QosCube>),
    Neighbors(Vec<Neighbor>),
    DirectoryEntries(Vec<DirectoryForwardingEntry>),
    WhatevercastNames(Vec<WhatevercastName>),
    Address(u64),
}

impl ObjectValue {
    /// Name of the object this payload belongs to.
    pub fn object_name(&self) -> &'static str {
        match self {
            ObjectValue::EnrollmentInfo(_) => objects::ENROLLMENT,
            ObjectValue::DataTransferConstants(_) => objects::DATA_TRANSFER_CONSTANTS,
            ObjectValue::QosCubes(_) => objects::QOS_CUBES,
            ObjectValue::Neighbors(_) => objects::NEIGHBORS,
            ObjectValue::DirectoryEntries(_) => objects::DIRECTORY_FORWARDING_TABLE,
            ObjectValue::WhatevercastNames(_) => objects::WHATEVERCAST_NAMES,
            ObjectValue::Address(_) => objects::ADDRESS,
        }
    }
}

/// A remote operation sent on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RemoteOperation {
    #[serde(rename_all = "camelCase")]
    OpenConnection {
        src: String,
        dest: String,
        auth: AuthPolicy,
        invoke_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    OpenConnectionResult {
        result: OperationResult,
        #[serde(default)]
        auth: Option<AuthPolicy>,
        invoke_id: u32,
    },
    Auth {
        message: AuthMessage,
    },
    CloseConnection,
    #[serde(rename_all = "camelCase")]
    Start {
        object: String,
        #[serde(default)]
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    StartResult {
        object: String,
        result: OperationResult,
        #[serde(default)]
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        object: String,
        #[serde(default)]
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    StopResult {
        object: String,
        result: OperationResult,
        invoke_id: u32,
    },
    #[serde(rename_all = "camelCase")]
    Read { object: String, invoke_id: u32 },
    #[serde(rename_all = "camelCase")]
    ReadResult {
        object: String,
        result: OperationResult,
        #[serde(default)]
        value: Option<ObjectValue>,
        invoke_id: u32,
    },
    Create { object: String, value: ObjectValue },
}

impl RemoteOperation {
    /// Short operation name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteOperation::OpenConnection { .. } => "M_CONNECT",
            RemoteOperation::OpenConnectionResult { .. } => "M_CONNECT_R",
            RemoteOperation::Auth { .. } => "M_AUTH",
            RemoteOperation::CloseConnection => "M_RELEASE",
            RemoteOperation::Start { .. } => "M_START",
            RemoteOperation::StartResult { .. } => "M_START_R",
            RemoteOperation::Stop { .. } => "M_STOP",
            RemoteOperation::StopResult { .. } => "M_STOP_R",
            RemoteOperation::Read { .. } => "M_READ",
            RemoteOperation::ReadResult { .. } => "M_READ_R",
            RemoteOperation::Create { .. } => "M_CREATE",
        }
    }

    /// Create operation for an object payload.
    pub fn create(value: ObjectValue) -> Self {
        RemoteOperation::Create {
            object: value.object_name().to_string(),
            value,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
