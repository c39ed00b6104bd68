//! Domain models shared across the control plane
//!
//! These types cross the audit and telemetry boundaries, so everything
//! here carries serde derives and serializes with lowercase enum tags.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last known state of a managed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Fastboot,
    Recovery,
}

/// A managed device known to the connection matrix
///
/// Devices are immutable values; status changes replace the whole value
/// via [`Device::with_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    /// Connection address, e.g. `loopback:dev1` or `tcp:10.0.0.4:5555`
    pub connection_uri: String,
    pub status: DeviceStatus,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Device {
    /// Create a device in the `Unknown` state
    pub fn new(device_id: impl Into<String>, connection_uri: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            connection_uri: connection_uri.into(),
            status: DeviceStatus::Unknown,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Return a copy of this device with a different status
    pub fn with_status(&self, status: DeviceStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Scheduling priority of a command request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A command submitted for dispatch to one or more devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    pub device_ids: Vec<String>,
    pub arguments: BTreeMap<String, String>,
    pub requested_by: String,
    pub priority: CommandPriority,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

impl CommandRequest {
    /// Create a request with a fresh request id
    pub fn new(action: impl Into<String>, device_ids: Vec<String>) -> Self {
        Self {
            action: action.into(),
            device_ids,
            arguments: BTreeMap::new(),
            requested_by: "system".into(),
            priority: CommandPriority::Normal,
            request_id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
        }
    }

    /// Clone this request narrowed to the given device subset
    ///
    /// The request id is preserved so per-device results stay correlated
    /// with the original request.
    pub fn with_devices(&self, device_ids: Vec<String>) -> Self {
        Self {
            device_ids,
            ..self.clone()
        }
    }
}

/// Lifecycle status of a per-device command execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Accepted,
    Running,
    Success,
    Failed,
    Rejected,
}

impl CommandStatus {
    /// True for terminal statuses that indicate the command did not succeed
    pub fn is_failure(&self) -> bool {
        matches!(self, CommandStatus::Failed | CommandStatus::Rejected)
    }
}

/// Outcome of one command execution on one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: String,
    pub device_id: String,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandResult {
    /// Create a result in the `Accepted` state
    pub fn accepted(request_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            device_id: device_id.into(),
            status: CommandStatus::Accepted,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Shorthand for the fast-fail paths that reject without execution
    pub fn rejected(
        request_id: impl Into<String>,
        device_id: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let mut result = Self::accepted(request_id, device_id);
        result.mark_complete(CommandStatus::Rejected, "", stderr, Some(1));
        result
    }

    /// Transition to `Running` and stamp the start time
    pub fn mark_running(&mut self) {
        self.status = CommandStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to a terminal status and stamp the completion time
    pub fn mark_complete(
        &mut self,
        status: CommandStatus,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: Option<i32>,
    ) {
        self.status = status;
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self.exit_code = exit_code;
        self.completed_at = Some(Utc::now());
    }
}

/// Whether a matched rule permits or blocks the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    #[default]
    Allow,
    Deny,
}

/// A policy rule with a sandboxed boolean condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub description: String,
    pub condition: String,
    pub effect: RuleEffect,
    pub tags: Vec<String>,
}

impl PolicyRule {
    pub fn new(name: impl Into<String>, condition: impl Into<String>, effect: RuleEffect) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            condition: condition.into(),
            effect,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Request attributes the policy engine evaluates rules against
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub device_ids: Vec<String>,
    pub action: String,
    pub requested_by: String,
    pub arguments: BTreeMap<String, String>,
}

impl PolicyContext {
    pub fn from_request(request: &CommandRequest) -> Self {
        Self {
            device_ids: request.device_ids.clone(),
            action: request.action.clone(),
            requested_by: request.requested_by.clone(),
            arguments: request.arguments.clone(),
        }
    }
}

/// Outcome of one policy evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reasons: Vec::new(),
        }
    }

    pub fn deny(reasons: Vec<String>) -> Self {
        Self {
            allowed: false,
            reasons,
        }
    }
}

/// One event on the telemetry bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
