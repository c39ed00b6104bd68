//! Connector trait abstraction for pluggable device transports

use async_trait::async_trait;

use crate::models::{CommandRequest, CommandResult};

/// A transport adapter that can execute commands on one device
///
/// Any transport qualifies - a wrapped device-management tool, a network
/// client, or a deterministic test double. Expected faults (rejection,
/// transport failure) travel inside the returned result, not as errors;
/// timeouts are the connector's own responsibility.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Execute the (single-device) request and report its outcome
    async fn execute(&self, request: &CommandRequest) -> CommandResult;

    /// Human-readable name for this transport
    fn name(&self) -> &str;
}

/// Fallback connector used when no transport is registered
///
/// Always completes REJECTED so a device without a binding still yields
/// an auditable per-device result.
pub struct NullConnector;

#[async_trait]
impl DeviceConnector for NullConnector {
    async fn execute(&self, request: &CommandRequest) -> CommandResult {
        let device_id = request
            .device_ids
            .first()
            .map(String::as_str)
            .unwrap_or("unknown");
        CommandResult::rejected(
            &request.request_id,
            device_id,
            "No connector registered for device",
        )
    }

    fn name(&self) -> &str {
        "null"
    }
}
