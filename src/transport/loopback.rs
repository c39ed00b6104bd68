//! Loopback connector that echoes commands
//!
//! Deterministic stand-in used by tests and the demo binary.

use async_trait::async_trait;

use super::traits::DeviceConnector;
use crate::models::{CommandRequest, CommandResult, CommandStatus};

/// Connector that completes every command locally with an echo
pub struct LoopbackConnector;

#[async_trait]
impl DeviceConnector for LoopbackConnector {
    async fn execute(&self, request: &CommandRequest) -> CommandResult {
        let device_id = request
            .device_ids
            .first()
            .map(String::as_str)
            .unwrap_or("unknown");
        let mut result = CommandResult::accepted(&request.request_id, device_id);
        result.mark_running();
        result.mark_complete(
            CommandStatus::Success,
            format!("loopback:{}:{}", device_id, request.action),
            "",
            Some(0),
        );
        result
    }

    fn name(&self) -> &str {
        "loopback"
    }
}
