//! Connection matrix - registry of devices and their transport connectors

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit::AuditLog;
use crate::models::{CommandRequest, CommandResult, Device};
use crate::telemetry::TelemetryBus;
use crate::transport::{DeviceConnector, NullConnector};

/// Connection bookkeeping for one registered device
#[derive(Clone)]
pub struct ConnectionState {
    pub device: Device,
    pub connector: Option<Arc<dyn DeviceConnector>>,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
    /// Transport label parsed from the connection URI scheme
    pub transport: String,
}

/// Maintains registered devices and their transport connectors
///
/// The device-state map is owned exclusively by the matrix and mutated
/// only inside its own lock section. Connector I/O is never awaited
/// under the lock, so a slow device cannot stall lookups or registration
/// for others.
pub struct ConnectionMatrix {
    bus: TelemetryBus,
    audit: Arc<AuditLog>,
    states: Mutex<HashMap<String, ConnectionState>>,
    fallback: Arc<dyn DeviceConnector>,
}

impl ConnectionMatrix {
    pub fn new(bus: TelemetryBus, audit: Arc<AuditLog>) -> Self {
        Self {
            bus,
            audit,
            states: Mutex::new(HashMap::new()),
            fallback: Arc::new(NullConnector),
        }
    }

    /// Register a device, replacing any existing state for its id
    pub async fn register_device(
        &self,
        device: Device,
        connector: Option<Arc<dyn DeviceConnector>>,
    ) -> Result<()> {
        let device_id = device.device_id.clone();
        let connection_uri = device.connection_uri.clone();
        let transport = transport_label(&connection_uri);

        let state = ConnectionState {
            device,
            connector,
            last_seen: Utc::now(),
            healthy: true,
            transport,
        };
        self.states.lock().await.insert(device_id.clone(), state);

        self.audit
            .append(
                "connection.register",
                json!({"device_id": &device_id, "transport": &connection_uri}),
            )
            .await?;
        self.bus.emit(
            "connection.device_registered",
            json!({"device_id": &device_id, "transport": &connection_uri}),
        );
        info!(device_id = %device_id, "device registered");
        Ok(())
    }

    /// Remove a device; unknown ids are a silent no-op
    pub async fn unregister_device(&self, device_id: &str) -> Result<()> {
        let removed = self.states.lock().await.remove(device_id).is_some();
        if !removed {
            return Ok(());
        }
        self.audit
            .append("connection.unregister", json!({"device_id": device_id}))
            .await?;
        self.bus.emit(
            "connection.device_unregistered",
            json!({"device_id": device_id}),
        );
        info!(device_id = %device_id, "device unregistered");
        Ok(())
    }

    /// Replace the transport adapter of an already-registered device
    pub async fn bind_connector(
        &self,
        device_id: &str,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<()> {
        let transport = {
            let mut states = self.states.lock().await;
            let state = states
                .get_mut(device_id)
                .ok_or_else(|| anyhow!("Unknown device: {device_id}"))?;
            state.connector = Some(connector);
            state.last_seen = Utc::now();
            state.transport.clone()
        };
        self.bus.emit(
            "connection.connector_bound",
            json!({"device_id": device_id, "transport": transport}),
        );
        Ok(())
    }

    /// Execute a (single-device) request through the device's connector
    ///
    /// This is the single chokepoint for device I/O. An unknown device
    /// fails fast with a REJECTED result and no completion event; a known
    /// device without a binding goes through the fallback connector.
    pub async fn execute(&self, device_id: &str, request: &CommandRequest) -> CommandResult {
        let connector = {
            let mut states = self.states.lock().await;
            match states.get_mut(device_id) {
                Some(state) => {
                    state.last_seen = Utc::now();
                    state.connector.clone().unwrap_or_else(|| self.fallback.clone())
                }
                None => {
                    return CommandResult::rejected(
                        &request.request_id,
                        device_id,
                        "Device not registered",
                    );
                }
            }
        };

        // Lock released: the connector may block arbitrarily.
        let result = connector.execute(request).await;

        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(device_id) {
                state.healthy = !result.status.is_failure();
            }
        }
        self.bus.emit(
            "connection.command_completed",
            json!({
                "device_id": device_id,
                "request_id": &request.request_id,
                "status": result.status,
                "exit_code": result.exit_code,
            }),
        );
        result
    }

    /// Bookkeeping snapshot for one device
    pub async fn get_state(&self, device_id: &str) -> Option<ConnectionState> {
        self.states.lock().await.get(device_id).cloned()
    }

    /// Snapshot of every registered device's state
    pub async fn list_devices(&self) -> HashMap<String, ConnectionState> {
        self.states.lock().await.clone()
    }

    /// Number of registered devices
    pub async fn device_count(&self) -> usize {
        self.states.lock().await.len()
    }
}

fn transport_label(connection_uri: &str) -> String {
    connection_uri
        .split(':')
        .next()
        .unwrap_or("unknown")
        .to_string()
}
