//! Fleettower control plane
//!
//! Authorizes and dispatches commands to a fleet of remotely managed
//! devices through pluggable transport adapters, keeps a tamper-evident
//! hash-chained record of every decision and outcome, and broadcasts
//! live status on an in-process telemetry bus.
//!
//! Components in leaf-first dependency order:
//! - [`telemetry`] - pub/sub event bus every other component reports to
//! - [`audit`] - append-only hash-chained record store
//! - [`policy`] - sandboxed rule evaluation for command authorization
//! - [`connection`] - device registry binding transports to device ids
//! - [`router`] - policy check, bounded fan-out, audit recording

pub mod audit;
pub mod config;
pub mod connection;
pub mod models;
pub mod policy;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use audit::{AuditLog, AuditRecord, GENESIS_HASH};
pub use config::ControlPlaneConfig;
pub use connection::{ConnectionMatrix, ConnectionState};
pub use models::{
    CommandPriority, CommandRequest, CommandResult, CommandStatus, Device, DeviceStatus,
    PolicyContext, PolicyDecision, PolicyRule, RuleEffect, TelemetryEvent,
};
pub use policy::PolicyEngine;
pub use router::{CommandRouter, RouterConfig};
pub use telemetry::TelemetryBus;
pub use transport::{DeviceConnector, LoopbackConnector, NullConnector};
