//! Pluggable device transport adapters
//!
//! Production connectors wrap device-management tooling outside this
//! crate; everything here only depends on the single-method contract.

pub mod loopback;
pub mod traits;

pub use loopback::LoopbackConnector;
pub use traits::{DeviceConnector, NullConnector};
