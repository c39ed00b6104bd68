//! Command routing and fan-out
//!
//! This module handles:
//! - Policy-gated dispatch of command requests
//! - Concurrency-bounded per-device fan-out
//! - Audit recording and telemetry for every outcome

mod dispatcher;

pub use dispatcher::{CommandRouter, RouterConfig};
