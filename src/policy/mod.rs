//! Policy evaluation for command authorization
//!
//! This module handles:
//! - A closed, sandboxed rule expression language
//! - Ordered rule evaluation with per-rule fault isolation
//! - Decision telemetry for audit/compliance visibility

mod engine;
mod expr;

pub use engine::PolicyEngine;
pub use expr::{evaluate_condition, ExprError};
