//! Device connection registry
//!
//! This module handles:
//! - Device registration and connector binding
//! - Serialized bookkeeping with I/O kept outside the lock
//! - Health tracking from per-command outcomes

mod matrix;

pub use matrix::{ConnectionMatrix, ConnectionState};
