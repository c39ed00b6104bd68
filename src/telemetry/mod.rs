//! In-process publish/subscribe telemetry
//!
//! This module handles:
//! - Topic-based subscriptions with a `"*"` wildcard
//! - Ordered, queue-driven event dispatch
//! - Per-call event streams for long-polling consumers

mod bus;

pub use bus::{handler, SubscriptionId, TelemetryBus, TelemetryHandler, TelemetryStream, TOPIC_WILDCARD};
