//! Lifecycle event notifications
//!
//! The orchestrator reports what it does through [`EventObserver`] instead of
//! logging directly, so embedders can forward events to their own sinks.

use serde_json::Value;
use tracing::info;

pub const CERTIFICATE_VALID: &str = "certificate_valid";
pub const ISSUANCE_STARTED: &str = "issuance_started";
pub const CHALLENGE_REGISTERED: &str = "challenge_registered";
pub const CERTIFICATE_OBTAINED: &str = "certificate_obtained";
pub const ISSUANCE_FAILED: &str = "issuance_failed";
pub const STORAGE_CLEANED: &str = "storage_cleaned";

/// Receives lifecycle events
pub trait EventObserver: Send + Sync {
    fn on_event(&self, name: &str, data: &Value);
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, name: &str, data: &Value) {
        info!(event = %name, data = %data, "ACME event");
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EventObserver for NoopObserver {
    fn on_event(&self, _name: &str, _data: &Value) {}
}
