//! Observation capability
//!
//! A single trait with no-op defaults; metrics and tracing backends implement
//! whichever hooks they care about. Services hold one `Arc<dyn Observer>` and
//! nothing in the pipeline is load-bearing on it.

use crate::{Decision, Operation};
use std::time::Duration;

pub trait Observer: Send + Sync {
    /// A request entered a service
    fn on_request(&self, _service: &str, _operation: Operation) {}

    /// A rule evaluation concluded
    fn on_decision(&self, _operation: Operation, _decision: Decision) {}

    /// A request left a service
    fn on_complete(&self, _service: &str, _operation: Operation, _success: bool, _elapsed: Duration) {
    }
}

/// Observer that does nothing
#[derive(Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Observer that emits tracing events
#[derive(Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_decision(&self, operation: Operation, decision: Decision) {
        tracing::debug!(operation = %operation, decision = ?decision, "rule decision");
    }

    fn on_complete(&self, service: &str, operation: Operation, success: bool, elapsed: Duration) {
        tracing::debug!(
            service,
            operation = %operation,
            success,
            elapsed_ms = elapsed.as_millis() as u64,
            "request complete"
        );
    }
}
