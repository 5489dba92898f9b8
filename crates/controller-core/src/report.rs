//! Terminal error reporting.

use tracing::error;

use crate::object::ObjectKey;

/// Error handed to an [`ErrorReporter`].
pub type ReconcileError = dyn std::error::Error + Send + Sync + 'static;

/// Receives reconcile errors for keys that exhausted their retries.
pub trait ErrorReporter: Send + Sync {
    /// Called once per dropped key, after `retries` rate-limited re-queues.
    fn report(&self, key: &ObjectKey, retries: u32, error: &ReconcileError);
}

/// Default reporter: logs at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, key: &ObjectKey, retries: u32, err: &ReconcileError) {
        error!(
            key = %key,
            retries,
            error = %err,
            "Dropping key out of the queue after exhausting retries"
        );
    }
}
