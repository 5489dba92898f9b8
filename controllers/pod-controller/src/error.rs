//! Controller-specific error types.

use controller_core::{ControllerError, StoreError};
use thiserror::Error;

/// Errors that can occur in the Pod Controller.
#[derive(Debug, Error)]
pub enum PodControllerError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Controller core failure
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// Store lookup failed during reconciliation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe server failed
    #[error("Probe server error: {0}")]
    Probe(#[from] std::io::Error),
}
