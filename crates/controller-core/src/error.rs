//! Error types for the controller core.
//!
//! Each component owns its error enum. Remote-source errors are absorbed by
//! the reflector after the initial list; only startup failures and invalid
//! configuration reach the caller of [`Controller::run`](crate::Controller::run).

use thiserror::Error;

/// Errors returned by the indexed store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup against an index that was never registered
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// An index with the same name is already registered
    #[error("Index already registered: {0}")]
    IndexConflict(String),

    /// Indexes can only be registered before the store holds objects
    #[error("Cannot register index {0} on a populated store")]
    StoreNotEmpty(String),

    /// Malformed `namespace/name` key
    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),
}

/// Errors produced by a [`ListWatch`](crate::ListWatch) source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Kubernetes API error
    #[cfg(feature = "kube")]
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested resource version is too old; a fresh list is required
    #[error("Resource version expired: {0}")]
    Expired(String),

    /// Listing the collection failed
    #[error("List failed: {0}")]
    List(String),

    /// The watch stream failed
    #[error("Watch failed: {0}")]
    Watch(String),
}

impl SourceError {
    /// True when the watch cannot resume and the collection must be re-listed.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }
}

/// Errors that can occur while running a controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The first list against the source failed; the controller cannot start
    #[error("Initial list failed: {0}")]
    InitialList(#[source] SourceError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The reconciler panicked while processing a key
    #[error("Reconciler panicked: {0}")]
    ReconcilePanic(String),

    /// A background task failed to join
    #[error("Task failed: {0}")]
    Task(String),
}
