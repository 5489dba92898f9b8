//! Remote object source abstraction.
//!
//! A [`ListWatch`] lists a collection once and then streams incremental
//! changes from the resource version the list returned. The reflector only
//! ever talks to this trait, so the same machinery runs against the
//! Kubernetes API ([`KubeSource`](crate::KubeSource)) or an in-memory mock.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::SourceError;
use crate::object::Object;

/// Full snapshot of a collection.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    /// Every object in the collection
    pub items: Vec<K>,
    /// Version to resume watching from
    pub resource_version: String,
}

/// Incremental change delivered by a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object created
    Added(K),
    /// Object modified
    Updated(K),
    /// Object removed; carries its final state
    Deleted(K),
    /// Progress marker with no object change
    Bookmark(String),
}

/// Stream of watch events. Ends or yields an error when the watch breaks.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// List + watch access to a remote collection.
#[async_trait]
pub trait ListWatch<K: Object>: Send + Sync {
    /// Lists the whole collection.
    async fn list(&self) -> Result<ObjectList<K>, SourceError>;

    /// Watches changes after `resource_version`.
    ///
    /// Returns [`SourceError::Expired`] (or yields it on the stream) when
    /// the version is too old to resume from.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError>;
}
