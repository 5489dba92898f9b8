//! Kubernetes API source.
//!
//! Adapts `kube::Api` to [`ListWatch`] so any `k8s-openapi` type (or CRD)
//! can be mirrored by a [`Reflector`](crate::Reflector). Every Kubernetes
//! resource is an [`Object`] through its `ObjectMeta`.

use std::fmt;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;
use crate::object::Object;
use crate::source::{ListWatch, ObjectList, WatchEvent, WatchStream};

/// Server-side watch timeout; the API server closes the stream after it.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// HTTP status of an expired resource version.
const GONE: u16 = 410;

impl<K> Object for K
where
    K: Resource + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }
}

/// [`ListWatch`] over a Kubernetes collection.
pub struct KubeSource<K> {
    api: Api<K>,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl<K> KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    /// Source over an existing `Api`.
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            list_params: ListParams::default(),
            watch_params: WatchParams::default().timeout(WATCH_TIMEOUT_SECS),
        }
    }

    /// Objects of one namespace.
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self::new(Api::namespaced(client, namespace))
    }

    /// Objects across all namespaces (or cluster-scoped objects).
    pub fn all(client: Client) -> Self {
        Self::new(Api::all(client))
    }

    /// Restricts list and watch to a label selector.
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.labels(selector);
        self.watch_params = self.watch_params.labels(selector);
        self
    }

    /// Restricts list and watch to a field selector.
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.fields(selector);
        self.watch_params = self.watch_params.fields(selector);
        self
    }

    /// Overrides the server-side watch timeout.
    #[must_use]
    pub fn watch_timeout(mut self, seconds: u32) -> Self {
        self.watch_params = self.watch_params.timeout(seconds);
        self
    }
}

fn source_error(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(status) if status.code == GONE => {
            SourceError::Expired(status.message.clone())
        }
        other => SourceError::Kube(other),
    }
}

fn convert<K>(event: KubeWatchEvent<K>) -> Result<WatchEvent<K>, SourceError> {
    match event {
        KubeWatchEvent::Added(obj) => Ok(WatchEvent::Added(obj)),
        KubeWatchEvent::Modified(obj) => Ok(WatchEvent::Updated(obj)),
        KubeWatchEvent::Deleted(obj) => Ok(WatchEvent::Deleted(obj)),
        KubeWatchEvent::Bookmark(bookmark) => {
            Ok(WatchEvent::Bookmark(bookmark.metadata.resource_version))
        }
        KubeWatchEvent::Error(status) if status.code == GONE => {
            Err(SourceError::Expired(status.message))
        }
        KubeWatchEvent::Error(status) => {
            let message = format!("{}: {}", status.code, status.message);
            Err(SourceError::Watch(message))
        }
    }
}

#[async_trait]
impl<K> ListWatch<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    async fn list(&self) -> Result<ObjectList<K>, SourceError> {
        let list = self
            .api
            .list(&self.list_params)
            .await
            .map_err(source_error)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(items = list.items.len(), resource_version = %resource_version, "Listed collection");
        Ok(ObjectList {
            items: list.items,
            resource_version,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        let stream = self
            .api
            .watch(&self.watch_params, resource_version)
            .await
            .map_err(source_error)?;
        Ok(stream
            .map_err(source_error)
            .map(|event| event.and_then(convert))
            .boxed())
    }
}

impl<K> fmt::Debug for KubeSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeSource")
            .field("list_params", &self.list_params)
            .field("watch_params", &self.watch_params)
            .finish_non_exhaustive()
    }
}
