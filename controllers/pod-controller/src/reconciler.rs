//! Pod reconciliation logic.
//!
//! The reconciler only observes: it logs the current state of each Pod and
//! how many Pods share its node, using the store's node-name index.

use std::sync::Arc;

use async_trait::async_trait;
use controller_core::{ObjectKey, Reconciler, Store};
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::error::PodControllerError;

/// Name of the index mapping node names to the Pods scheduled on them.
pub const NODE_NAME_INDEX: &str = "nodeName";

/// Indexes a Pod by `spec.nodeName`; unscheduled Pods are not indexed.
pub fn node_name_index(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .into_iter()
        .collect()
}

/// Reconciles Pods against the shared store.
#[derive(Debug)]
pub struct PodReconciler {
    store: Arc<Store<Pod>>,
}

impl PodReconciler {
    /// Creates a reconciler reading from `store`.
    pub fn new(store: Arc<Store<Pod>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Reconciler<Pod> for PodReconciler {
    type Error = PodControllerError;

    async fn reconcile(&self, key: &ObjectKey, pod: Option<Arc<Pod>>) -> Result<(), Self::Error> {
        let Some(pod) = pod else {
            info!("Pod {} does not exist anymore", key);
            return Ok(());
        };

        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("Unknown");
        match pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) {
            Some(node) => {
                let co_located = self.store.by_index(NODE_NAME_INDEX, node)?.len();
                info!(phase, node, co_located, "Sync/Add/Update for Pod {}", key);
            }
            None => {
                info!(phase, "Sync/Add/Update for Pod {} (not scheduled)", key);
            }
        }
        Ok(())
    }
}
