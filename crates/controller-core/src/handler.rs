//! Event handlers fed by the reflector.

use std::sync::Arc;

use tracing::trace;

use crate::object::Object;
use crate::queue::WorkQueue;

/// Receives object change notifications after the store has been updated.
///
/// Handlers run on the reflector task and must not block.
pub trait EventHandler<K: Object>: Send + Sync {
    /// A new object was observed.
    fn on_add(&self, obj: &K);

    /// An existing object changed (or was re-delivered by a resync).
    fn on_update(&self, old: &K, new: &K);

    /// An object was removed; `obj` is its last known state.
    fn on_delete(&self, obj: &K);
}

/// Handler that enqueues the key of every changed object.
#[derive(Debug, Clone)]
pub struct QueueHandler {
    queue: Arc<WorkQueue>,
}

impl QueueHandler {
    /// Enqueues into `queue`.
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    fn enqueue<K: Object>(&self, obj: &K, event: &'static str) {
        let key = obj.key();
        trace!(queue = %self.queue.name(), key = %key, event, "enqueue");
        self.queue.add(key);
    }
}

impl<K: Object> EventHandler<K> for QueueHandler {
    fn on_add(&self, obj: &K) {
        self.enqueue(obj, "add");
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.enqueue(new, "update");
    }

    fn on_delete(&self, obj: &K) {
        self.enqueue(obj, "delete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ExponentialBackoff;
    use crate::object::ObjectKey;

    struct Node(&'static str);

    impl Object for Node {
        fn name(&self) -> &str {
            self.0
        }
        fn namespace(&self) -> Option<&str> {
            None
        }
        fn resource_version(&self) -> Option<&str> {
            None
        }
    }

    #[tokio::test]
    async fn test_queue_handler_enqueues_keys() {
        let queue = Arc::new(WorkQueue::new("nodes", ExponentialBackoff::default()));
        let handler = QueueHandler::new(Arc::clone(&queue));

        handler.on_add(&Node("a"));
        handler.on_update(&Node("a"), &Node("a"));
        handler.on_delete(&Node("b"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some(ObjectKey::cluster("a")));
        assert_eq!(queue.get().await, Some(ObjectKey::cluster("b")));
    }
}
