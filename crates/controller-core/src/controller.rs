//! Controller loop.
//!
//! The `Controller` owns a reflector feeding the work queue and a pool of
//! workers draining it. Each worker takes a key, looks the object up in the
//! store and hands both to the [`Reconciler`]:
//!
//! ```text
//! Idle -> Dequeued -> Reconciling -> Succeeded -> forget, done
//!                                 -> Failed    -> retries left? add_rate_limited : forget + report
//!                                                 done
//! ```
//!
//! The reconciler sees `None` when the object no longer exists, so deletions
//! and updates go through the same code path.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::handler::{EventHandler, QueueHandler};
use crate::object::{Object, ObjectKey};
use crate::queue::WorkQueue;
use crate::reflector::{Reflector, SyncHandle};
use crate::report::{ErrorReporter, TracingReporter};
use crate::source::ListWatch;
use crate::store::Store;

/// User callback that drives the world towards the state of one object.
///
/// Called at least once per change, possibly more often; implementations
/// must be idempotent. Never called concurrently for the same key.
#[async_trait]
pub trait Reconciler<K: Object>: Send + Sync + 'static {
    /// Error type; returning it schedules a rate-limited retry.
    type Error: StdError + Send + Sync + 'static;

    /// Reconciles `key`. `object` is `None` if it is no longer in the store.
    async fn reconcile(&self, key: &ObjectKey, object: Option<Arc<K>>) -> Result<(), Self::Error>;
}

/// Reflector plus worker pool bound to one reconciler.
pub struct Controller<K: Object, S, R> {
    reflector: Reflector<K, S>,
    store: Arc<Store<K>>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    reporter: Arc<dyn ErrorReporter>,
    config: ControllerConfig,
}

impl<K, S, R> Controller<K, S, R>
where
    K: Object,
    S: ListWatch<K> + 'static,
    R: Reconciler<K>,
{
    /// Wires a controller together.
    ///
    /// The reflector writes into `store` and enqueues changed keys into
    /// `queue`; workers reconcile with `reconciler`.
    ///
    /// # Errors
    ///
    /// [`ControllerError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        source: S,
        store: Arc<Store<K>>,
        queue: Arc<WorkQueue>,
        reconciler: R,
        config: ControllerConfig,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let reflector = Reflector::new(source, Arc::clone(&store), config.reflector())
            .with_handler(Arc::new(QueueHandler::new(Arc::clone(&queue))));
        Ok(Self {
            reflector,
            store,
            queue,
            reconciler: Arc::new(reconciler),
            reporter: Arc::new(TracingReporter),
            config,
        })
    }

    /// Replaces the default [`TracingReporter`].
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Registers an extra handler next to the built-in queue handler.
    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.reflector.add_handler(handler);
    }

    /// Handle reporting whether the store finished its initial sync.
    pub fn sync_handle(&self) -> SyncHandle {
        self.reflector.sync_handle()
    }

    /// Shared store.
    pub fn store(&self) -> Arc<Store<K>> {
        Arc::clone(&self.store)
    }

    /// Shared work queue.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Workers start only after the initial sync. On shutdown the queue is
    /// closed, the reflector stopped and in-flight reconciles get
    /// `shutdown_grace_period` to finish before they are aborted.
    ///
    /// # Errors
    ///
    /// [`ControllerError::InitialList`] if the initial list fails, or
    /// [`ControllerError::Task`] if the reflector task dies.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let Self {
            reflector,
            store,
            queue,
            reconciler,
            reporter,
            config,
        } = self;
        info!(controller = %config.name, workers = config.workers, "Starting controller");

        let sync = reflector.sync_handle();
        let reflector_token = shutdown.child_token();
        let mut reflector_task = tokio::spawn(reflector.run(reflector_token.clone()));

        let synced = tokio::select! {
            synced = sync.wait_for_sync() => synced,
            () = shutdown.cancelled() => false,
        };
        if !synced {
            queue.shut_down();
            reflector_token.cancel();
            return join_reflector(reflector_task).await;
        }
        info!(controller = %config.name, "Caches synced, starting workers");

        let mut workers = JoinSet::new();
        for id in 0..config.workers {
            let worker = Worker {
                id,
                store: Arc::clone(&store),
                queue: Arc::clone(&queue),
                reconciler: Arc::clone(&reconciler),
                reporter: Arc::clone(&reporter),
                max_retries: config.max_retries,
            };
            workers.spawn(worker.run());
        }

        let reflector_result = tokio::select! {
            () = shutdown.cancelled() => None,
            result = &mut reflector_task => Some(flatten(result)),
        };

        info!(controller = %config.name, "Shutting down controller");
        queue.shut_down();
        reflector_token.cancel();
        let reflector_result = match reflector_result {
            Some(result) => result,
            None => join_reflector(reflector_task).await,
        };

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "Worker task failed");
                }
            }
        };
        let grace = config.shutdown_grace_period;
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_period = ?grace,
                "In-flight reconciles did not finish in time, aborting"
            );
            workers.shutdown().await;
        }

        info!(controller = %config.name, "Controller stopped");
        reflector_result
    }
}

impl<K: Object, S, R> fmt::Debug for Controller<K, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("reflector", &self.reflector)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn join_reflector(
    task: JoinHandle<Result<(), ControllerError>>,
) -> Result<(), ControllerError> {
    flatten(task.await)
}

fn flatten(
    joined: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ControllerError::Task(format!("reflector: {e}"))),
    }
}

struct Worker<K: Object, R> {
    id: usize,
    store: Arc<Store<K>>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    reporter: Arc<dyn ErrorReporter>,
    max_retries: u32,
}

impl<K, R> Worker<K, R>
where
    K: Object,
    R: Reconciler<K>,
{
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        let object = self.store.get_by_key(key);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(key, object))
            .catch_unwind()
            .await;
        if let Some(metrics) = self.queue.metrics() {
            metrics.observe_work_duration(started.elapsed().as_secs_f64());
        }

        let err: Box<dyn StdError + Send + Sync> = match outcome {
            Ok(Ok(())) => {
                debug!(key = %key, "Successfully synced {}", key);
                self.queue.forget(key);
                return;
            }
            Ok(Err(err)) => Box::new(err),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                Box::new(ControllerError::ReconcilePanic(message))
            }
        };

        let retries = self.queue.num_requeues(key);
        if retries < self.max_retries {
            warn!(key = %key, retries, error = %err, "Error syncing {}", key);
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        if let Some(metrics) = self.queue.metrics() {
            metrics.inc_exhausted();
        }
        self.reporter.report(key, retries, err.as_ref());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_payload() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
