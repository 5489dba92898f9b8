//! Controller Core
//!
//! The moving parts shared by every reconciling controller in this workspace:
//!
//! - **Indexed store** ([`store`]): keyed in-memory mirror of remote objects
//!   with secondary indexes (namespace, node name, ...).
//! - **Work queue** ([`queue`]): deduplicating, rate-limited FIFO of object
//!   keys. A key is never handed to two workers at once.
//! - **Reflector** ([`reflector`]): list + watch against a [`ListWatch`]
//!   source, keeping the store in sync and feeding event handlers.
//! - **Controller** ([`controller`]): worker pool draining the queue into a
//!   [`Reconciler`] with bounded retries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use controller_core::{
//!     Controller, ControllerConfig, Indexers, ListWatch, Object, ObjectKey, Reconciler, Store,
//!     WorkQueue, namespace_index, NAMESPACE_INDEX,
//! };
//!
//! # #[derive(Clone)]
//! # struct Widget { name: String }
//! # impl Object for Widget {
//! #     fn name(&self) -> &str { &self.name }
//! #     fn namespace(&self) -> Option<&str> { None }
//! #     fn resource_version(&self) -> Option<&str> { None }
//! # }
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl Reconciler<Widget> for Printer {
//!     type Error = std::io::Error;
//!
//!     async fn reconcile(&self, key: &ObjectKey, widget: Option<Arc<Widget>>) -> Result<(), Self::Error> {
//!         println!("{key}: exists={}", widget.is_some());
//!         Ok(())
//!     }
//! }
//!
//! # async fn example(source: impl ListWatch<Widget> + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::default().with_workers(2);
//! let store = Arc::new(Store::with_indexers(
//!     Indexers::new().with_index(NAMESPACE_INDEX, namespace_index::<Widget>),
//! ));
//! let queue = Arc::new(WorkQueue::new(&config.name, config.backoff()));
//! let controller = Controller::new(source, store, queue, Printer, config)?;
//!
//! let shutdown = tokio_util::sync::CancellationToken::new();
//! controller.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod handler;
#[cfg(feature = "kube")]
pub mod kube_source;
pub mod lister;
pub mod metrics;
#[cfg(feature = "test-util")]
pub mod mock;
pub mod object;
pub mod queue;
pub mod reflector;
pub mod report;
pub mod source;
pub mod store;

pub use backoff::ExponentialBackoff;
pub use config::ControllerConfig;
pub use controller::{Controller, Reconciler};
pub use error::{ControllerError, SourceError, StoreError};
pub use handler::{EventHandler, QueueHandler};
#[cfg(feature = "kube")]
pub use kube_source::KubeSource;
pub use lister::{Lister, NamespaceLister};
pub use metrics::QueueMetrics;
#[cfg(feature = "test-util")]
pub use mock::MockSource;
pub use object::{Object, ObjectKey};
pub use queue::WorkQueue;
pub use reflector::{Reflector, ReflectorConfig, SyncHandle};
pub use report::{ErrorReporter, ReconcileError, TracingReporter};
pub use source::{ListWatch, ObjectList, WatchEvent, WatchStream};
pub use store::{Delta, IndexFunc, Indexers, NAMESPACE_INDEX, Store, namespace_index};
