//! List/watch loop that mirrors a remote collection into a [`Store`].
//!
//! The reflector lists once, applies the list to the store and then follows
//! the watch stream from the listed resource version. Whenever the watch
//! ends (closed stream, stream error, expired version or failure to open)
//! the collection is listed again and the difference against the store is
//! delivered to the event handlers, so objects whose events were missed are
//! still reconciled.
//!
//! Only the first list can fail the reflector; later source errors are
//! logged and retried with backoff.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{ControllerError, SourceError};
use crate::handler::EventHandler;
use crate::object::Object;
use crate::source::{ListWatch, WatchEvent};
use crate::store::{Delta, Store};

/// Reflector tunables.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Deliver every object of the initial list to the handlers as an add
    pub initial_reconcile: bool,
    /// Re-deliver every cached object as an update; zero disables resync
    pub resync_period: Duration,
    /// Delay policy between failed lists and watches
    pub relist_backoff: ExponentialBackoff,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            initial_reconcile: true,
            resync_period: Duration::ZERO,
            relist_backoff: ExponentialBackoff::new(
                Duration::from_millis(800),
                Duration::from_secs(30),
            ),
        }
    }
}

/// Read-only view of whether the initial list has been applied.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    synced: watch::Receiver<bool>,
}

impl SyncHandle {
    /// True once the store reflects the first complete list.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits for the initial sync.
    ///
    /// Returns `false` if the reflector stopped before syncing.
    pub async fn wait_for_sync(&self) -> bool {
        let mut synced = self.synced.clone();
        synced.wait_for(|synced| *synced).await.is_ok()
    }
}

/// How a single watch ended.
enum WatchEnd {
    Cancelled,
    Closed,
    Failed(SourceError),
}

/// Keeps a [`Store`] in sync with a [`ListWatch`] source.
pub struct Reflector<K: Object, S> {
    source: S,
    store: Arc<Store<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    config: ReflectorConfig,
    synced: watch::Sender<bool>,
}

impl<K, S> Reflector<K, S>
where
    K: Object,
    S: ListWatch<K>,
{
    /// Creates a reflector without handlers.
    pub fn new(source: S, store: Arc<Store<K>>, config: ReflectorConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            source,
            store,
            handlers: Vec::new(),
            config,
            synced,
        }
    }

    /// Registers a handler. Handlers are called in registration order.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    /// Builder form of [`Reflector::add_handler`].
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler<K>>) -> Self {
        self.add_handler(handler);
        self
    }

    /// Store this reflector writes to.
    pub fn store(&self) -> &Arc<Store<K>> {
        &self.store
    }

    /// Handle for observing the initial sync.
    pub fn sync_handle(&self) -> SyncHandle {
        SyncHandle {
            synced: self.synced.subscribe(),
        }
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// [`ControllerError::InitialList`] if the first list fails. Every later
    /// source error is retried internally.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting reflector");

        let list = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            result = self.source.list() => result.map_err(ControllerError::InitialList)?,
        };
        let mut resource_version = list.resource_version;
        let deltas = self.store.replace(list.items);
        if self.config.initial_reconcile {
            self.dispatch(&deltas);
        }
        self.synced.send_replace(true);
        info!(objects = self.store.len(), resource_version = %resource_version, "Reflector synced");

        let mut resync = self.resync_interval();
        let mut failures: u32 = 0;
        loop {
            match self.watch(&shutdown, &mut resource_version, &mut resync, &mut failures).await {
                WatchEnd::Cancelled => break,
                WatchEnd::Closed => {
                    debug!(resource_version = %resource_version, "Watch closed, re-listing");
                    failures = 0;
                }
                WatchEnd::Failed(err) if err.is_expired() => {
                    info!(error = %err, "Resource version expired, re-listing");
                    failures = 0;
                }
                WatchEnd::Failed(err) => {
                    let delay = self.config.relist_backoff.delay_for(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %err, failures, delay_ms = delay.as_millis(), "Watch failed");
                    if !sleep_or_cancel(&shutdown, delay).await {
                        break;
                    }
                }
            }

            match self.relist(&shutdown).await {
                Some(version) => resource_version = version,
                None => break,
            }
        }

        info!("Reflector stopped");
        Ok(())
    }

    fn resync_interval(&self) -> Option<Interval> {
        let period = self.config.resync_period;
        if period.is_zero() {
            return None;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    /// Follows one watch stream until it ends.
    ///
    /// Clears `failures` as soon as the stream yields an event.
    async fn watch(
        &self,
        shutdown: &CancellationToken,
        resource_version: &mut String,
        resync: &mut Option<Interval>,
        failures: &mut u32,
    ) -> WatchEnd {
        let opened = tokio::select! {
            () = shutdown.cancelled() => return WatchEnd::Cancelled,
            result = self.source.watch(resource_version.as_str()) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return WatchEnd::Failed(err),
        };
        debug!(resource_version = %resource_version, "Watch opened");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return WatchEnd::Cancelled,
                () = tick(resync) => self.resync(),
                event = stream.next() => match event {
                    None => return WatchEnd::Closed,
                    Some(Err(err)) => return WatchEnd::Failed(err),
                    Some(Ok(event)) => {
                        // A watch that delivers is healthy again
                        *failures = 0;
                        self.apply(event, resource_version);
                    }
                },
            }
        }
    }

    /// Lists again and hands the difference to the handlers.
    ///
    /// Retries with backoff until it succeeds; `None` means cancelled.
    async fn relist(&self, shutdown: &CancellationToken) -> Option<String> {
        let mut failures: u32 = 0;
        loop {
            let result = tokio::select! {
                () = shutdown.cancelled() => return None,
                result = self.source.list() => result,
            };
            match result {
                Ok(list) => {
                    let deltas = self.store.replace(list.items);
                    info!(
                        objects = self.store.len(),
                        changes = deltas.len(),
                        "Re-listed"
                    );
                    self.dispatch(&deltas);
                    return Some(list.resource_version);
                }
                Err(err) => {
                    let delay = self.config.relist_backoff.delay_for(failures);
                    failures = failures.saturating_add(1);
                    warn!(error = %err, failures, delay_ms = delay.as_millis(), "Re-list failed");
                    if !sleep_or_cancel(shutdown, delay).await {
                        return None;
                    }
                }
            }
        }
    }

    fn apply(&self, event: WatchEvent<K>, resource_version: &mut String) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Updated(obj) => {
                if let Some(version) = obj.resource_version() {
                    version.clone_into(resource_version);
                }
                let obj = Arc::new(obj);
                match self.store.upsert(Arc::clone(&obj)) {
                    None => {
                        debug!(key = %obj.key(), "Object added");
                        self.handlers.iter().for_each(|h| h.on_add(&obj));
                    }
                    Some(old) => {
                        debug!(key = %obj.key(), "Object updated");
                        self.handlers.iter().for_each(|h| h.on_update(&old, &obj));
                    }
                }
            }
            WatchEvent::Deleted(obj) => {
                if let Some(version) = obj.resource_version() {
                    version.clone_into(resource_version);
                }
                let key = obj.key();
                self.store.delete(&key);
                debug!(key = %key, "Object deleted");
                self.handlers.iter().for_each(|h| h.on_delete(&obj));
            }
            WatchEvent::Bookmark(version) => {
                *resource_version = version;
            }
        }
    }

    fn dispatch(&self, deltas: &[Delta<K>]) {
        for delta in deltas {
            for handler in &self.handlers {
                match delta {
                    Delta::Added(obj) => handler.on_add(obj),
                    Delta::Updated { old, new } => handler.on_update(old, new),
                    Delta::Deleted(obj) => handler.on_delete(obj),
                }
            }
        }
    }

    fn resync(&self) {
        let objects = self.store.list();
        debug!(objects = objects.len(), "Resync");
        for obj in &objects {
            for handler in &self.handlers {
                handler.on_update(obj, obj);
            }
        }
    }
}

impl<K: Object, S> fmt::Debug for Reflector<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reflector")
            .field("store", &self.store)
            .field("handlers", &self.handlers.len())
            .field("config", &self.config)
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Returns false if cancelled before `delay` elapsed.
async fn sleep_or_cancel(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
