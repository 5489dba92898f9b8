//! In-memory [`ListWatch`] for tests (feature `test-util`).
//!
//! Keeps a versioned collection and an event history so watches can resume
//! from any revision, like the API server. Tests drive it directly:
//! [`MockSource::apply`] and [`MockSource::remove`] emit events, the
//! `*_silently` variants change state without telling open watches (a missed
//! event), [`MockSource::disconnect`] ends every open watch and
//! [`MockSource::expire`] invalidates old resource versions.
//!
//! The mock does not stamp resource versions onto objects; give objects a
//! version of their own if the test relies on re-list deltas.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;

use crate::error::SourceError;
use crate::object::{Object, ObjectKey};
use crate::source::{ListWatch, ObjectList, WatchEvent, WatchStream};

type EventSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, SourceError>>;

struct MockState<K> {
    objects: BTreeMap<ObjectKey, K>,
    revision: u64,
    history: Vec<(u64, WatchEvent<K>)>,
    /// Watches from a revision below this fail with `Expired`
    compacted: u64,
    watchers: Vec<EventSender<K>>,
    failing_lists: usize,
    list_calls: usize,
    watch_calls: usize,
}

impl<K: Object + Clone> MockState<K> {
    fn emit(&mut self, event: WatchEvent<K>) {
        self.revision += 1;
        self.history.push((self.revision, event.clone()));
        self.watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }
}

/// Scriptable in-memory source. Clones share state.
pub struct MockSource<K> {
    state: Arc<Mutex<MockState<K>>>,
}

impl<K: Object + Clone> MockSource<K> {
    /// Empty collection at revision 0.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                objects: BTreeMap::new(),
                revision: 0,
                history: Vec::new(),
                compacted: 0,
                watchers: Vec::new(),
                failing_lists: 0,
                list_calls: 0,
                watch_calls: 0,
            })),
        }
    }

    /// Collection pre-populated with `objects`, without history.
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let source = Self::new();
        for obj in objects {
            source.insert_silently(obj);
        }
        source
    }

    fn lock(&self) -> MutexGuard<'_, MockState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or updates an object and notifies open watches.
    pub fn apply(&self, obj: K) {
        let mut state = self.lock();
        let event = if state.objects.insert(obj.key(), obj.clone()).is_some() {
            WatchEvent::Updated(obj)
        } else {
            WatchEvent::Added(obj)
        };
        state.emit(event);
    }

    /// Deletes an object and notifies open watches.
    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        let mut state = self.lock();
        let obj = state.objects.remove(key)?;
        state.emit(WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Creates or updates an object without emitting an event.
    pub fn insert_silently(&self, obj: K) {
        let mut state = self.lock();
        state.revision += 1;
        state.objects.insert(obj.key(), obj);
    }

    /// Deletes an object without emitting an event.
    pub fn remove_silently(&self, key: &ObjectKey) -> Option<K> {
        let mut state = self.lock();
        state.revision += 1;
        state.objects.remove(key)
    }

    /// Emits a bookmark at the current revision.
    pub fn bookmark(&self) {
        let mut state = self.lock();
        let revision = (state.revision + 1).to_string();
        state.emit(WatchEvent::Bookmark(revision));
    }

    /// Ends every open watch stream.
    pub fn disconnect(&self) {
        self.lock().watchers.clear();
    }

    /// Fails every open watch stream with [`SourceError::Watch`].
    pub fn break_watches(&self) {
        for tx in self.lock().watchers.drain(..) {
            let _ = tx.unbounded_send(Err(SourceError::Watch("connection reset".to_string())));
        }
    }

    /// Invalidates every revision before the current one and fails open
    /// watches with [`SourceError::Expired`].
    pub fn expire(&self) {
        let mut state = self.lock();
        state.compacted = state.revision;
        state.history.clear();
        for tx in state.watchers.drain(..) {
            let expired = SourceError::Expired("too old resource version".to_string());
            let _ = tx.unbounded_send(Err(expired));
        }
    }

    /// Makes the next `count` list calls fail.
    pub fn fail_next_lists(&self, count: usize) {
        self.lock().failing_lists = count;
    }

    /// Number of list calls so far, including failed ones.
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of watch calls so far.
    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    /// Number of watch streams currently open.
    pub fn open_watches(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }
}

impl<K: Object + Clone> Default for MockSource<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for MockSource<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> fmt::Debug for MockSource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: Object + Clone> ListWatch<K> for MockSource<K> {
    async fn list(&self) -> Result<ObjectList<K>, SourceError> {
        let mut state = self.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(SourceError::List("injected list failure".to_string()));
        }
        Ok(ObjectList {
            items: state.objects.values().cloned().collect(),
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        let mut state = self.lock();
        state.watch_calls += 1;
        let Ok(from) = resource_version.parse::<u64>() else {
            let message = format!("malformed resource version {resource_version:?}");
            return Err(SourceError::Watch(message));
        };
        if from < state.compacted {
            return Err(SourceError::Expired(resource_version.to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        for (revision, event) in &state.history {
            if *revision > from {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }
        state.watchers.push(tx);
        Ok(rx.boxed())
    }
}
