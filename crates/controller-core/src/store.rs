//! Indexed in-memory object store.
//!
//! Holds the latest observed state of every object keyed by [`ObjectKey`],
//! plus any number of named secondary indexes. Each index maps an index value
//! (namespace, node name, ...) to the set of keys whose object yields that
//! value. Every mutation updates the primary table and all indexes under a
//! single write lock, so readers never see an index that disagrees with the
//! stored objects.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::StoreError;
use crate::object::{Object, ObjectKey};

/// Name of the built-in namespace index.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Index function indexing objects by namespace.
///
/// Cluster-scoped objects are indexed under the empty string.
pub fn namespace_index<K: Object>(obj: &K) -> Vec<String> {
    vec![obj.namespace().unwrap_or_default().to_string()]
}

/// Extracts zero or more index values from an object. Must be pure.
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// index value -> keys
type Index = HashMap<String, HashSet<ObjectKey>>;

/// Named set of index functions used to build a [`Store`].
pub struct Indexers<K> {
    funcs: HashMap<String, IndexFunc<K>>,
}

impl<K> Indexers<K> {
    /// No indexes.
    pub fn new() -> Self {
        Self {
            funcs: HashMap::new(),
        }
    }

    /// Adds an index. A later index with the same name replaces the earlier one.
    #[must_use]
    pub fn with_index<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        self.funcs.insert(name.to_string(), Arc::new(func));
        self
    }
}

impl<K> Default for Indexers<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for Indexers<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

/// Change produced by [`Store::replace`].
#[derive(Debug)]
pub enum Delta<K> {
    /// Object present in the new list but not in the store
    Added(Arc<K>),
    /// Object present in both with a different resource version
    Updated {
        /// Previously stored state
        old: Arc<K>,
        /// State from the list
        new: Arc<K>,
    },
    /// Object in the store but missing from the list
    Deleted(Arc<K>),
}

struct StoreState<K> {
    items: HashMap<ObjectKey, Arc<K>>,
    indexers: HashMap<String, IndexFunc<K>>,
    indices: HashMap<String, Index>,
}

impl<K: Object> StoreState<K> {
    fn upsert(&mut self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = obj.key();
        let old = self.items.insert(key.clone(), Arc::clone(&obj));
        self.update_indices(&key, old.as_deref(), Some(&*obj));
        old
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<K>> {
        let old = self.items.remove(key)?;
        self.update_indices(key, Some(&*old), None);
        Some(old)
    }

    /// Moves `key` from the values `old` produced to the values `new` produces.
    fn update_indices(&mut self, key: &ObjectKey, old: Option<&K>, new: Option<&K>) {
        for (name, func) in &self.indexers {
            let old_values = index_values(func, old);
            let new_values = index_values(func, new);
            if old_values == new_values && old.is_some() && new.is_some() {
                continue;
            }

            let index = self.indices.entry(name.clone()).or_default();
            for value in old_values.difference(&new_values) {
                if let Some(keys) = index.get_mut(value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(value);
                    }
                }
            }
            for value in new_values.difference(&old_values) {
                index.entry(value.clone()).or_default().insert(key.clone());
            }
        }
    }

    fn rebuild_indices(&mut self) {
        self.indices.clear();
        let items: Vec<(ObjectKey, Arc<K>)> = self
            .items
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        for (key, obj) in items {
            self.update_indices(&key, None, Some(&*obj));
        }
    }
}

/// Thread-safe keyed cache with secondary indexes.
///
/// Objects are shared as `Arc<K>`; readers get cheap clones of the pointer
/// and never block writers for longer than a map lookup.
pub struct Store<K> {
    state: RwLock<StoreState<K>>,
}

impl<K: Object> Store<K> {
    /// Empty store without secondary indexes.
    pub fn new() -> Self {
        Self::with_indexers(Indexers::new())
    }

    /// Empty store with the given indexes.
    pub fn with_indexers(indexers: Indexers<K>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                items: HashMap::new(),
                indexers: indexers.funcs,
                indices: HashMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an additional index.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexConflict`] if the name is taken,
    /// [`StoreError::StoreNotEmpty`] once objects have been admitted.
    pub fn register_index<F>(&self, name: &str, func: F) -> Result<(), StoreError>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let mut state = self.write();
        if state.indexers.contains_key(name) {
            return Err(StoreError::IndexConflict(name.to_string()));
        }
        if !state.items.is_empty() {
            return Err(StoreError::StoreNotEmpty(name.to_string()));
        }
        state.indexers.insert(name.to_string(), Arc::new(func));
        Ok(())
    }

    /// Inserts or replaces an object, returning the previous state.
    pub fn add(&self, obj: K) -> Option<Arc<K>> {
        self.upsert(Arc::new(obj))
    }

    /// Same as [`Store::add`]; kept separate for call-site readability.
    pub fn update(&self, obj: K) -> Option<Arc<K>> {
        self.upsert(Arc::new(obj))
    }

    /// Inserts or replaces an already shared object.
    pub fn upsert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        self.write().upsert(obj)
    }

    /// Removes an object, returning its last stored state.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.write().remove(key)
    }

    /// Point lookup.
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    /// Objects whose index function yields `value` for index `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexNotFound`] for an unregistered index.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let state = self.read();
        if !state.indexers.contains_key(name) {
            return Err(StoreError::IndexNotFound(name.to_string()));
        }
        let objects = state
            .indices
            .get(name)
            .and_then(|index| index.get(value))
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.items.get(k).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(objects)
    }

    /// Keys registered under `value` for index `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexNotFound`] for an unregistered index.
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let state = self.read();
        if !state.indexers.contains_key(name) {
            return Err(StoreError::IndexNotFound(name.to_string()));
        }
        let keys = state
            .indices
            .get(name)
            .and_then(|index| index.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        Ok(keys)
    }

    /// Every value currently present in index `name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexNotFound`] for an unregistered index.
    pub fn list_index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let state = self.read();
        if !state.indexers.contains_key(name) {
            return Err(StoreError::IndexNotFound(name.to_string()));
        }
        Ok(state
            .indices
            .get(name)
            .map(|index| index.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Names of the registered indexes.
    pub fn index_names(&self) -> Vec<String> {
        self.read().indexers.keys().cloned().collect()
    }

    /// True if an index with this name is registered.
    pub fn has_index(&self, name: &str) -> bool {
        self.read().indexers.contains_key(name)
    }

    /// All stored objects, unordered.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.read().items.values().cloned().collect()
    }

    /// All stored keys, unordered.
    pub fn list_keys(&self) -> Vec<ObjectKey> {
        self.read().items.keys().cloned().collect()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    /// Replaces the whole content with an authoritative list.
    ///
    /// Objects whose resource version did not change keep their stored
    /// instance and produce no delta. Objects without a resource version are
    /// always reported as updated. Runs under one write lock.
    pub fn replace(&self, objects: Vec<K>) -> Vec<Delta<K>> {
        let mut incoming: HashMap<ObjectKey, Arc<K>> = HashMap::with_capacity(objects.len());
        for obj in objects {
            incoming.insert(obj.key(), Arc::new(obj));
        }

        let mut state = self.write();
        let mut deltas = Vec::new();

        for (key, old) in &state.items {
            if !incoming.contains_key(key) {
                deltas.push(Delta::Deleted(Arc::clone(old)));
            }
        }

        let mut items = HashMap::with_capacity(incoming.len());
        for (key, new) in incoming {
            match state.items.get(&key) {
                None => {
                    deltas.push(Delta::Added(Arc::clone(&new)));
                    items.insert(key, new);
                }
                Some(old) if unchanged::<K>(old, &new) => {
                    items.insert(key, Arc::clone(old));
                }
                Some(old) => {
                    deltas.push(Delta::Updated {
                        old: Arc::clone(old),
                        new: Arc::clone(&new),
                    });
                    items.insert(key, new);
                }
            }
        }

        state.items = items;
        state.rebuild_indices();
        debug!(
            objects = state.items.len(),
            deltas = deltas.len(),
            "store replaced"
        );
        deltas
    }
}

fn unchanged<K: Object>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn index_values<K>(func: &IndexFunc<K>, obj: Option<&K>) -> HashSet<String> {
    match obj {
        Some(obj) => func(obj).into_iter().collect(),
        None => HashSet::new(),
    }
}

impl<K: Object> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Object> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("Store")
            .field("objects", &state.items.len())
            .field("indexes", &state.indexers.keys().collect::<Vec<_>>())
            .finish()
    }
}
