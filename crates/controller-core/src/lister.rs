//! Read-side helpers over a [`Store`].

use std::fmt;
use std::sync::Arc;

use crate::object::{Object, ObjectKey};
use crate::store::{NAMESPACE_INDEX, Store};

/// Lists objects from a store.
pub struct Lister<K> {
    store: Arc<Store<K>>,
}

impl<K: Object> Lister<K> {
    /// Lister over `store`.
    pub fn new(store: Arc<Store<K>>) -> Self {
        Self { store }
    }

    /// Every cached object.
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.list()
    }

    /// Cached objects accepted by `filter`.
    pub fn list_matching<F>(&self, filter: F) -> Vec<Arc<K>>
    where
        F: Fn(&K) -> bool,
    {
        self.store
            .list()
            .into_iter()
            .filter(|obj| filter(obj))
            .collect()
    }

    /// Point lookup by key.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.get_by_key(key)
    }

    /// Lister restricted to one namespace.
    pub fn namespaced(&self, namespace: &str) -> NamespaceLister<K> {
        NamespaceLister {
            store: Arc::clone(&self.store),
            namespace: namespace.to_string(),
        }
    }
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K> fmt::Debug for Lister<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lister").finish_non_exhaustive()
    }
}

/// Lists objects of a single namespace.
///
/// Uses the namespace index when the store has one, otherwise scans.
pub struct NamespaceLister<K> {
    store: Arc<Store<K>>,
    namespace: String,
}

impl<K: Object> NamespaceLister<K> {
    /// Objects in this namespace.
    pub fn list(&self) -> Vec<Arc<K>> {
        if let Ok(objects) = self.store.by_index(NAMESPACE_INDEX, &self.namespace) {
            return objects;
        }
        self.store
            .list()
            .into_iter()
            .filter(|obj| obj.namespace().unwrap_or_default() == self.namespace)
            .collect()
    }

    /// Object `name` in this namespace.
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get_by_key(&ObjectKey::new(Some(&self.namespace), name))
    }

    /// Namespace this lister is bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl<K> fmt::Debug for NamespaceLister<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceLister")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Indexers, namespace_index};

    #[derive(Debug)]
    struct Secret {
        namespace: &'static str,
        name: &'static str,
    }

    impl Object for Secret {
        fn name(&self) -> &str {
            self.name
        }
        fn namespace(&self) -> Option<&str> {
            Some(self.namespace)
        }
        fn resource_version(&self) -> Option<&str> {
            None
        }
    }

    fn secret(namespace: &'static str, name: &'static str) -> Secret {
        Secret { namespace, name }
    }

    fn seed(store: &Store<Secret>) {
        store.add(secret("default", "token"));
        store.add(secret("default", "tls"));
        store.add(secret("kube-system", "token"));
    }

    fn sorted_names(objects: &[Arc<Secret>]) -> Vec<&'static str> {
        let mut names: Vec<_> = objects.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names
    }

    #[test]
    fn test_namespace_lister_with_index() {
        let indexers = Indexers::new()
            .with_index(NAMESPACE_INDEX, namespace_index::<Secret>);
        let store = Arc::new(Store::with_indexers(indexers));
        seed(&store);
        let lister = Lister::new(store);

        let default = lister.namespaced("default").list();
        assert_eq!(sorted_names(&default), vec!["tls", "token"]);
        let system = lister.namespaced("kube-system").list();
        assert_eq!(sorted_names(&system), vec!["token"]);
        assert!(lister.namespaced("empty").list().is_empty());
        assert!(lister.namespaced("kube-system").get("token").is_some());
        assert!(lister.namespaced("kube-system").get("tls").is_none());
    }

    #[test]
    fn test_namespace_lister_without_index_scans() {
        let store = Arc::new(Store::new());
        seed(&store);
        let lister = Lister::new(store);

        let default = lister.namespaced("default").list();
        assert_eq!(sorted_names(&default), vec!["tls", "token"]);
        assert_eq!(lister.list_matching(|s| s.name == "token").len(), 2);
        assert_eq!(lister.list().len(), 3);
    }
}
