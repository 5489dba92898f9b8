//! Object identity.
//!
//! Every cached object is addressed by an [`ObjectKey`] derived from its
//! namespace and name. The string form matches the familiar
//! `namespace/name` convention (`name` alone for cluster-scoped objects).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A versioned record that can be mirrored by the store.
pub trait Object: Send + Sync + 'static {
    /// Object name, unique within its namespace.
    fn name(&self) -> &str;

    /// Namespace, `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;

    /// Opaque revision marker of the observed state, if the source tracks one.
    fn resource_version(&self) -> Option<&str>;

    /// Key under which the object is stored and queued.
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }
}

/// Composite `(namespace, name)` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Builds a key. An empty namespace is treated as cluster-scoped.
    pub fn new(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.into(),
        }
    }

    /// Key of a namespaced object.
    pub fn namespaced(namespace: &str, name: impl Into<String>) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new(None, name)
    }

    /// Parses `namespace/name` or `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] for an empty name, an empty
    /// namespace before the `/`, or more than one `/`.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut parts = raw.split('/');
        let key = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => Self::cluster(name),
            (Some(namespace), Some(name), None) if !namespace.is_empty() => {
                Self::namespaced(namespace, name)
            }
            _ => return Err(StoreError::InvalidKey(raw.to_string())),
        };
        if key.name.is_empty() {
            return Err(StoreError::InvalidKey(raw.to_string()));
        }
        Ok(key)
    }

    /// Namespace part, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name part.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}
