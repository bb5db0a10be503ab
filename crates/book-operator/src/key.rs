//! Reconciliation keys

use kube::Resource;
use std::fmt;
use std::str::FromStr;

/// Canonical `(namespace, name)` of a Book with pending work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a namespaced, named object; `None` for anything else
    pub fn for_resource<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = obj.meta().namespace.as_deref().filter(|n| !n.is_empty())?;
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(format!("'{}' is not a namespace/name key", s)),
        }
    }
}
