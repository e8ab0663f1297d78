//! Queue keys identifying one catalog object

use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

/// `namespace/name` for namespaced objects, `name` for cluster-scoped ones
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
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
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(""), _) | (_, Some("")) => Err(format!("invalid object key {s:?}")),
            (Some(ns), Some(name)) => Ok(Self::namespaced(ns, name)),
            (Some(name), None) => Ok(Self::cluster(name)),
            (None, _) => Err(format!("invalid object key {s:?}")),
        }
    }
}
