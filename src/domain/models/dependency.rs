//! Dependency identities and the values the catalog resolves them to.
//!
//! Dependencies are reference-counted across tasks: the watcher keeps one
//! long-poll per identity and fans updates out to every subscribed task.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::task::ServiceSelector;

/// One healthy instance of a catalog service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub node_address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

/// A KV pair under a recursed prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPair {
    pub key: String,
    pub value: String,
}

/// Identity of a watched catalog input.
///
/// Equality is by all fields; two tasks naming the same identity share one
/// watch entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    /// Health endpoint for one service selector.
    HealthServices(ServiceSelector),
    /// Catalog-wide service listing, scoped by datacenter/namespace/node
    /// metadata. Regexp filtering happens downstream so that tasks with
    /// different patterns still share the poll.
    CatalogServices {
        datacenter: Option<String>,
        namespace: Option<String>,
        node_meta: BTreeMap<String, String>,
    },
    /// Value of a single KV path.
    KvValue {
        path: String,
        datacenter: Option<String>,
        namespace: Option<String>,
    },
    /// All pairs under a KV prefix.
    KvKeys {
        prefix: String,
        datacenter: Option<String>,
        namespace: Option<String>,
    },
    /// Existence of a single KV path.
    KvExists {
        path: String,
        datacenter: Option<String>,
        namespace: Option<String>,
    },
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HealthServices(sel) => write!(f, "health.service({})", sel.name),
            Self::CatalogServices { datacenter, .. } => write!(
                f,
                "catalog.services(dc={})",
                datacenter.as_deref().unwrap_or("-")
            ),
            Self::KvValue { path, .. } => write!(f, "kv.value({path})"),
            Self::KvKeys { prefix, .. } => write!(f, "kv.keys({prefix})"),
            Self::KvExists { path, .. } => write!(f, "kv.exists({path})"),
        }
    }
}

/// Resolved value of a dependency.
///
/// `PartialEq` is the semantic-change test the watcher uses: a new catalog
/// index with an equal value is not fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DependencyValue {
    HealthServices(Vec<ServiceInstance>),
    /// Service name to tags, for the whole scoped catalog.
    CatalogServices(BTreeMap<String, Vec<String>>),
    /// `None` when the path does not exist.
    KvValue(Option<String>),
    KvKeys(Vec<KeyPair>),
    KvExists(bool),
}

impl DependencyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HealthServices(_) => "health-services",
            Self::CatalogServices(_) => "catalog-services",
            Self::KvValue(_) => "kv-value",
            Self::KvKeys(_) => "kv-keys",
            Self::KvExists(_) => "kv-exists",
        }
    }
}

/// A change fanned out by the dependency watcher.
#[derive(Debug, Clone)]
pub struct DependencyUpdate {
    pub dependency: Dependency,
    pub value: DependencyValue,
    /// Monotonic catalog index the value was observed at.
    pub index: u64,
    /// Set when the watch entry has exceeded its failure threshold and the
    /// value is the last known one rather than a fresh observation.
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_tuple_distinguishes_dependencies() {
        let a = Dependency::HealthServices(ServiceSelector::named("web"));
        let mut sel = ServiceSelector::named("web");
        sel.datacenter = Some("dc2".to_string());
        let b = Dependency::HealthServices(sel);
        assert_ne!(a, b);
    }

    #[test]
    fn value_equality_is_semantic() {
        let a = DependencyValue::KvValue(Some("x".to_string()));
        let b = DependencyValue::KvValue(Some("x".to_string()));
        let c = DependencyValue::KvValue(None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
