//! Catalog port: typed read operations against the service catalog and its
//! KV store.
//!
//! Cancellation is cooperative in the usual tokio sense: dropping a pending
//! call's future aborts the underlying request. Blocking reads are expressed
//! through [`QueryOptions::wait_index`] / [`QueryOptions::wait_time`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::dependency::{KeyPair, ServiceInstance};
use crate::domain::models::task::ServiceSelector;

/// Options attached to every catalog read.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Blocking-query index; the call returns when the catalog's index for
    /// the watched resource exceeds this value, or `wait_time` elapses.
    pub wait_index: Option<u64>,
    pub wait_time: Option<Duration>,
    pub datacenter: Option<String>,
    pub namespace: Option<String>,
    /// Allow stale reads served by non-leader catalog nodes.
    pub stale: bool,
}

impl QueryOptions {
    pub fn blocking(wait_index: u64, wait_time: Duration) -> Self {
        Self {
            wait_index: Some(wait_index),
            wait_time: Some(wait_time),
            ..Self::default()
        }
    }
}

/// Metadata returned alongside every catalog read.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMeta {
    /// Monotonic index for the watched resource.
    pub index: u64,
    /// Whether the response was served from an agent cache.
    pub cached: bool,
}

/// Subset of the agent's self-description the daemon inspects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    /// Edition string, e.g. "oss" or "ent".
    pub edition: String,
    pub datacenter: String,
}

impl AgentInfo {
    /// Entitled editions expose `/v1/operator/license`.
    pub fn requires_entitlement(&self) -> bool {
        self.edition.contains("ent")
    }
}

/// License details surfaced by the entitlement probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub license_id: String,
    pub expiration_time: DateTime<Utc>,
}

/// An HTTP health check attached to a registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub name: String,
    pub check_id: String,
    pub notes: String,
    pub http: String,
    pub method: String,
    pub interval: String,
    pub timeout: String,
    pub deregister_critical_service_after: String,
    pub tls_skip_verify: bool,
    /// Initial check status, e.g. "critical".
    pub status: String,
}

/// Service registration payload for agent self-registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub checks: Vec<ServiceCheck>,
}

/// Typed read (and self-registration) operations against the catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Healthy instances matching a selector.
    async fn health_services(
        &self,
        selector: &ServiceSelector,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<ServiceInstance>, QueryMeta)>;

    /// Catalog-wide service listing: name to tags.
    async fn catalog_services(
        &self,
        node_meta: &BTreeMap<String, String>,
        opts: QueryOptions,
    ) -> DomainResult<(BTreeMap<String, Vec<String>>, QueryMeta)>;

    /// Value of a single KV path; `None` when absent.
    async fn kv_get(
        &self,
        path: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Option<String>, QueryMeta)>;

    /// All pairs under a KV prefix.
    async fn kv_list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<KeyPair>, QueryMeta)>;

    /// Agent self-description, for edition/version detection.
    async fn agent_self(&self) -> DomainResult<AgentInfo>;

    /// Current license, on an entitled agent.
    async fn operator_license(&self, opts: QueryOptions) -> DomainResult<License>;

    /// Register this daemon as a catalog service.
    async fn register_service(&self, reg: &ServiceRegistration) -> DomainResult<()>;

    /// Remove a registration by service id.
    async fn deregister_service(&self, service_id: &str) -> DomainResult<()>;
}
