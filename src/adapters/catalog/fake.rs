//! In-memory catalog for development and tests.
//!
//! Supports the same blocking-query semantics as the HTTP client: reads with
//! a `wait_index` park until the fake's index advances past it or the wait
//! time elapses.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::dependency::{KeyPair, ServiceInstance};
use crate::domain::models::task::ServiceSelector;
use crate::domain::ports::catalog::{
    AgentInfo, Catalog, License, QueryMeta, QueryOptions, ServiceRegistration,
};

const DEFAULT_FAKE_WAIT: Duration = Duration::from_secs(5);

struct FakeState {
    index: u64,
    kv: BTreeMap<String, String>,
    instances: Vec<ServiceInstance>,
    registrations: Vec<ServiceRegistration>,
    fail_reads: bool,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            // A live catalog never reports index 0; a blocking read with
            // wait_index 0 must return immediately.
            index: 1,
            kv: BTreeMap::new(),
            instances: Vec::new(),
            registrations: Vec::new(),
            fail_reads: false,
        }
    }
}

/// A catalog whose contents are mutated directly by test code.
#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<FakeState>,
    changed: Notify,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate(&self, f: impl FnOnce(&mut FakeState)) {
        {
            let mut state = self.state.lock().expect("fake catalog lock");
            f(&mut state);
            state.index += 1;
        }
        self.changed.notify_waiters();
    }

    pub fn set_kv(&self, path: &str, value: &str) {
        self.mutate(|s| {
            s.kv.insert(path.to_string(), value.to_string());
        });
    }

    pub fn delete_kv(&self, path: &str) {
        self.mutate(|s| {
            s.kv.remove(path);
        });
    }

    pub fn register_instance(&self, instance: ServiceInstance) {
        self.mutate(|s| s.instances.push(instance));
    }

    pub fn deregister_instance(&self, service_name: &str, id: &str) {
        self.mutate(|s| {
            s.instances
                .retain(|i| !(i.name == service_name && i.id == id));
        });
    }

    /// Make every read fail until restored; used to exercise degradation.
    pub fn set_failing(&self, failing: bool) {
        self.mutate(|s| s.fail_reads = failing);
    }

    pub fn registered_services(&self) -> Vec<ServiceRegistration> {
        self.state
            .lock()
            .expect("fake catalog lock")
            .registrations
            .clone()
    }

    /// Wait until the state observed at `wait_index` changes, then produce a
    /// read through `f`.
    async fn blocking_read<T>(
        &self,
        opts: &QueryOptions,
        f: impl Fn(&FakeState) -> T,
    ) -> DomainResult<(T, QueryMeta)> {
        let wait = opts.wait_time.unwrap_or(DEFAULT_FAKE_WAIT);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            {
                let state = self.state.lock().expect("fake catalog lock");
                if state.fail_reads {
                    return Err(DomainError::CatalogUnreachable(
                        "fake catalog failing".to_string(),
                    ));
                }
                let ready = match opts.wait_index {
                    Some(wait_index) => state.index > wait_index,
                    None => true,
                };
                if ready {
                    let meta = QueryMeta {
                        index: state.index,
                        cached: false,
                    };
                    return Ok((f(&state), meta));
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let state = self.state.lock().expect("fake catalog lock");
                    let meta = QueryMeta {
                        index: state.index,
                        cached: false,
                    };
                    return Ok((f(&state), meta));
                }
            }
        }
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    async fn health_services(
        &self,
        selector: &ServiceSelector,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<ServiceInstance>, QueryMeta)> {
        let name = selector.name.clone();
        let tag = selector.tag.clone();
        self.blocking_read(&opts, move |state| {
            let mut instances: Vec<ServiceInstance> = state
                .instances
                .iter()
                .filter(|i| i.name == name)
                .filter(|i| tag.as_ref().is_none_or(|t| i.tags.contains(t)))
                .cloned()
                .collect();
            instances.sort_by(|a, b| a.id.cmp(&b.id));
            instances
        })
        .await
    }

    async fn catalog_services(
        &self,
        _node_meta: &BTreeMap<String, String>,
        opts: QueryOptions,
    ) -> DomainResult<(BTreeMap<String, Vec<String>>, QueryMeta)> {
        self.blocking_read(&opts, |state| {
            let mut services: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for instance in &state.instances {
                let tags = services.entry(instance.name.clone()).or_default();
                for tag in &instance.tags {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
            services
        })
        .await
    }

    async fn kv_get(
        &self,
        path: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Option<String>, QueryMeta)> {
        let path = path.to_string();
        self.blocking_read(&opts, move |state| state.kv.get(&path).cloned())
            .await
    }

    async fn kv_list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<KeyPair>, QueryMeta)> {
        let prefix = prefix.to_string();
        self.blocking_read(&opts, move |state| {
            state
                .kv
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| KeyPair {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect()
        })
        .await
    }

    async fn agent_self(&self) -> DomainResult<AgentInfo> {
        Ok(AgentInfo {
            version: "1.20.0".to_string(),
            edition: "oss".to_string(),
            datacenter: "dc1".to_string(),
        })
    }

    async fn operator_license(&self, _opts: QueryOptions) -> DomainResult<License> {
        Ok(License {
            license_id: "fake".to_string(),
            expiration_time: Utc::now(),
        })
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> DomainResult<()> {
        let reg = reg.clone();
        self.mutate(|s| s.registrations.push(reg));
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> DomainResult<()> {
        let id = service_id.to_string();
        self.mutate(|s| s.registrations.retain(|r| r.id != id));
        Ok(())
    }
}
