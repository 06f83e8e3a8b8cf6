//! Per-condition notification filters.
//!
//! A filter sits between the template engine and the task runtime and
//! decides whether a dependency change should wake the task. First-completion
//! is not a filter concern: the engine emits that single designated wake
//! itself, once, after the first complete render.

use std::collections::BTreeSet;

use regex::Regex;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::dependency::{DependencyUpdate, DependencyValue};
use crate::domain::models::task::Condition;

/// Decides whether a dependency change should wake the owning task.
pub trait NotifyFilter: Send {
    fn should_notify(&mut self, update: &DependencyUpdate) -> bool;
}

/// Build the filter matching a task's condition.
pub fn filter_for(condition: &Condition) -> DomainResult<Box<dyn NotifyFilter>> {
    match condition {
        Condition::Services(_) => Ok(Box::new(ServicesFilter)),
        Condition::CatalogServices(monitor) => {
            let regexp = Regex::new(&monitor.regexp).map_err(|e| {
                DomainError::ValidationFailed(format!(
                    "invalid catalog-services regexp '{}': {}",
                    monitor.regexp, e
                ))
            })?;
            Ok(Box::new(CatalogServicesFilter {
                regexp,
                last_names: None,
            }))
        }
        Condition::ConsulKv(monitor) => Ok(Box::new(ConsulKvFilter {
            recurse: monitor.recurse,
        })),
        Condition::Schedule { .. } => Ok(Box::new(ScheduleFilter)),
    }
}

/// Wake on any change to watched service instances. Module-input data
/// (KV, catalog listings) never triggers.
struct ServicesFilter;

impl NotifyFilter for ServicesFilter {
    fn should_notify(&mut self, update: &DependencyUpdate) -> bool {
        matches!(update.value, DependencyValue::HealthServices(_))
    }
}

/// Wake only when the set of service names matching the regexp changes.
/// Per-instance churn of already-known services is suppressed.
struct CatalogServicesFilter {
    regexp: Regex,
    last_names: Option<BTreeSet<String>>,
}

impl NotifyFilter for CatalogServicesFilter {
    fn should_notify(&mut self, update: &DependencyUpdate) -> bool {
        let DependencyValue::CatalogServices(services) = &update.value else {
            return false;
        };
        let names: BTreeSet<String> = services
            .keys()
            .filter(|name| self.regexp.is_match(name))
            .cloned()
            .collect();
        let changed = match &self.last_names {
            Some(last) => *last != names,
            // The first observation is covered by first-completion.
            None => false,
        };
        self.last_names = Some(names);
        changed
    }
}

/// Wake on KV mutations under the watched path; suppress service churn.
struct ConsulKvFilter {
    recurse: bool,
}

impl NotifyFilter for ConsulKvFilter {
    fn should_notify(&mut self, update: &DependencyUpdate) -> bool {
        match &update.value {
            DependencyValue::KvValue(_) | DependencyValue::KvExists(_) => !self.recurse,
            DependencyValue::KvKeys(_) => self.recurse,
            _ => false,
        }
    }
}

/// Suppress every dependency-driven wake; the runtime generates synthetic
/// wakes at cron ticks.
struct ScheduleFilter;

impl NotifyFilter for ScheduleFilter {
    fn should_notify(&mut self, _update: &DependencyUpdate) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::models::dependency::{Dependency, ServiceInstance};
    use crate::domain::models::task::{
        CatalogServicesMonitor, ConsulKvMonitor, ServicesMonitor,
    };

    fn services_update() -> DependencyUpdate {
        DependencyUpdate {
            dependency: Dependency::HealthServices(
                crate::domain::models::task::ServiceSelector::named("web"),
            ),
            value: DependencyValue::HealthServices(vec![ServiceInstance::default()]),
            index: 1,
            degraded: false,
        }
    }

    fn kv_update(value: Option<&str>) -> DependencyUpdate {
        DependencyUpdate {
            dependency: Dependency::KvValue {
                path: "test-key".to_string(),
                datacenter: None,
                namespace: None,
            },
            value: DependencyValue::KvValue(value.map(str::to_string)),
            index: 1,
            degraded: false,
        }
    }

    fn catalog_update(names: &[&str]) -> DependencyUpdate {
        let services: BTreeMap<String, Vec<String>> = names
            .iter()
            .map(|n| (n.to_string(), Vec::new()))
            .collect();
        DependencyUpdate {
            dependency: Dependency::CatalogServices {
                datacenter: None,
                namespace: None,
                node_meta: BTreeMap::new(),
            },
            value: DependencyValue::CatalogServices(services),
            index: 1,
            degraded: false,
        }
    }

    #[test]
    fn services_condition_wakes_on_instance_change_only() {
        let cond = Condition::Services(ServicesMonitor {
            names: vec!["web".to_string()],
            ..Default::default()
        });
        let mut filter = filter_for(&cond).unwrap();
        assert!(filter.should_notify(&services_update()));
        assert!(!filter.should_notify(&kv_update(Some("x"))));
    }

    #[test]
    fn kv_condition_suppresses_service_churn() {
        let cond = Condition::ConsulKv(ConsulKvMonitor {
            path: "test-key".to_string(),
            use_as_module_input: true,
            ..Default::default()
        });
        let mut filter = filter_for(&cond).unwrap();
        assert!(!filter.should_notify(&services_update()));
        assert!(filter.should_notify(&kv_update(Some("test-value"))));
        assert!(filter.should_notify(&kv_update(None)));
    }

    #[test]
    fn recurse_kv_condition_wakes_on_key_set_only() {
        let cond = Condition::ConsulKv(ConsulKvMonitor {
            path: "test-key".to_string(),
            recurse: true,
            use_as_module_input: true,
            ..Default::default()
        });
        let mut filter = filter_for(&cond).unwrap();
        assert!(!filter.should_notify(&kv_update(Some("x"))));
        let keys = DependencyUpdate {
            dependency: Dependency::KvKeys {
                prefix: "test-key".to_string(),
                datacenter: None,
                namespace: None,
            },
            value: DependencyValue::KvKeys(vec![]),
            index: 2,
            degraded: false,
        };
        assert!(filter.should_notify(&keys));
    }

    #[test]
    fn catalog_services_wakes_on_membership_delta() {
        let cond = Condition::CatalogServices(CatalogServicesMonitor {
            regexp: "^api".to_string(),
            ..Default::default()
        });
        let mut filter = filter_for(&cond).unwrap();
        // First observation: covered by first-completion, no wake.
        assert!(!filter.should_notify(&catalog_update(&["api-a", "web"])));
        // Same membership under the regexp: no wake.
        assert!(!filter.should_notify(&catalog_update(&["api-a", "db"])));
        // New matching name appears: wake.
        assert!(filter.should_notify(&catalog_update(&["api-a", "api-b"])));
        // Matching name disappears: wake.
        assert!(filter.should_notify(&catalog_update(&["api-b"])));
    }

    #[test]
    fn schedule_condition_suppresses_everything() {
        let cond = Condition::Schedule {
            cron: "0 * * * * *".to_string(),
        };
        let mut filter = filter_for(&cond).unwrap();
        assert!(!filter.should_notify(&services_update()));
        assert!(!filter.should_notify(&kv_update(Some("x"))));
    }
}
