//! Task domain model.
//!
//! A task binds a module (a parameterised infrastructure template) to a set
//! of watched catalog inputs, a trigger condition, and a buffer policy. The
//! controller owns the task map; each task is driven by its own runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult};

/// Health-derived status of a task, computed from its recent events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Most recent run succeeded.
    Successful,
    /// Most recent run failed.
    Errored,
    /// Two or more consecutive runs failed.
    Critical,
    /// No runs recorded yet.
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Errored => "errored",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }

    /// Derive a status from the success history of recent runs, newest
    /// first.
    pub fn from_history(newest_first: &[bool]) -> Self {
        match newest_first {
            [] => Self::Unknown,
            [true, ..] => Self::Successful,
            [false, false, ..] => Self::Critical,
            [false, ..] => Self::Errored,
        }
    }
}

/// Selects service instances to watch in the catalog.
///
/// Equality is by the full tuple: two selectors naming the same service in
/// different datacenters are distinct dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceSelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cts_user_defined_meta: BTreeMap<String, String>,
}

impl ServiceSelector {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datacenter: None,
            namespace: None,
            tag: None,
            filter: None,
            cts_user_defined_meta: BTreeMap::new(),
        }
    }
}

/// Watches service instances by explicit names or a name regexp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesMonitor {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cts_user_defined_meta: BTreeMap<String, String>,
    /// When used as a condition, also feed the watched data to the module.
    #[serde(default)]
    pub use_as_module_input: bool,
}

/// Watches the catalog-wide service list for membership changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogServicesMonitor {
    pub regexp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_meta: BTreeMap<String, String>,
    #[serde(default)]
    pub use_as_module_input: bool,
}

/// Watches a KV path, exact or as a prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsulKvMonitor {
    pub path: String,
    #[serde(default)]
    pub recurse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub use_as_module_input: bool,
}

/// The rule deciding when a dependency change should wake a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    Services(ServicesMonitor),
    CatalogServices(CatalogServicesMonitor),
    ConsulKv(ConsulKvMonitor),
    Schedule { cron: String },
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Services { .. } => "services",
            Self::CatalogServices { .. } => "catalog-services",
            Self::ConsulKv { .. } => "consul-kv",
            Self::Schedule { .. } => "schedule",
        }
    }
}

/// Extra data fed to the module without affecting trigger semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleInput {
    Services(ServicesMonitor),
    CatalogServices(CatalogServicesMonitor),
    ConsulKv(ConsulKvMonitor),
}

impl ModuleInput {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Services(_) => "services",
            Self::CatalogServices(_) => "catalog-services",
            Self::ConsulKv(_) => "consul-kv",
        }
    }
}

/// Coalescing window applied to notifications before a run fires.
///
/// `min` is the quiet period after the latest signal; `max` caps the total
/// delay from the first signal of a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPeriod {
    #[serde(with = "duration_secs")]
    pub min: Duration,
    #[serde(with = "duration_secs")]
    pub max: Duration,
}

impl Default for BufferPeriod {
    fn default() -> Self {
        let min = Duration::from_secs(5);
        Self { min, max: min * 4 }
    }
}

impl BufferPeriod {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }
}

/// Reference to the module a task renders and executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// One declarative unit of synchronisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    pub module: ModuleRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSelector>,
    pub condition: Condition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_input: Option<ModuleInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferPeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl Task {
    /// Validate the task configuration. Name uniqueness is enforced by the
    /// controller, which owns the task map.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.is_empty() {
            return Err(DomainError::ValidationFailed(
                "task name must not be empty".to_string(),
            ));
        }
        if self.name.contains('/') || self.name.contains(char::is_whitespace) {
            return Err(DomainError::ValidationFailed(format!(
                "task name '{}' must not contain '/' or whitespace",
                self.name
            )));
        }
        if self.module.source.is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "task '{}' requires a module source",
                self.name
            )));
        }

        match &self.condition {
            Condition::Services(monitor) => {
                if monitor.names.is_empty() && monitor.regexp.is_none() {
                    return Err(DomainError::ValidationFailed(format!(
                        "task '{}': services condition requires names or a regexp",
                        self.name
                    )));
                }
                if monitor.regexp.is_some() && !self.services.is_empty() {
                    return Err(DomainError::ValidationFailed(format!(
                        "task '{}': services condition with a regexp cannot be combined \
                         with a task-level services list",
                        self.name
                    )));
                }
                if let Some(re) = &monitor.regexp {
                    regex::Regex::new(re).map_err(|e| {
                        DomainError::ValidationFailed(format!(
                            "task '{}': invalid services regexp '{}': {}",
                            self.name, re, e
                        ))
                    })?;
                }
            }
            Condition::CatalogServices(monitor) => {
                regex::Regex::new(&monitor.regexp).map_err(|e| {
                    DomainError::ValidationFailed(format!(
                        "task '{}': invalid catalog-services regexp '{}': {}",
                        self.name, monitor.regexp, e
                    ))
                })?;
            }
            Condition::ConsulKv(monitor) => {
                if monitor.path.is_empty() {
                    return Err(DomainError::ValidationFailed(format!(
                        "task '{}': consul-kv condition requires a path",
                        self.name
                    )));
                }
            }
            Condition::Schedule { cron } => {
                use std::str::FromStr;
                cron::Schedule::from_str(cron).map_err(|e| {
                    DomainError::ValidationFailed(format!(
                        "task '{}': invalid cron expression '{}': {}",
                        self.name, cron, e
                    ))
                })?;
            }
        }

        if let Some(input) = &self.module_input {
            if input.kind() == self.condition.kind() {
                return Err(DomainError::ValidationFailed(format!(
                    "task '{}': module input kind '{}' duplicates the condition; \
                     set use_as_module_input on the condition instead",
                    self.name,
                    input.kind()
                )));
            }
        }

        Ok(())
    }

    /// Union of watched services: the task-level selectors plus any service
    /// block inside a services condition or services module input.
    pub fn watched_services(&self) -> Vec<ServiceSelector> {
        let mut selectors = self.services.clone();
        let mut push_monitor = |m: &ServicesMonitor| {
            for name in &m.names {
                selectors.push(ServiceSelector {
                    name: name.clone(),
                    datacenter: m.datacenter.clone(),
                    namespace: m.namespace.clone(),
                    tag: None,
                    filter: m.filter.clone(),
                    cts_user_defined_meta: m.cts_user_defined_meta.clone(),
                });
            }
        };
        if let Condition::Services(monitor) = &self.condition {
            push_monitor(monitor);
        }
        if let Some(ModuleInput::Services(monitor)) = &self.module_input {
            push_monitor(monitor);
        }
        selectors.sort();
        selectors.dedup();
        selectors
    }

    /// Effective buffer period. Scheduled tasks never buffer; their wakes
    /// are already aligned to cron ticks.
    pub fn effective_buffer(&self) -> Option<BufferPeriod> {
        match self.condition {
            Condition::Schedule { .. } => None,
            _ => self.buffer,
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_task(name: &str) -> Task {
        Task {
            name: name.to_string(),
            enabled: true,
            description: String::new(),
            module: ModuleRef {
                source: "./modules/kv-file".to_string(),
                version: None,
            },
            services: vec![ServiceSelector::named("web"), ServiceSelector::named("api")],
            condition: Condition::ConsulKv(ConsulKvMonitor {
                path: "test-key".to_string(),
                use_as_module_input: true,
                ..Default::default()
            }),
            module_input: None,
            buffer: None,
            working_dir: None,
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn validate_accepts_kv_task() {
        assert!(kv_task("kv").validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_name() {
        let mut task = kv_task("");
        task.name = String::new();
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_module() {
        let mut task = kv_task("kv");
        task.module.source = String::new();
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_kv_condition_without_path() {
        let mut task = kv_task("kv");
        task.condition = Condition::ConsulKv(ConsulKvMonitor::default());
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_cron() {
        let mut task = kv_task("sched");
        task.condition = Condition::Schedule {
            cron: "not a cron".to_string(),
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_input_kind() {
        let mut task = kv_task("kv");
        task.module_input = Some(ModuleInput::ConsulKv(ConsulKvMonitor {
            path: "other".to_string(),
            ..Default::default()
        }));
        assert!(task.validate().is_err());
    }

    #[test]
    fn watched_services_unions_condition_block() {
        let mut task = kv_task("kv");
        task.condition = Condition::Services(ServicesMonitor {
            names: vec!["db".to_string()],
            ..Default::default()
        });
        let watched = task.watched_services();
        let names: Vec<_> = watched.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "web"]);
    }

    #[test]
    fn status_from_history() {
        assert_eq!(TaskStatus::from_history(&[]), TaskStatus::Unknown);
        assert_eq!(TaskStatus::from_history(&[true, false]), TaskStatus::Successful);
        assert_eq!(TaskStatus::from_history(&[false, true]), TaskStatus::Errored);
        assert_eq!(TaskStatus::from_history(&[false, false, true]), TaskStatus::Critical);
    }

    #[test]
    fn scheduled_tasks_do_not_buffer() {
        let mut task = kv_task("sched");
        task.buffer = Some(BufferPeriod::default());
        task.condition = Condition::Schedule {
            cron: "0 * * * * *".to_string(),
        };
        assert!(task.effective_buffer().is_none());
        assert!(task.validate().is_ok());
    }
}
