//! Template engine: per-task dependency graph and lazy rendering.
//!
//! Each task owns a render context holding the dependencies its module
//! output references. Rendering is a fixed-point loop: a pass looks every
//! needed dependency up, registering unresolved ones as pending; the engine
//! subscribes pending dependencies to the watcher and re-renders as values
//! arrive. The first pass in which every dependency has a value produces the
//! **first-completion** edge, exactly once per task. Later changes flow
//! through the task's notification filter and wake the runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::dependency::{Dependency, DependencyUpdate, DependencyValue};
use crate::domain::models::task::{Condition, ModuleInput, Task};
use crate::services::notifier;
use crate::services::watcher::{DependencyWatcher, SubscriptionId};

pub const MAIN_FILE: &str = "main.tf";
pub const VARIABLES_FILE: &str = "variables.tf";
pub const TFVARS_FILE: &str = "terraform.tfvars";
pub const RESOURCES_DIR: &str = "resources";

/// Wake signal delivered to a task runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Every dependency has resolved at least once; run the initial pass.
    FirstCompletion,
    /// A watched dependency changed and the condition filter let it through.
    DepChange(Dependency),
}

/// Outcome of one render attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    /// At least one dependency has no value yet.
    Pending,
    /// Everything resolved and nothing changed since the last render.
    Unchanged,
    Rendered {
        first_completion: bool,
    },
}

struct RenderContext {
    task: Task,
    root: PathBuf,
    values: BTreeMap<Dependency, Option<DependencyValue>>,
    dirty: bool,
    completed: bool,
    /// Resource files written by the last materialization, so stale ones
    /// can be removed.
    materialized: BTreeSet<PathBuf>,
}

impl RenderContext {
    /// Dependencies this task's rendered output references, in lookup order.
    fn needed_dependencies(task: &Task) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = task
            .watched_services()
            .into_iter()
            .map(Dependency::HealthServices)
            .collect();

        fn push_kv(
            deps: &mut Vec<Dependency>,
            path: &str,
            recurse: bool,
            dc: &Option<String>,
            ns: &Option<String>,
        ) {
            if recurse {
                deps.push(Dependency::KvKeys {
                    prefix: path.to_string(),
                    datacenter: dc.clone(),
                    namespace: ns.clone(),
                });
            } else {
                deps.push(Dependency::KvExists {
                    path: path.to_string(),
                    datacenter: dc.clone(),
                    namespace: ns.clone(),
                });
                deps.push(Dependency::KvValue {
                    path: path.to_string(),
                    datacenter: dc.clone(),
                    namespace: ns.clone(),
                });
            }
        }

        match &task.condition {
            Condition::CatalogServices(monitor) => deps.push(Dependency::CatalogServices {
                datacenter: monitor.datacenter.clone(),
                namespace: monitor.namespace.clone(),
                node_meta: monitor.node_meta.clone(),
            }),
            Condition::ConsulKv(monitor) => push_kv(
                &mut deps,
                &monitor.path,
                monitor.recurse,
                &monitor.datacenter,
                &monitor.namespace,
            ),
            Condition::Services { .. } | Condition::Schedule { .. } => {}
        }

        match &task.module_input {
            Some(ModuleInput::CatalogServices(monitor)) => {
                deps.push(Dependency::CatalogServices {
                    datacenter: monitor.datacenter.clone(),
                    namespace: monitor.namespace.clone(),
                    node_meta: monitor.node_meta.clone(),
                })
            }
            Some(ModuleInput::ConsulKv(monitor)) => push_kv(
                &mut deps,
                &monitor.path,
                monitor.recurse,
                &monitor.datacenter,
                &monitor.namespace,
            ),
            Some(ModuleInput::Services(_)) | None => {}
        }

        deps
    }

    /// One fixed-point pass: look up every needed dependency, registering
    /// unresolved ones, and render when all have values.
    fn render_pass(&mut self) -> DomainResult<(RenderOutcome, Vec<Dependency>)> {
        let mut newly_registered = Vec::new();
        let mut pending = false;
        for dep in Self::needed_dependencies(&self.task) {
            match self.values.get(&dep) {
                Some(Some(_)) => {}
                Some(None) => pending = true,
                None => {
                    self.values.insert(dep.clone(), None);
                    newly_registered.push(dep);
                    pending = true;
                }
            }
        }
        if pending {
            return Ok((RenderOutcome::Pending, newly_registered));
        }
        if !self.dirty && self.completed {
            return Ok((RenderOutcome::Unchanged, newly_registered));
        }

        self.write_files()?;
        self.dirty = false;
        let first_completion = !self.completed;
        self.completed = true;
        Ok((RenderOutcome::Rendered { first_completion }, newly_registered))
    }

    fn store(&mut self, update: &DependencyUpdate) {
        let slot = self
            .values
            .entry(update.dependency.clone())
            .or_insert(None);
        if slot.as_ref() != Some(&update.value) {
            *slot = Some(update.value.clone());
            self.dirty = true;
        }
    }

    fn kv_entries(&self) -> Option<BTreeMap<String, String>> {
        let mut entries = BTreeMap::new();
        let mut kv_watched = false;
        let mut exists = BTreeMap::new();
        for (dep, value) in &self.values {
            match (dep, value) {
                (Dependency::KvExists { path, .. }, Some(DependencyValue::KvExists(e))) => {
                    exists.insert(path.clone(), *e);
                }
                (Dependency::KvValue { path, .. }, Some(DependencyValue::KvValue(v))) => {
                    kv_watched = true;
                    if let Some(v) = v {
                        entries.insert(path.clone(), v.clone());
                    }
                }
                (Dependency::KvKeys { .. }, Some(DependencyValue::KvKeys(pairs))) => {
                    kv_watched = true;
                    for pair in pairs {
                        entries.insert(pair.key.clone(), pair.value.clone());
                    }
                }
                _ => {}
            }
        }
        // A key reported absent renders nothing even if a stale value slot
        // remains.
        entries.retain(|k, _| exists.get(k).copied().unwrap_or(true));
        kv_watched.then_some(entries)
    }

    fn service_entries(&self) -> Vec<&crate::domain::models::dependency::ServiceInstance> {
        let mut services = Vec::new();
        for (dep, value) in &self.values {
            if let (
                Dependency::HealthServices(_),
                Some(DependencyValue::HealthServices(instances)),
            ) = (dep, value)
            {
                services.extend(instances.iter());
            }
        }
        services
    }

    fn catalog_service_entries(&self) -> Option<BTreeMap<String, Vec<String>>> {
        let monitor = match (&self.task.condition, &self.task.module_input) {
            (Condition::CatalogServices(monitor), _) => monitor,
            (_, Some(ModuleInput::CatalogServices(monitor))) => monitor,
            _ => return None,
        };
        let regexp = Regex::new(&monitor.regexp).ok()?;
        for (dep, value) in &self.values {
            if let (
                Dependency::CatalogServices { .. },
                Some(DependencyValue::CatalogServices(services)),
            ) = (dep, value)
            {
                return Some(
                    services
                        .iter()
                        .filter(|(name, _)| regexp.is_match(name))
                        .map(|(name, tags)| (name.clone(), tags.clone()))
                        .collect(),
                );
            }
        }
        Some(BTreeMap::new())
    }

    fn write_files(&self) -> DomainResult<()> {
        fs::create_dir_all(&self.root)?;

        let mut main = String::new();
        main.push_str(&format!("module \"{}\" {{\n", self.task.name));
        main.push_str(&format!("  source = \"{}\"\n", self.task.module.source));
        if let Some(version) = &self.task.module.version {
            main.push_str(&format!("  version = \"{version}\"\n"));
        }
        main.push_str("  services = var.services\n");
        if self.kv_entries().is_some() {
            main.push_str("  consul_kv = var.consul_kv\n");
        }
        if self.catalog_service_entries().is_some() {
            main.push_str("  catalog_services = var.catalog_services\n");
        }
        for (key, value) in &self.task.variables {
            main.push_str(&format!("  {key} = \"{}\"\n", escape(value)));
        }
        main.push_str("}\n");
        fs::write(self.root.join(MAIN_FILE), main)?;

        let mut variables = String::new();
        variables.push_str("variable \"services\" {\n  type = any\n}\n");
        if self.kv_entries().is_some() {
            variables.push_str("variable \"consul_kv\" {\n  type = map(string)\n}\n");
        }
        if self.catalog_service_entries().is_some() {
            variables.push_str("variable \"catalog_services\" {\n  type = map(list(string))\n}\n");
        }
        fs::write(self.root.join(VARIABLES_FILE), variables)?;

        fs::write(self.root.join(TFVARS_FILE), self.render_tfvars())?;
        Ok(())
    }

    fn render_tfvars(&self) -> String {
        let mut out = String::new();

        out.push_str("services = {\n");
        for instance in self.service_entries() {
            out.push_str(&format!(
                "  \"{}.{}\" = {{\n    name    = \"{}\"\n    id      = \"{}\"\n    \
                 address = \"{}\"\n    port    = {}\n  }}\n",
                escape(&instance.name),
                escape(&instance.id),
                escape(&instance.name),
                escape(&instance.id),
                escape(&instance.address),
                instance.port
            ));
        }
        out.push_str("}\n");

        if let Some(entries) = self.kv_entries() {
            out.push_str("consul_kv = {\n");
            for (key, value) in &entries {
                out.push_str(&format!("  \"{}\" = \"{}\"\n", escape(key), escape(value)));
            }
            out.push_str("}\n");
        }

        if let Some(services) = self.catalog_service_entries() {
            out.push_str("catalog_services = {\n");
            for (name, tags) in &services {
                let tags = tags
                    .iter()
                    .map(|t| format!("\"{}\"", escape(t)))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push_str(&format!("  \"{}\" = [{tags}]\n", escape(name)));
            }
            out.push_str("}\n");
        }

        out
    }

    /// Emulate a local file module: one artifact per rendered input, stale
    /// artifacts removed. Used by the development driver and tests.
    fn materialize_resources(&mut self) -> DomainResult<()> {
        let dir = self.root.join(RESOURCES_DIR);
        fs::create_dir_all(&dir)?;

        let mut written = BTreeSet::new();
        for instance in self.service_entries() {
            let path = dir.join(format!("{}.txt", instance.name));
            fs::write(&path, format!("{}:{}\n", instance.address, instance.port))?;
            written.insert(path);
        }
        if let Some(entries) = self.kv_entries() {
            for (key, value) in &entries {
                let path = dir.join(format!("{key}.txt"));
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, value)?;
                written.insert(path);
            }
        }

        for stale in self.materialized.difference(&written) {
            let _ = fs::remove_file(stale);
        }
        self.materialized = written;
        Ok(())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Cloneable handle to one task's render context, shared between the
/// engine's fan-in loop and the task's driver.
#[derive(Clone)]
pub struct TaskTemplate {
    inner: Arc<Mutex<RenderContext>>,
}

impl TaskTemplate {
    pub fn new(task: &Task, working_root: &Path) -> Self {
        let root = task
            .working_dir
            .clone()
            .unwrap_or_else(|| working_root.join(&task.name));
        Self {
            inner: Arc::new(Mutex::new(RenderContext {
                task: task.clone(),
                root,
                values: BTreeMap::new(),
                dirty: false,
                completed: false,
                materialized: BTreeSet::new(),
            })),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.inner.lock().expect("template lock").root.clone()
    }

    pub fn task(&self) -> Task {
        self.inner.lock().expect("template lock").task.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().expect("template lock").task.enabled = enabled;
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().expect("template lock").completed
    }

    pub fn store(&self, update: &DependencyUpdate) {
        self.inner.lock().expect("template lock").store(update);
    }

    /// Attempt a render; returns the outcome and any dependencies the pass
    /// newly registered.
    pub fn render(&self) -> DomainResult<(RenderOutcome, Vec<Dependency>)> {
        let mut ctx = self.inner.lock().expect("template lock");
        let task = ctx.task.name.clone();
        ctx.render_pass().map_err(|e| DomainError::TemplateRender {
            task,
            reason: e.to_string(),
        })
    }

    pub fn materialize_resources(&self) -> DomainResult<()> {
        self.inner
            .lock()
            .expect("template lock")
            .materialize_resources()
    }
}

/// Handle to a registered task: its template, its wake channel, and the
/// once-mode completion signal.
pub struct TaskMonitor {
    pub template: TaskTemplate,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub first_completion: watch::Receiver<bool>,
    guard: MonitorGuard,
}

impl TaskMonitor {
    /// Split into the pieces different owners need: the runtime takes the
    /// notification channel, the controller keeps the guard for teardown.
    pub fn into_parts(
        self,
    ) -> (
        TaskTemplate,
        mpsc::UnboundedReceiver<Notification>,
        watch::Receiver<bool>,
        MonitorGuard,
    ) {
        (
            self.template,
            self.notifications,
            self.first_completion,
            self.guard,
        )
    }
}

/// Owns a registered task's fan-in loop and watcher subscriptions.
pub struct MonitorGuard {
    subscriptions: Vec<(Dependency, SubscriptionId)>,
    fan_in: JoinHandle<()>,
}

impl MonitorGuard {
    /// Stop the fan-in loop and release every subscription.
    pub fn release(self, watcher: &DependencyWatcher) {
        self.fan_in.abort();
        for (dep, id) in &self.subscriptions {
            watcher.unsubscribe(dep, *id);
        }
    }
}

/// Factory wiring tasks into the watcher.
pub struct TemplateEngine {
    watcher: DependencyWatcher,
    working_root: PathBuf,
}

impl TemplateEngine {
    pub fn new(watcher: DependencyWatcher, working_root: PathBuf) -> Self {
        Self {
            watcher,
            working_root,
        }
    }

    pub fn watcher(&self) -> &DependencyWatcher {
        &self.watcher
    }

    /// Register a task: build its render context, subscribe its
    /// dependencies, and start the fan-in loop that stores values, filters
    /// changes through the condition's notifier, and emits wakes.
    pub fn register(&self, task: &Task) -> DomainResult<TaskMonitor> {
        let template = TaskTemplate::new(task, &self.working_root);
        let mut filter = notifier::filter_for(&task.condition)?;
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let (fc_tx, fc_rx) = watch::channel(false);

        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<DependencyUpdate>();
        let (outcome, pending) = template.render()?;
        let mut subscriptions = Vec::new();
        for dep in pending {
            let (id, mut rx) = self.watcher.subscribe(dep.clone());
            let tx = update_tx.clone();
            tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    if tx.send(update).is_err() {
                        break;
                    }
                }
            });
            subscriptions.push((dep, id));
        }
        drop(update_tx);

        // A task with no dependencies completes immediately.
        if matches!(outcome, RenderOutcome::Rendered { first_completion: true }) {
            let _ = fc_tx.send(true);
            let _ = note_tx.send(Notification::FirstCompletion);
        }

        let fan_in_template = template.clone();
        let task_name = task.name.to_string();
        let fan_in = tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                fan_in_template.store(&update);
                if update.degraded {
                    tracing::warn!(
                        target: "catsync::template",
                        task = %task_name,
                        dependency = %update.dependency,
                        "dependency degraded, using last known value"
                    );
                    continue;
                }
                if !fan_in_template.is_completed() {
                    match fan_in_template.render() {
                        Ok((RenderOutcome::Rendered { first_completion }, _)) => {
                            if first_completion {
                                let _ = fc_tx.send(true);
                                let _ = note_tx.send(Notification::FirstCompletion);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(
                                target: "catsync::template",
                                task = %task_name,
                                error = %err,
                                "initial render failed"
                            );
                        }
                    }
                } else if filter.should_notify(&update) {
                    let _ = note_tx.send(Notification::DepChange(update.dependency.clone()));
                }
            }
        });

        Ok(TaskMonitor {
            template,
            notifications: note_rx,
            first_completion: fc_rx,
            guard: MonitorGuard {
                subscriptions,
                fan_in,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::dependency::ServiceInstance;
    use crate::domain::models::task::{ConsulKvMonitor, ModuleRef, ServiceSelector};

    fn kv_task(dir: &Path) -> Task {
        Task {
            name: "kv".to_string(),
            enabled: true,
            description: String::new(),
            module: ModuleRef {
                source: "./modules/kv-file".to_string(),
                version: None,
            },
            services: vec![ServiceSelector::named("web")],
            condition: Condition::ConsulKv(ConsulKvMonitor {
                path: "test-key".to_string(),
                use_as_module_input: true,
                ..Default::default()
            }),
            module_input: None,
            buffer: None,
            working_dir: Some(dir.to_path_buf()),
            variables: BTreeMap::new(),
        }
    }

    fn update(dep: Dependency, value: DependencyValue) -> DependencyUpdate {
        DependencyUpdate {
            dependency: dep,
            value,
            index: 1,
            degraded: false,
        }
    }

    fn kv_value_dep() -> Dependency {
        Dependency::KvValue {
            path: "test-key".to_string(),
            datacenter: None,
            namespace: None,
        }
    }

    fn kv_exists_dep() -> Dependency {
        Dependency::KvExists {
            path: "test-key".to_string(),
            datacenter: None,
            namespace: None,
        }
    }

    fn web_dep() -> Dependency {
        Dependency::HealthServices(ServiceSelector::named("web"))
    }

    fn resolve_all(template: &TaskTemplate, kv: Option<&str>) {
        template.store(&update(
            web_dep(),
            DependencyValue::HealthServices(vec![ServiceInstance {
                id: "web-1".to_string(),
                name: "web".to_string(),
                address: "10.0.0.1".to_string(),
                port: 80,
                ..Default::default()
            }]),
        ));
        template.store(&update(
            kv_exists_dep(),
            DependencyValue::KvExists(kv.is_some()),
        ));
        template.store(&update(
            kv_value_dep(),
            DependencyValue::KvValue(kv.map(str::to_string)),
        ));
    }

    #[test]
    fn render_is_pending_until_all_deps_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let template = TaskTemplate::new(&kv_task(dir.path()), dir.path());

        let (outcome, pending) = template.render().unwrap();
        assert_eq!(outcome, RenderOutcome::Pending);
        // web + kv-exists + kv-value, each registered exactly once.
        assert_eq!(pending.len(), 3);

        // A second pass registers nothing new.
        let (outcome, pending) = template.render().unwrap();
        assert_eq!(outcome, RenderOutcome::Pending);
        assert!(pending.is_empty());
    }

    #[test]
    fn first_complete_render_reports_first_completion_once() {
        let dir = tempfile::tempdir().unwrap();
        let template = TaskTemplate::new(&kv_task(dir.path()), dir.path());
        let _ = template.render().unwrap();
        resolve_all(&template, None);

        let (outcome, _) = template.render().unwrap();
        assert_eq!(
            outcome,
            RenderOutcome::Rendered {
                first_completion: true
            }
        );

        let (outcome, _) = template.render().unwrap();
        assert_eq!(outcome, RenderOutcome::Unchanged);
    }

    #[test]
    fn absent_key_renders_empty_kv_block() {
        let dir = tempfile::tempdir().unwrap();
        let template = TaskTemplate::new(&kv_task(dir.path()), dir.path());
        let _ = template.render().unwrap();
        resolve_all(&template, None);
        let _ = template.render().unwrap();

        let tfvars = fs::read_to_string(template.working_dir().join(TFVARS_FILE)).unwrap();
        assert!(tfvars.contains("consul_kv = {\n}"), "got: {tfvars}");
        assert!(tfvars.contains("\"web.web-1\""));
    }

    #[test]
    fn present_key_renders_value_and_materializes_resource() {
        let dir = tempfile::tempdir().unwrap();
        let template = TaskTemplate::new(&kv_task(dir.path()), dir.path());
        let _ = template.render().unwrap();
        resolve_all(&template, Some("test-value"));
        let _ = template.render().unwrap();
        template.materialize_resources().unwrap();

        let tfvars = fs::read_to_string(template.working_dir().join(TFVARS_FILE)).unwrap();
        assert!(tfvars.contains("\"test-key\" = \"test-value\""));

        let resource = template
            .working_dir()
            .join(RESOURCES_DIR)
            .join("test-key.txt");
        assert_eq!(fs::read_to_string(resource).unwrap(), "test-value");
    }

    #[test]
    fn deleted_key_removes_stale_resource() {
        let dir = tempfile::tempdir().unwrap();
        let template = TaskTemplate::new(&kv_task(dir.path()), dir.path());
        let _ = template.render().unwrap();
        resolve_all(&template, Some("test-value"));
        let _ = template.render().unwrap();
        template.materialize_resources().unwrap();

        template.store(&update(kv_exists_dep(), DependencyValue::KvExists(false)));
        template.store(&update(kv_value_dep(), DependencyValue::KvValue(None)));
        let _ = template.render().unwrap();
        template.materialize_resources().unwrap();

        let resource = template
            .working_dir()
            .join(RESOURCES_DIR)
            .join("test-key.txt");
        assert!(!resource.exists());
    }

    #[tokio::test]
    async fn engine_emits_first_completion_for_dependency_free_task() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(crate::adapters::catalog::fake::FakeCatalog::new());
        let watcher = DependencyWatcher::new(catalog, Default::default());
        let engine = TemplateEngine::new(watcher, dir.path().to_path_buf());

        let task = Task {
            services: vec![],
            condition: Condition::Schedule {
                cron: "0 * * * * *".to_string(),
            },
            ..kv_task(dir.path())
        };
        let mut monitor = engine.register(&task).unwrap();
        assert_eq!(
            monitor.notifications.recv().await,
            Some(Notification::FirstCompletion)
        );
        assert!(*monitor.first_completion.borrow());
    }
}
