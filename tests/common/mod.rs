//! Shared fixtures for integration tests: an in-memory catalog, a
//! controller wired like the daemon, and polling helpers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use catsync::adapters::catalog::FakeCatalog;
use catsync::adapters::driver::{MockDriver, PrinterDriver};
use catsync::domain::models::task::{
    BufferPeriod, Condition, ConsulKvMonitor, ModuleRef, ServiceSelector, ServicesMonitor, Task,
};
use catsync::domain::models::dependency::ServiceInstance;
use catsync::domain::ports::catalog::Catalog;
use catsync::services::{
    Controller, ControllerConfig, DependencyWatcher, DriverFactory, EventStore, TemplateEngine,
    WatcherConfig,
};

pub struct TestDaemon {
    pub catalog: Arc<FakeCatalog>,
    pub controller: Arc<Controller>,
    pub events: Arc<EventStore>,
    pub mock_drivers: Arc<Mutex<HashMap<String, Arc<MockDriver>>>>,
    pub dir: tempfile::TempDir,
}

pub fn instance(service: &str, id: &str) -> ServiceInstance {
    ServiceInstance {
        id: id.to_string(),
        name: service.to_string(),
        address: "10.0.0.1".to_string(),
        port: 8080,
        ..Default::default()
    }
}

/// Short coalescing window: a KV mutation flips both the exists and value
/// dependencies, and the burst must produce one run.
pub fn test_buffer() -> BufferPeriod {
    BufferPeriod::new(Duration::from_millis(100), Duration::from_millis(400))
}

/// A task with a consul-kv condition on `test-key`, watching `web` and
/// `api`.
pub fn kv_task(name: &str, recurse: bool) -> Task {
    Task {
        name: name.to_string(),
        enabled: true,
        description: String::new(),
        module: ModuleRef {
            source: "./test_modules/consul_kv_file".to_string(),
            version: None,
        },
        services: vec![ServiceSelector::named("web"), ServiceSelector::named("api")],
        condition: Condition::ConsulKv(ConsulKvMonitor {
            path: "test-key".to_string(),
            recurse,
            use_as_module_input: true,
            ..Default::default()
        }),
        module_input: None,
        buffer: Some(test_buffer()),
        working_dir: None,
        variables: Default::default(),
    }
}

/// A task triggered by instance changes of `api`.
pub fn services_task(name: &str) -> Task {
    Task {
        name: name.to_string(),
        enabled: true,
        description: String::new(),
        module: ModuleRef {
            source: "./test_modules/local_instances_file".to_string(),
            version: None,
        },
        services: Vec::new(),
        condition: Condition::Services(ServicesMonitor {
            names: vec!["api".to_string()],
            ..Default::default()
        }),
        module_input: None,
        buffer: Some(test_buffer()),
        working_dir: None,
        variables: Default::default(),
    }
}

fn fast_watcher() -> WatcherConfig {
    WatcherConfig {
        wait_time: Duration::from_millis(500),
        failure_threshold: 3,
        quiescent_delay: Duration::from_millis(100),
        retry_base: Duration::from_millis(10),
        retry_cap: Duration::from_millis(100),
    }
}

pub enum Drivers {
    Printer,
    Mock,
}

/// Build a daemon (fake catalog, controller, event store) and run once-mode
/// over the given tasks.
pub async fn start_daemon_with_catalog(
    catalog: Arc<FakeCatalog>,
    tasks: Vec<Task>,
    drivers: Drivers,
) -> TestDaemon {
    start_daemon_opts(catalog, tasks, drivers, Duration::from_secs(5)).await
}

pub async fn start_daemon_opts(
    catalog: Arc<FakeCatalog>,
    tasks: Vec<Task>,
    drivers: Drivers,
    once_timeout: Duration,
) -> TestDaemon {
    let events = Arc::new(EventStore::new(5));
    let catalog_port: Arc<dyn Catalog> = catalog.clone();
    let watcher = DependencyWatcher::new(catalog_port, fast_watcher());
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = TemplateEngine::new(watcher, dir.path().to_path_buf());

    let mock_drivers: Arc<Mutex<HashMap<String, Arc<MockDriver>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let factory: DriverFactory = match drivers {
        Drivers::Printer => Arc::new(|task, template| Arc::new(PrinterDriver::new(task, template))),
        Drivers::Mock => {
            let registry = Arc::clone(&mock_drivers);
            Arc::new(move |task, _template| {
                let driver = Arc::new(MockDriver::new(task.clone()));
                registry
                    .lock()
                    .expect("mock registry")
                    .insert(task.name.clone(), Arc::clone(&driver));
                driver
            })
        }
    };

    let controller = Arc::new(Controller::new(
        engine,
        Arc::clone(&events),
        factory,
        ControllerConfig {
            default_buffer: BufferPeriod::new(Duration::ZERO, Duration::ZERO),
            once_timeout,
        },
    ));
    controller
        .init_once(tasks, false)
        .await
        .expect("once-mode startup");

    TestDaemon {
        catalog,
        controller,
        events,
        mock_drivers,
        dir,
    }
}

/// Poll until the task has at least `count` events.
pub async fn wait_for_events(events: &EventStore, task: &str, count: usize) {
    for _ in 0..150 {
        if events.task_events(task).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "task '{task}' never reached {count} events; have {}",
        events.task_events(task).len()
    );
}

/// Give the daemon a window to (not) react before asserting on a count.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}
