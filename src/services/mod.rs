//! Services: the daemon's core runtime components.

pub mod controller;
pub mod event_store;
pub mod notifier;
pub mod registration;
pub mod task_runtime;
pub mod template;
pub mod watcher;

pub use controller::{Controller, ControllerConfig, DriverFactory, StatusSummary, TaskStatusReport};
pub use event_store::EventStore;
pub use registration::RegistrationManager;
pub use task_runtime::{RunState, TaskHandle, TaskRuntime};
pub use template::{TaskTemplate, TemplateEngine};
pub use watcher::{DependencyWatcher, WatcherConfig};
