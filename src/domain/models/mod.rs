//! Domain models.

pub mod config;
pub mod dependency;
pub mod event;
pub mod task;

pub use config::{ApiConfig, CatalogConfig, Config, DriverConfig, DriverKind, LogConfig, TlsConfig};
pub use dependency::{Dependency, DependencyUpdate, DependencyValue, KeyPair, ServiceInstance};
pub use event::{Event, EventRecorder, TaskSnapshot};
pub use task::{
    BufferPeriod, CatalogServicesMonitor, Condition, ConsulKvMonitor, ModuleInput, ModuleRef,
    ServiceSelector, ServicesMonitor, Task, TaskStatus,
};
