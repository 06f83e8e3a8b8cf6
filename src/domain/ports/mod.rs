//! Ports: traits at the seams between the daemon and its collaborators.

pub mod catalog;
pub mod driver;

pub use catalog::{
    AgentInfo, Catalog, License, QueryMeta, QueryOptions, ServiceCheck, ServiceRegistration,
};
pub use driver::{Driver, Plan, RunOption, TaskPatch};
