//! Catsync - catalog-driven infrastructure sync daemon
//!
//! Watches a service catalog/KV store and keeps infrastructure converged by
//! rendering parameterised modules and driving an external plan/apply
//! executor. The pieces:
//! - a dependency watcher sharing one long-poll per catalog input
//! - a per-task template engine with lazy, fixed-point rendering
//! - per-condition notification filters and a buffered task state machine
//! - driver facades over the external executor
//! - an HTTP control API for status and task mutation

pub mod adapters;
pub mod api;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::models::config::Config;
pub use domain::models::task::Task;
