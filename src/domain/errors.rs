//! Domain errors for the catsync daemon.

use thiserror::Error;

/// Domain-level errors that can occur while synchronizing tasks.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Catalog unreachable: {0}")]
    CatalogUnreachable(String),

    #[error("Catalog rejected request: {0}")]
    CatalogBadRequest(String),

    #[error("Template render failed for task '{task}': {reason}")]
    TemplateRender { task: String, reason: String },

    #[error("Driver initialization failed for task '{task}': {reason}")]
    DriverInit { task: String, reason: String },

    #[error("Driver apply failed for task '{task}': {reason}")]
    DriverApply { task: String, reason: String },

    #[error("Buffer period cancelled for task '{0}'")]
    BufferCancelled(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{0}' is currently running")]
    TaskActive(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Io(err.to_string())
    }
}
