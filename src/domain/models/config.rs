//! Daemon configuration model.
//!
//! Loaded hierarchically by `infrastructure::config::ConfigLoader`; this
//! module only defines the shape and the programmatic defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{BufferPeriod, Task};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// One of: trace, debug, info, warn, error.
    pub level: String,
    /// One of: json, pretty.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// TLS settings for the control API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

/// HTTP control API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    /// Bearer token required on every request when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8558,
            auth_token: None,
            tls: TlsConfig::default(),
        }
    }
}

/// Self-registration of the daemon as a catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfRegistrationConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for SelfRegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: None,
        }
    }
}

/// Connection settings for the backing service catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub self_registration: SelfRegistrationConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8500".to_string(),
            token: None,
            datacenter: None,
            namespace: None,
            self_registration: SelfRegistrationConfig::default(),
        }
    }
}

/// Which driver implementation executes tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Spawn the external executor binary per task.
    Terraform,
    /// Print intended operations without executing; development only.
    Printer,
}

/// External executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub kind: DriverKind,
    /// Path to the executor binary.
    pub bin: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Terraform,
            bin: PathBuf::from("terraform"),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique instance id, used for self-registration.
    pub id: String,
    /// Root directory for per-task working directories.
    pub working_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    /// Buffer period applied to tasks that do not set their own.
    #[serde(default)]
    pub buffer: BufferPeriod,
    /// Once-mode gives every task this long to reach first-completion and
    /// run before steady state starts.
    pub once_timeout_secs: u64,
    /// Ring capacity of the per-task event store.
    pub event_buffer_size: usize,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: format!("catsync-{}", Uuid::new_v4().simple()),
            working_dir: PathBuf::from("sync-tasks"),
            log: LogConfig::default(),
            api: ApiConfig::default(),
            catalog: CatalogConfig::default(),
            driver: DriverConfig::default(),
            buffer: BufferPeriod::default(),
            once_timeout_secs: 60,
            event_buffer_size: 5,
            tasks: Vec::new(),
        }
    }
}
