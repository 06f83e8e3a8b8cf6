//! Self-registration of the daemon as a catalog service.

use std::sync::Arc;

use crate::domain::errors::DomainResult;
use crate::domain::models::config::Config;
use crate::domain::ports::catalog::{Catalog, ServiceCheck, ServiceRegistration};

const SERVICE_NAME: &str = "Consul-Terraform-Sync";
const SERVICE_TAG: &str = "cts";
const CHECK_NAME: &str = "CTS Health Status";
const CHECK_NOTES: &str = "Check created by Consul-Terraform-Sync";
const DEREGISTER_AFTER: &str = "30m";

pub struct RegistrationManager {
    catalog: Arc<dyn Catalog>,
    service: ServiceRegistration,
}

impl RegistrationManager {
    pub fn new(config: &Config, catalog: Arc<dyn Catalog>) -> Self {
        let protocol = if config.api.tls.enabled {
            "https"
        } else {
            "http"
        };
        let check = ServiceCheck {
            name: CHECK_NAME.to_string(),
            check_id: format!("{}-health", config.id),
            notes: CHECK_NOTES.to_string(),
            http: format!("{protocol}://localhost:{}/v1/status", config.api.port),
            method: "GET".to_string(),
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            deregister_critical_service_after: DEREGISTER_AFTER.to_string(),
            tls_skip_verify: true,
            status: "critical".to_string(),
        };
        Self {
            catalog,
            service: ServiceRegistration {
                id: config.id.clone(),
                name: SERVICE_NAME.to_string(),
                tags: vec![SERVICE_TAG.to_string()],
                port: config.api.port,
                namespace: config.catalog.self_registration.namespace.clone(),
                checks: vec![check],
            },
        }
    }

    /// Register the daemon. Failures are surfaced but should not be fatal
    /// to startup; the caller decides.
    pub async fn register(&self) -> DomainResult<()> {
        tracing::debug!(
            target: "catsync::registration",
            name = SERVICE_NAME,
            id = %self.service.id,
            "registering service with catalog"
        );
        self.catalog.register_service(&self.service).await
    }

    pub async fn deregister(&self) -> DomainResult<()> {
        self.catalog.deregister_service(&self.service.id).await
    }
}
