//! HTTP catalog client backed by reqwest.
//!
//! Wraps the catalog's HTTP API with the retry policy from [`super::retry`]
//! and maps wire shapes onto domain types. Blocking queries are expressed
//! with `index`/`wait` query parameters; the caller's future can be dropped
//! to cancel an in-flight poll.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::CatalogConfig;
use crate::domain::models::dependency::{KeyPair, ServiceInstance};
use crate::domain::models::task::ServiceSelector;
use crate::domain::ports::catalog::{
    AgentInfo, Catalog, License, QueryMeta, QueryOptions, ServiceRegistration,
};

use super::retry::with_retry;

const INDEX_HEADER: &str = "X-Consul-Index";
const CACHE_HEADER: &str = "X-Cache";
const TOKEN_HEADER: &str = "X-Consul-Token";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Catalog client speaking the HTTP API of a Consul-compatible agent.
pub struct HttpCatalog {
    base: String,
    http: reqwest::Client,
    token: Option<String>,
    datacenter: Option<String>,
    namespace: Option<String>,
}

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> DomainResult<Self> {
        let base = config.address.trim_end_matches('/').to_string();
        if base.is_empty() {
            return Err(DomainError::ConfigInvalid(
                "catalog address must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| DomainError::ConfigInvalid(format!("catalog http client: {e}")))?;
        Ok(Self {
            base,
            http,
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            namespace: config.namespace.clone(),
        })
    }

    fn query_params(&self, opts: &QueryOptions) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(dc) = opts.datacenter.as_ref().or(self.datacenter.as_ref()) {
            params.push(("dc".to_string(), dc.clone()));
        }
        if let Some(ns) = opts.namespace.as_ref().or(self.namespace.as_ref()) {
            params.push(("ns".to_string(), ns.clone()));
        }
        if let Some(index) = opts.wait_index {
            params.push(("index".to_string(), index.to_string()));
        }
        if let Some(wait) = opts.wait_time {
            params.push(("wait".to_string(), format!("{}s", wait.as_secs())));
        }
        if opts.stale {
            params.push(("stale".to_string(), String::new()));
        }
        params
    }

    async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        // Blocking reads can legitimately outlast the default client timeout.
        wait_time: Option<Duration>,
    ) -> DomainResult<reqwest::Response> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.http.get(&url).query(params);
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(wait) = wait_time {
            // The catalog may hold the request up to wait + ~wait/16.
            req = req.timeout(wait + wait / 8 + Duration::from_secs(1));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DomainError::CatalogUnreachable(format!("GET {path}: {e}")))?;
        classify_status(path, resp)
    }

    /// Probe license entitlement: on an entitled edition, fetch the current
    /// license and surface its expiry; otherwise a no-op.
    pub async fn probe_license(&self) -> DomainResult<Option<License>> {
        let info = self.agent_self().await?;
        if !info.requires_entitlement() {
            tracing::debug!(
                target: "catsync::catalog",
                version = %info.version,
                "agent edition requires no entitlement, skipping license probe"
            );
            return Ok(None);
        }
        let license = self.operator_license(QueryOptions::default()).await?;
        tracing::info!(
            target: "catsync::catalog",
            license_id = %license.license_id,
            expires = %license.expiration_time,
            "catalog license detected"
        );
        Ok(Some(license))
    }
}

fn classify_status(path: &str, resp: reqwest::Response) -> DomainResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(resp);
    }
    if status.is_server_error() {
        Err(DomainError::CatalogUnreachable(format!(
            "GET {path}: status {status}"
        )))
    } else {
        Err(DomainError::CatalogBadRequest(format!(
            "GET {path}: status {status}"
        )))
    }
}

fn response_meta(resp: &reqwest::Response) -> QueryMeta {
    let index = resp
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let cached = resp.headers().contains_key(CACHE_HEADER);
    QueryMeta { index, cached }
}

fn decode_kv_value(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireNode {
    node: String,
    address: String,
    #[serde(default)]
    datacenter: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireCheck {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireHealthEntry {
    node: WireNode,
    service: WireService,
    #[serde(default)]
    checks: Vec<WireCheck>,
}

impl WireHealthEntry {
    fn into_instance(self) -> ServiceInstance {
        // The instance status is the worst of its checks.
        let status = self
            .checks
            .iter()
            .map(|c| c.status.as_str())
            .max_by_key(|s| match *s {
                "passing" => 0,
                "warning" => 1,
                _ => 2,
            })
            .unwrap_or("passing")
            .to_string();
        let address = if self.service.address.is_empty() {
            self.node.address.clone()
        } else {
            self.service.address
        };
        ServiceInstance {
            id: self.service.id,
            name: self.service.service,
            address,
            port: self.service.port,
            datacenter: self.node.datacenter,
            tags: self.service.tags,
            namespace: self.service.namespace,
            status,
            node: self.node.node,
            node_address: self.node.address,
            meta: self.service.meta.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireKvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAgentSelf {
    #[serde(rename = "Config")]
    config: WireAgentConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireAgentConfig {
    version: String,
    #[serde(default)]
    datacenter: String,
}

#[derive(Debug, Deserialize)]
struct WireLicenseResponse {
    #[serde(rename = "License")]
    license: WireLicense,
}

#[derive(Debug, Deserialize)]
struct WireLicense {
    license_id: String,
    expiration_time: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn health_services(
        &self,
        selector: &ServiceSelector,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<ServiceInstance>, QueryMeta)> {
        let path = format!("/v1/health/service/{}", selector.name);
        let mut params = self.query_params(&opts);
        if let Some(dc) = &selector.datacenter {
            params.retain(|(k, _)| k != "dc");
            params.push(("dc".to_string(), dc.clone()));
        }
        if let Some(ns) = &selector.namespace {
            params.retain(|(k, _)| k != "ns");
            params.push(("ns".to_string(), ns.clone()));
        }
        if let Some(tag) = &selector.tag {
            params.push(("tag".to_string(), tag.clone()));
        }
        if let Some(filter) = &selector.filter {
            params.push(("filter".to_string(), filter.clone()));
        }
        with_retry("health_services", || {
            let path = path.clone();
            let params = params.clone();
            async move {
                let resp = self.get(&path, &params, opts.wait_time).await?;
                let meta = response_meta(&resp);
                let entries: Vec<WireHealthEntry> = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("{path}: {e}")))?;
                let mut instances: Vec<ServiceInstance> =
                    entries.into_iter().map(WireHealthEntry::into_instance).collect();
                instances.sort_by(|a, b| a.id.cmp(&b.id));
                Ok((instances, meta))
            }
        })
        .await
    }

    async fn catalog_services(
        &self,
        node_meta: &BTreeMap<String, String>,
        opts: QueryOptions,
    ) -> DomainResult<(BTreeMap<String, Vec<String>>, QueryMeta)> {
        let mut params = self.query_params(&opts);
        for (key, value) in node_meta {
            params.push(("node-meta".to_string(), format!("{key}:{value}")));
        }
        with_retry("catalog_services", || {
            let params = params.clone();
            async move {
                let resp = self.get("/v1/catalog/services", &params, opts.wait_time).await?;
                let meta = response_meta(&resp);
                let services: BTreeMap<String, Vec<String>> = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("catalog/services: {e}")))?;
                Ok((services, meta))
            }
        })
        .await
    }

    async fn kv_get(
        &self,
        path: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Option<String>, QueryMeta)> {
        let url_path = format!("/v1/kv/{path}");
        let params = self.query_params(&opts);
        with_retry("kv_get", || {
            let url_path = url_path.clone();
            let params = params.clone();
            async move {
                let resp = self.get(&url_path, &params, opts.wait_time).await?;
                let meta = response_meta(&resp);
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok((None, meta));
                }
                let entries: Vec<WireKvEntry> = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("{url_path}: {e}")))?;
                let value = entries
                    .into_iter()
                    .next()
                    .and_then(|e| e.value)
                    .map(|raw| decode_kv_value(&raw));
                Ok((value, meta))
            }
        })
        .await
    }

    async fn kv_list(
        &self,
        prefix: &str,
        opts: QueryOptions,
    ) -> DomainResult<(Vec<KeyPair>, QueryMeta)> {
        let url_path = format!("/v1/kv/{prefix}");
        let mut params = self.query_params(&opts);
        params.push(("recurse".to_string(), "true".to_string()));
        with_retry("kv_list", || {
            let url_path = url_path.clone();
            let params = params.clone();
            async move {
                let resp = self.get(&url_path, &params, opts.wait_time).await?;
                let meta = response_meta(&resp);
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok((Vec::new(), meta));
                }
                let entries: Vec<WireKvEntry> = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("{url_path}: {e}")))?;
                let mut pairs: Vec<KeyPair> = entries
                    .into_iter()
                    .filter_map(|e| {
                        // Entries without a value are directory placeholders.
                        e.value.map(|raw| KeyPair {
                            key: e.key,
                            value: decode_kv_value(&raw),
                        })
                    })
                    .collect();
                pairs.sort();
                Ok((pairs, meta))
            }
        })
        .await
    }

    async fn agent_self(&self) -> DomainResult<AgentInfo> {
        with_retry("agent_self", || async {
            let resp = self.get("/v1/agent/self", &[], None).await?;
            let wire: WireAgentSelf = resp
                .json()
                .await
                .map_err(|e| DomainError::CatalogUnreachable(format!("agent/self: {e}")))?;
            let edition = if wire.config.version.contains("+ent") {
                "ent".to_string()
            } else {
                "oss".to_string()
            };
            Ok(AgentInfo {
                version: wire.config.version,
                edition,
                datacenter: wire.config.datacenter,
            })
        })
        .await
    }

    async fn operator_license(&self, opts: QueryOptions) -> DomainResult<License> {
        let params = self.query_params(&opts);
        with_retry("operator_license", || {
            let params = params.clone();
            async move {
                let resp = self.get("/v1/operator/license", &params, None).await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(DomainError::CatalogBadRequest(
                        "agent has no license endpoint".to_string(),
                    ));
                }
                let wire: WireLicenseResponse = resp
                    .json()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("operator/license: {e}")))?;
                Ok(License {
                    license_id: wire.license.license_id,
                    expiration_time: wire.license.expiration_time,
                })
            }
        })
        .await
    }

    async fn register_service(&self, reg: &ServiceRegistration) -> DomainResult<()> {
        let body = serde_json::json!({
            "ID": reg.id,
            "Name": reg.name,
            "Tags": reg.tags,
            "Port": reg.port,
            "Namespace": reg.namespace,
            "Checks": reg.checks.iter().map(|c| serde_json::json!({
                "Name": c.name,
                "CheckID": c.check_id,
                "Notes": c.notes,
                "HTTP": c.http,
                "Method": c.method,
                "Interval": c.interval,
                "Timeout": c.timeout,
                "DeregisterCriticalServiceAfter": c.deregister_critical_service_after,
                "TLSSkipVerify": c.tls_skip_verify,
                "Status": c.status,
            })).collect::<Vec<_>>(),
        });
        with_retry("register_service", || {
            let body = body.clone();
            async move {
                let url = format!("{}/v1/agent/service/register", self.base);
                let mut req = self.http.put(&url).json(&body);
                if let Some(token) = &self.token {
                    req = req.header(TOKEN_HEADER, token);
                }
                let resp = req.send().await.map_err(|e| {
                    DomainError::CatalogUnreachable(format!("service/register: {e}"))
                })?;
                classify_status("/v1/agent/service/register", resp)?;
                Ok(())
            }
        })
        .await
    }

    async fn deregister_service(&self, service_id: &str) -> DomainResult<()> {
        let path = format!("/v1/agent/service/deregister/{service_id}");
        with_retry("deregister_service", || {
            let path = path.clone();
            async move {
                let url = format!("{}{}", self.base, path);
                let mut req = self.http.put(&url);
                if let Some(token) = &self.token {
                    req = req.header(TOKEN_HEADER, token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| DomainError::CatalogUnreachable(format!("{path}: {e}")))?;
                classify_status(&path, resp)?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_for(url: &str) -> HttpCatalog {
        HttpCatalog::new(&CatalogConfig {
            address: url.to_string(),
            ..CatalogConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn kv_get_decodes_base64_and_maps_missing_to_none() {
        let mut server = mockito::Server::new_async().await;
        let _present = server
            .mock("GET", "/v1/kv/test-key")
            .with_status(200)
            .with_header(INDEX_HEADER, "7")
            .with_body(r#"[{"Key":"test-key","Value":"dGVzdC12YWx1ZQ=="}]"#)
            .create_async()
            .await;
        let catalog = catalog_for(&server.url());

        let (value, meta) = catalog
            .kv_get("test-key", QueryOptions::default())
            .await
            .expect("kv_get");
        assert_eq!(value.as_deref(), Some("test-value"));
        assert_eq!(meta.index, 7);

        let _absent = server
            .mock("GET", "/v1/kv/missing")
            .with_status(404)
            .with_header(INDEX_HEADER, "9")
            .create_async()
            .await;
        let (value, meta) = catalog
            .kv_get("missing", QueryOptions::default())
            .await
            .expect("kv_get missing");
        assert_eq!(value, None);
        assert_eq!(meta.index, 9);
    }

    #[tokio::test]
    async fn health_services_maps_wire_entries() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/health/service/web")
            .with_status(200)
            .with_header(INDEX_HEADER, "12")
            .with_body(
                r#"[{
                    "Node": {"Node": "n1", "Address": "10.0.0.1", "Datacenter": "dc1"},
                    "Service": {"ID": "web-1", "Service": "web", "Address": "10.0.0.2",
                                "Port": 8080, "Tags": ["prod"]},
                    "Checks": [{"Status": "passing"}]
                }]"#,
            )
            .create_async()
            .await;
        let catalog = catalog_for(&server.url());

        let (instances, meta) = catalog
            .health_services(&ServiceSelector::named("web"), QueryOptions::default())
            .await
            .expect("health_services");
        assert_eq!(meta.index, 12);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, "web-1");
        assert_eq!(instances[0].address, "10.0.0.2");
        assert_eq!(instances[0].status, "passing");
    }

    #[tokio::test]
    async fn catalog_services_parses_name_to_tags() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/catalog/services")
            .with_status(200)
            .with_header(INDEX_HEADER, "3")
            .with_body(r#"{"consul":[],"web":["prod","v2"]}"#)
            .create_async()
            .await;
        let catalog = catalog_for(&server.url());

        let (services, meta) = catalog
            .catalog_services(&BTreeMap::new(), QueryOptions::default())
            .await
            .expect("catalog_services");
        assert_eq!(meta.index, 3);
        assert_eq!(services.len(), 2);
        assert_eq!(services["web"], vec!["prod", "v2"]);
    }

    #[tokio::test]
    async fn client_errors_are_fatal() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/v1/kv/forbidden")
            .with_status(403)
            .create_async()
            .await;
        let catalog = catalog_for(&server.url());

        let err = catalog
            .kv_get("forbidden", QueryOptions::default())
            .await
            .expect_err("403 must be fatal");
        assert!(matches!(err, DomainError::CatalogBadRequest(_)));
    }
}
