// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The upstream GPU-provider API adapter: rate-limited, circuit-broken,
//! retrying, with multi-region product fallback.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

use crate::cache::{PortKind, ProductSnapshot, TemplatePort, TemplateSnapshot};
use crate::config::Config;
use crate::error::CoreError;
use async_trait::async_trait;
use circuit_breaker::CircuitBreaker;
use rate_limiter::RateLimiter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One entry in the region fallback table (§3.4). `priority` is numeric;
/// lower is preferred among regions other than the one explicitly
/// requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionEntry {
    /// Region code, e.g. `CN-HK-01`. May be matched against upstream
    /// strings of the form `CODE (Description)` by prefix up to the first
    /// space.
    pub code: String,
    /// Upstream cluster id for this region.
    pub cluster_id: String,
    /// Fallback priority; lower tried first.
    pub priority: i32,
}

/// The region fallback table used when the process isn't given a
/// provider-supplied one. Mirrors the three regions `DEFAULT_REGION`
/// (`CN-HK-01`) and [`Config::from_env`]'s examples already assume.
pub fn default_regions() -> Vec<RegionEntry> {
    vec![
        RegionEntry {
            code: "CN-HK-01".to_string(),
            cluster_id: "c1".to_string(),
            priority: 0,
        },
        RegionEntry {
            code: "AS-SGP-02".to_string(),
            cluster_id: "c2".to_string(),
            priority: 1,
        },
        RegionEntry {
            code: "US-CA-06".to_string(),
            cluster_id: "c3".to_string(),
            priority: 2,
        },
    ]
}

/// Payload accepted by `createInstance`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstancePayload {
    /// Resolved product id.
    pub product_id: String,
    /// Template id.
    pub template_id: String,
    /// Region the product was resolved in.
    pub region: String,
    /// Container image reference, carried from the resolved template.
    pub image_url: String,
    /// Registry-auth id, when the template requires one.
    pub image_auth_id: Option<String>,
    /// Number of GPUs requested.
    pub gpu_num: u32,
    /// Root filesystem size, in GB.
    pub rootfs_size: u32,
    /// Billing mode.
    pub billing_mode: crate::instance::BillingMode,
    /// Declared ports, carried from the resolved template.
    pub port_mappings: Vec<TemplatePort>,
    /// Environment variables baked into the template.
    pub envs: Vec<(String, String)>,
}

/// Upstream's view of an instance, as returned by create/get/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInstance {
    /// Upstream-assigned id.
    pub upstream_id: String,
    /// Upstream-reported status string (provider-specific vocabulary).
    pub status: String,
    /// Region the instance is running in.
    pub region: String,
    /// Per-port public endpoints, once assigned.
    pub port_mappings: Vec<crate::instance::PortEndpoint>,
}

/// Outcome of a `migrateInstance` call.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// Whether the migration succeeded.
    pub success: bool,
    /// The replacement instance's upstream id, if migration succeeded
    /// in-place rather than requiring a recreate.
    pub new_upstream_id: Option<String>,
    /// Error detail when `success` is false.
    pub error: Option<String>,
}

/// Typed upstream API surface, wrapped by the reliability stack described
/// in the crate's `SPEC_FULL.md` §4.2.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// List products matching `product_name`, optionally scoped to one
    /// region.
    async fn list_products(
        &self,
        product_name: &str,
        region: Option<&str>,
    ) -> Result<Vec<ProductSnapshot>, CoreError>;

    /// Resolve the lowest spot-price product for `product_name`, trying
    /// `preferred_region` first and then the remaining configured regions
    /// in ascending priority order. Returns the product and the region it
    /// was actually found in.
    async fn get_optimal_product(
        &self,
        product_name: &str,
        preferred_region: &str,
    ) -> Result<(ProductSnapshot, String), CoreError>;

    /// Fetch a template by id.
    async fn get_template(&self, id: &str) -> Result<TemplateSnapshot, CoreError>;

    /// Resolve registry credentials by id.
    async fn get_registry_auth(&self, id: &str) -> Result<(String, String), CoreError>;

    /// Create an instance.
    async fn create_instance(
        &self,
        payload: CreateInstancePayload,
    ) -> Result<UpstreamInstance, CoreError>;

    /// Fetch an instance by upstream id.
    async fn get_instance(&self, upstream_id: &str) -> Result<UpstreamInstance, CoreError>;

    /// Issue a start command.
    async fn start_instance(&self, upstream_id: &str) -> Result<(), CoreError>;

    /// Issue a stop command.
    async fn stop_instance(&self, upstream_id: &str) -> Result<(), CoreError>;

    /// Issue a delete command.
    async fn delete_instance(&self, upstream_id: &str) -> Result<(), CoreError>;

    /// Paginated instance listing.
    async fn list_instances(
        &self,
        page: u32,
        page_size: u32,
        status: Option<&str>,
    ) -> Result<(Vec<UpstreamInstance>, u64), CoreError>;

    /// Trigger a migration for a reclaimed spot instance.
    async fn migrate_instance(&self, upstream_id: &str) -> Result<MigrationOutcome, CoreError>;

    /// Current circuit-breaker state, surfaced in the health summary.
    fn circuit_state(&self) -> circuit_breaker::CircuitState;
}

/// Production [`UpstreamAdapter`] backed by `reqwest`, wrapping every call
/// with the rate limiter, retry, circuit breaker, and timeout described in
/// the crate's `SPEC_FULL.md` §4.2.
pub struct HttpUpstreamAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: RateLimiter,
    circuit_breaker: CircuitBreaker,
    max_retry_attempts: u32,
    request_timeout: Duration,
    regions: Vec<RegionEntry>,
}

impl HttpUpstreamAdapter {
    /// Construct an adapter from configuration and the static region
    /// fallback table.
    pub fn new(config: &Config, regions: Vec<RegionEntry>) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("novita-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| CoreError::Network {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: format!("{}/gpu-instance/openapi", config.novita_api_base_url.trim_end_matches('/')),
            api_key: config.novita_api_key.clone(),
            rate_limiter: RateLimiter::new(100, Duration::from_secs(60), 50, Duration::from_secs(5)),
            circuit_breaker: CircuitBreaker::new(5, 3, Duration::from_secs(60)),
            max_retry_attempts: config.max_retry_attempts,
            request_timeout: config.request_timeout,
            regions,
        })
    }

    fn category_for_circuit(&self) -> String {
        "upstream".to_string()
    }

    /// Execute one logical call through the full reliability stack: rate
    /// limiter, circuit breaker, retry with backoff, timeout.
    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
        T: serde::de::DeserializeOwned,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(CoreError::CircuitOpen {
                category: self.category_for_circuit(),
            });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let _permit = self.rate_limiter.acquire().await?;
            let outcome = tokio::time::timeout(self.request_timeout, f()).await;

            let response = match outcome {
                Err(_) => {
                    self.circuit_breaker.record_failure();
                    if attempt >= self.max_retry_attempts {
                        return Err(CoreError::UpstreamTimeout {
                            operation: operation.to_string(),
                        });
                    }
                    tokio::time::sleep(retry::backoff_delay(Duration::from_millis(200), attempt)).await;
                    continue;
                }
                Ok(Err(err)) => {
                    self.circuit_breaker.record_failure();
                    if retry::is_retryable_transport_error(&err) && attempt < self.max_retry_attempts {
                        tokio::time::sleep(retry::backoff_delay(Duration::from_millis(200), attempt)).await;
                        continue;
                    }
                    return Err(CoreError::Network {
                        message: err.to_string(),
                    });
                }
                Ok(Ok(response)) => response,
            };

            let status = response.status();
            if status.is_success() {
                self.circuit_breaker.record_success();
                return response
                    .json::<T>()
                    .await
                    .map_err(|err| CoreError::Network {
                        message: format!("decoding {operation} response: {err}"),
                    });
            }

            self.circuit_breaker.record_failure();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                if attempt < self.max_retry_attempts {
                    let delay = retry::retry_delay(
                        Duration::from_millis(200),
                        attempt,
                        retry_after,
                        Duration::from_secs(30),
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(CoreError::UpstreamRateLimit { retry_after });
            }

            if status.is_server_error() {
                if attempt < self.max_retry_attempts {
                    tokio::time::sleep(retry::backoff_delay(Duration::from_millis(200), attempt)).await;
                    continue;
                }
                return Err(CoreError::UpstreamServer {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }

            // 4xx other than 429: permanent, not retried.
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::UpstreamClient {
                status: status.as_u16(),
                message: body,
            });
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }
}

/// Matches a region string of form `CODE` or `CODE (Description)` by
/// prefix up to the first space, per §3.4.
fn region_code_prefix(region: &str) -> &str {
    region.split(' ').next().unwrap_or(region)
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    products: Vec<RawProduct>,
}

#[derive(Debug, Deserialize)]
struct RawProduct {
    id: String,
    region: String,
    #[serde(rename = "spotPrice")]
    spot_price: f64,
    #[serde(rename = "onDemandPrice")]
    on_demand_price: f64,
}

#[derive(Debug, Deserialize)]
struct TemplateResponse {
    id: String,
    #[serde(rename = "imageUrl")]
    image_url: String,
    ports: Vec<RawPort>,
    #[serde(default)]
    environment: Vec<(String, String)>,
    #[serde(rename = "registryAuthId", default)]
    registry_auth_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPort {
    port: u16,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct RegistryAuthsResponse {
    auths: Vec<RawRegistryAuth>,
}

#[derive(Debug, Deserialize)]
struct RawRegistryAuth {
    id: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct InstanceResponse {
    #[serde(rename = "instanceId")]
    instance_id: String,
    status: String,
    region: String,
    #[serde(default, rename = "portMappings")]
    port_mappings: Vec<RawPortMapping>,
}

#[derive(Debug, Deserialize)]
struct RawPortMapping {
    port: u16,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct InstancesResponse {
    instances: Vec<InstanceResponse>,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct MigrateResponse {
    success: bool,
    #[serde(default, rename = "newInstanceId")]
    new_instance_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn instance_response_into(raw: InstanceResponse) -> UpstreamInstance {
    UpstreamInstance {
        upstream_id: raw.instance_id,
        status: raw.status,
        region: raw.region,
        port_mappings: raw
            .port_mappings
            .into_iter()
            .map(|p| crate::instance::PortEndpoint {
                port: p.port,
                endpoint: p.endpoint,
            })
            .collect(),
    }
}

#[async_trait]
impl UpstreamAdapter for HttpUpstreamAdapter {
    #[tracing::instrument(skip(self))]
    async fn list_products(
        &self,
        product_name: &str,
        region: Option<&str>,
    ) -> Result<Vec<ProductSnapshot>, CoreError> {
        let url = format!("{}/v1/products", self.base_url);
        let product_name = product_name.to_string();
        let region = region.map(str::to_string);
        let response: ProductsResponse = self
            .call("listProducts", || {
                let mut req = self
                    .client
                    .get(&url)
                    .header("Authorization", self.auth_header())
                    .query(&[("productName", &product_name)]);
                if let Some(region) = &region {
                    req = req.query(&[("region", region)]);
                }
                req.send()
            })
            .await?;
        Ok(response
            .products
            .into_iter()
            .map(|p| ProductSnapshot {
                id: p.id,
                region: p.region,
                spot_price: p.spot_price,
                on_demand_price: p.on_demand_price,
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn get_optimal_product(
        &self,
        product_name: &str,
        preferred_region: &str,
    ) -> Result<(ProductSnapshot, String), CoreError> {
        let all = self.list_products(product_name, None).await?;
        if all.is_empty() {
            return Err(CoreError::NotFound {
                kind: "product".to_string(),
                id: product_name.to_string(),
            });
        }

        let cheapest_in = |code: &str| -> Option<ProductSnapshot> {
            all.iter()
                .filter(|p| region_code_prefix(&p.region) == code)
                .min_by(|a, b| a.spot_price.total_cmp(&b.spot_price))
                .cloned()
        };

        let preferred_code = region_code_prefix(preferred_region);
        if let Some(product) = cheapest_in(preferred_code) {
            return Ok((product, preferred_code.to_string()));
        }

        let mut fallback_regions = self.regions.clone();
        fallback_regions.sort_by_key(|r| r.priority);
        for region in fallback_regions {
            if region.code == preferred_code {
                continue;
            }
            if let Some(product) = cheapest_in(&region.code) {
                return Ok((product, region.code));
            }
        }

        Err(CoreError::NotFound {
            kind: "product".to_string(),
            id: format!("{product_name} in any configured region"),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get_template(&self, id: &str) -> Result<TemplateSnapshot, CoreError> {
        let url = format!("{}/v1/template", self.base_url);
        let id = id.to_string();
        let response: TemplateResponse = self
            .call("getTemplate", || {
                self.client
                    .get(&url)
                    .header("Authorization", self.auth_header())
                    .query(&[("templateId", &id)])
                    .send()
            })
            .await?;
        Ok(TemplateSnapshot {
            id: response.id,
            image_url: response.image_url,
            ports: response
                .ports
                .into_iter()
                .map(|p| TemplatePort {
                    port: p.port,
                    kind: if p.kind.eq_ignore_ascii_case("tcp") {
                        PortKind::Tcp
                    } else {
                        PortKind::Http
                    },
                    path: p.path,
                })
                .collect(),
            environment: response.environment,
            registry_auth_id: response.registry_auth_id,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get_registry_auth(&self, id: &str) -> Result<(String, String), CoreError> {
        let url = format!("{}/v1/repository/auths", self.base_url);
        let response: RegistryAuthsResponse = self
            .call("getRegistryAuth", || {
                self.client
                    .get(&url)
                    .header("Authorization", self.auth_header())
                    .send()
            })
            .await?;
        response
            .auths
            .into_iter()
            .find(|a| a.id == id)
            .map(|a| (a.username, a.password))
            .ok_or_else(|| CoreError::NotFound {
                kind: "registry_auth".to_string(),
                id: id.to_string(),
            })
    }

    #[tracing::instrument(skip(self))]
    async fn create_instance(
        &self,
        payload: CreateInstancePayload,
    ) -> Result<UpstreamInstance, CoreError> {
        let url = format!("{}/v1/gpu/instance/create", self.base_url);
        let response: InstanceResponse = self
            .call("createInstance", || {
                self.client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&payload)
                    .send()
            })
            .await?;
        Ok(instance_response_into(response))
    }

    #[tracing::instrument(skip(self))]
    async fn get_instance(&self, upstream_id: &str) -> Result<UpstreamInstance, CoreError> {
        let url = format!("{}/v1/gpu/instance", self.base_url);
        let response: InstanceResponse = self
            .call("getInstance", || {
                self.client
                    .get(&url)
                    .header("Authorization", self.auth_header())
                    .query(&[("instanceId", upstream_id)])
                    .send()
            })
            .await?;
        Ok(instance_response_into(response))
    }

    #[tracing::instrument(skip(self))]
    async fn start_instance(&self, upstream_id: &str) -> Result<(), CoreError> {
        let url = format!("{}/v1/gpu/instance/start", self.base_url);
        let _: serde_json::Value = self
            .call("startInstance", || {
                self.client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&serde_json::json!({ "instanceId": upstream_id }))
                    .send()
            })
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn stop_instance(&self, upstream_id: &str) -> Result<(), CoreError> {
        let url = format!("{}/v1/gpu/instance/stop", self.base_url);
        let _: serde_json::Value = self
            .call("stopInstance", || {
                self.client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&serde_json::json!({ "instanceId": upstream_id }))
                    .send()
            })
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_instance(&self, upstream_id: &str) -> Result<(), CoreError> {
        let url = format!("{}/v1/gpu/instance/delete", self.base_url);
        let _: serde_json::Value = self
            .call("deleteInstance", || {
                self.client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&serde_json::json!({ "instanceId": upstream_id }))
                    .send()
            })
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn list_instances(
        &self,
        page: u32,
        page_size: u32,
        status: Option<&str>,
    ) -> Result<(Vec<UpstreamInstance>, u64), CoreError> {
        let url = format!("{}/v1/gpu/instances", self.base_url);
        let page_str = page.to_string();
        let page_size_str = page_size.to_string();
        let status = status.map(str::to_string);
        let response: InstancesResponse = self
            .call("listInstances", || {
                let mut req = self.client.get(&url).header("Authorization", self.auth_header()).query(&[
                    ("page", &page_str),
                    ("page_size", &page_size_str),
                ]);
                if let Some(status) = &status {
                    req = req.query(&[("status", status)]);
                }
                req.send()
            })
            .await?;
        Ok((
            response.instances.into_iter().map(instance_response_into).collect(),
            response.total,
        ))
    }

    #[tracing::instrument(skip(self))]
    async fn migrate_instance(&self, upstream_id: &str) -> Result<MigrationOutcome, CoreError> {
        let url = format!("{}/v1/gpu/instance/migrate", self.base_url);
        let response: MigrateResponse = self
            .call("migrateInstance", || {
                self.client
                    .post(&url)
                    .header("Authorization", self.auth_header())
                    .json(&serde_json::json!({ "instanceId": upstream_id }))
                    .send()
            })
            .await?;
        Ok(MigrationOutcome {
            success: response.success,
            new_upstream_id: response.new_instance_id,
            error: response.error,
        })
    }

    fn circuit_state(&self) -> circuit_breaker::CircuitState {
        self.circuit_breaker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter_against(mock: &MockServer) -> HttpUpstreamAdapter {
        let config = Config {
            novita_api_key: "test-key".to_string(),
            novita_api_base_url: mock.uri(),
            webhook_url: None,
            webhook_secret: None,
            default_region: "CN-HK-01".to_string(),
            instance_poll_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            request_timeout: Duration::from_secs(5),
            startup_max_wait: Duration::from_secs(1200),
            migration_enabled: false,
            migration_interval: Duration::from_secs(900),
            migration_eligibility_interval: Duration::from_secs(3600 * 4),
            migration_max_concurrent: 5,
            migration_dry_run: false,
            sync_enable_automatic_sync: false,
            sync_interval: Duration::from_secs(1800),
            sync_remove_obsolete_instances: false,
            sync_obsolete_instance_retention: Duration::from_secs(86400 * 7),
            store_url: None,
            store_enable_fallback: true,
        };
        HttpUpstreamAdapter::new(&config, default_regions()).unwrap()
    }

    fn default_regions() -> Vec<RegionEntry> {
        vec![
            RegionEntry { code: "CN-HK-01".into(), cluster_id: "c1".into(), priority: 0 },
            RegionEntry { code: "AS-SGP-02".into(), cluster_id: "c2".into(), priority: 1 },
            RegionEntry { code: "US-CA-06".into(), cluster_id: "c3".into(), priority: 2 },
        ]
    }

    #[tokio::test]
    async fn region_fallback_prefers_priority_over_price() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpu-instance/openapi/v1/products"))
            .and(query_param("productName", "RTX 4090 24GB"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "products": [
                    { "id": "p-sgp", "region": "AS-SGP-02 (Singapore)", "spotPrice": 0.6, "onDemandPrice": 1.5 },
                    { "id": "p-ca", "region": "US-CA-06 (California)", "spotPrice": 0.4, "onDemandPrice": 1.1 },
                ]
            })))
            .mount(&mock)
            .await;

        let adapter = adapter_against(&mock).await;
        let (product, region) = adapter
            .get_optimal_product("RTX 4090 24GB", "CN-HK-01")
            .await
            .unwrap();
        assert_eq!(region, "AS-SGP-02");
        assert_eq!(product.id, "p-sgp");
    }

    #[tokio::test]
    async fn explicit_region_is_tried_first_regardless_of_priority() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpu-instance/openapi/v1/products"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "products": [
                    { "id": "p-ca", "region": "US-CA-06", "spotPrice": 0.1, "onDemandPrice": 0.5 },
                    { "id": "p-hk", "region": "CN-HK-01", "spotPrice": 0.9, "onDemandPrice": 1.5 },
                ]
            })))
            .mount(&mock)
            .await;

        let adapter = adapter_against(&mock).await;
        let (product, region) = adapter
            .get_optimal_product("RTX 4090 24GB", "US-CA-06")
            .await
            .unwrap();
        assert_eq!(region, "US-CA-06");
        assert_eq!(product.id, "p-ca");
    }

    #[tokio::test]
    async fn server_error_is_retried_then_surfaced() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpu-instance/openapi/v1/products"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock)
            .await;

        let adapter = adapter_against(&mock).await;
        let err = adapter.list_products("x", None).await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamServer { .. }));
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gpu-instance/openapi/v1/template"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "nope"})))
            .expect(1)
            .mount(&mock)
            .await;

        let adapter = adapter_against(&mock).await;
        let err = adapter.get_template("tmpl-missing").await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamClient { status: 404, .. }));
    }
}
