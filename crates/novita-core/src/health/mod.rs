// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint health checks (spec §4.4), the startup/periodic sync that
//! reconciles local records against upstream (spec §4.3's merge semantics),
//! and the aggregate health summary surfaced at `GET /health`.

use crate::cache::{Cache, PortKind, TemplatePort};
use crate::config::Config;
use crate::error::CoreError;
use crate::instance::{
    DataConsistency, EndpointHealth, HealthCheckResult, InstanceStatus, OverallHealth, PortEndpoint,
    Source,
};
use crate::queue::QueueStats;
use crate::upstream::circuit_breaker::CircuitState;
use crate::upstream::UpstreamAdapter;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Run the health checks declared by a template against an instance's
/// assigned connection endpoints.
#[tracing::instrument(skip(client, connection_ports, declared_ports))]
pub async fn check_endpoints(
    client: &reqwest::Client,
    connection_ports: &[PortEndpoint],
    declared_ports: &[TemplatePort],
    per_check_timeout: Duration,
) -> HealthCheckResult {
    let mut endpoints = Vec::with_capacity(declared_ports.len());
    for declared in declared_ports {
        let checked_at = Utc::now();
        let Some(assigned) = connection_ports.iter().find(|p| p.port == declared.port) else {
            endpoints.push(EndpointHealth {
                port: declared.port,
                path: declared.path.clone(),
                kind: declared.kind,
                healthy: false,
                last_checked: checked_at,
                response_time_ms: None,
                error: Some("no connection endpoint assigned for this port".to_string()),
            });
            continue;
        };

        let started = Instant::now();
        let (healthy, error) = match declared.kind {
            PortKind::Http => check_http(client, &assigned.endpoint, &declared.path, per_check_timeout).await,
            PortKind::Tcp => check_tcp(&assigned.endpoint, per_check_timeout).await,
        };
        endpoints.push(EndpointHealth {
            port: declared.port,
            path: declared.path.clone(),
            kind: declared.kind,
            healthy,
            last_checked: checked_at,
            response_time_ms: Some(started.elapsed().as_millis() as u64),
            error,
        });
    }

    HealthCheckResult {
        overall_status: overall_status(&endpoints),
        endpoints,
    }
}

fn overall_status(endpoints: &[EndpointHealth]) -> OverallHealth {
    if endpoints.is_empty() {
        return OverallHealth::Healthy;
    }
    let healthy = endpoints.iter().filter(|e| e.healthy).count();
    if healthy == endpoints.len() {
        OverallHealth::Healthy
    } else if healthy == 0 {
        OverallHealth::Unhealthy
    } else {
        OverallHealth::Partial
    }
}

async fn check_http(
    client: &reqwest::Client,
    endpoint: &str,
    path: &str,
    timeout: Duration,
) -> (bool, Option<String>) {
    let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        format!("{endpoint}{path}")
    } else {
        format!("http://{endpoint}{path}")
    };
    match tokio::time::timeout(timeout, client.get(&url).send()).await {
        Ok(Ok(resp)) if resp.status().is_success() || resp.status().is_redirection() => (true, None),
        Ok(Ok(resp)) => (false, Some(format!("unhealthy status {}", resp.status()))),
        Ok(Err(err)) => (false, Some(err.to_string())),
        Err(_) => (false, Some("health check timed out".to_string())),
    }
}

async fn check_tcp(endpoint: &str, timeout: Duration) -> (bool, Option<String>) {
    let addr = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or(endpoint)
        .to_string();
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
        Ok(Ok(_)) => (true, None),
        Ok(Err(err)) => (false, Some(err.to_string())),
        Err(_) => (false, Some("tcp connect timed out".to_string())),
    }
}

/// Result of one startup/periodic sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    /// Records created locally for upstream instances we didn't know about.
    pub inserted: u64,
    /// Local records refreshed from a newer upstream snapshot.
    pub updated: u64,
    /// Local records flagged `upstreamNewer`/`conflicted` but left in place.
    pub flagged: u64,
    /// Local records whose upstream counterpart is gone and were marked
    /// obsolete or removed, per `SYNC_REMOVE_OBSOLETE_INSTANCES`.
    pub obsolete: u64,
    /// Pages fetched from upstream during this pass.
    pub pages: u64,
}

/// Reconciles locally-cached instance records against the upstream listing.
pub struct SyncService {
    cache: Arc<Cache>,
    upstream: Arc<dyn UpstreamAdapter>,
    config: Arc<Config>,
}

impl SyncService {
    /// Construct a sync service over the shared collaborators.
    pub fn new(cache: Arc<Cache>, upstream: Arc<dyn UpstreamAdapter>, config: Arc<Config>) -> Self {
        Self {
            cache,
            upstream,
            config,
        }
    }

    /// Paginate the full upstream instance listing, merge it against local
    /// records (tagging `source`/`dataConsistency`), and apply the obsolete
    /// policy to local records with no upstream counterpart.
    #[tracing::instrument(skip(self))]
    pub async fn sync_with_upstream(&self) -> Result<SyncOutcome, CoreError> {
        let mut outcome = SyncOutcome::default();
        let mut by_upstream_id = HashMap::new();
        let mut page = 1;
        loop {
            let (instances, total) = self.upstream.list_instances(page, 100, None).await?;
            outcome.pages += 1;
            let fetched = instances.len() as u64;
            for instance in instances {
                by_upstream_id.insert(instance.upstream_id.clone(), instance);
            }
            if (by_upstream_id.len() as u64) >= total || fetched == 0 {
                break;
            }
            page += 1;
        }

        let local_records = self.cache.list_instances().await?;
        let mut seen_upstream_ids = std::collections::HashSet::new();

        for mut record in local_records {
            let Some(upstream_id) = record.upstream_id.clone() else {
                continue;
            };
            let Some(upstream_instance) = by_upstream_id.get(&upstream_id) else {
                self.apply_obsolete_policy(&mut record, &mut outcome).await?;
                continue;
            };
            seen_upstream_ids.insert(upstream_id.clone());

            let consistency = if upstream_instance.status == record.status.to_string() {
                DataConsistency::Consistent
            } else if matches!(
                record.status,
                InstanceStatus::Stopping | InstanceStatus::Starting
            ) {
                DataConsistency::LocalNewer
            } else {
                DataConsistency::UpstreamNewer
            };

            record.source = Source::Merged;
            record.data_consistency = Some(consistency);
            if consistency != DataConsistency::LocalNewer {
                // Upstream is authoritative for status, region, and port
                // mappings (spec §4.3's merge rule) whenever the local side
                // isn't mid-transition itself.
                if let Some(status) = InstanceStatus::from_upstream_str(&upstream_instance.status) {
                    record.status = status;
                }
                if let Some(product) = record.product.as_mut() {
                    product.region = upstream_instance.region.clone();
                }
                record.connection.ports = upstream_instance.port_mappings.clone();
            }
            if consistency == DataConsistency::UpstreamNewer {
                outcome.updated += 1;
            } else {
                outcome.flagged += 1;
            }
            self.cache.put_instance(&record).await?;
        }

        // Upstream instances with no local record are out of scope here:
        // they were never created through this control plane (spec §4.3
        // only describes merge/obsolete handling for records this service
        // itself created), so they are observed but not materialized.
        let _ = seen_upstream_ids;

        Ok(outcome)
    }

    async fn apply_obsolete_policy(
        &self,
        record: &mut crate::instance::InstanceRecord,
        outcome: &mut SyncOutcome,
    ) -> Result<(), CoreError> {
        if matches!(
            record.status,
            InstanceStatus::Terminated | InstanceStatus::Failed
        ) {
            return Ok(());
        }

        if self.config.sync_remove_obsolete_instances {
            self.cache.delete_instance(&record.instance_id).await?;
            outcome.obsolete += 1;
            return Ok(());
        }

        let last_seen = record
            .timestamps
            .last_synced
            .unwrap_or_else(|| record.timestamps.created.unwrap_or_else(Utc::now));
        let retention = chrono::Duration::from_std(self.config.sync_obsolete_instance_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        if Utc::now() - last_seen > retention {
            self.cache.delete_instance(&record.instance_id).await?;
        } else {
            record.data_consistency = Some(DataConsistency::Conflicted);
            self.cache.put_instance(record).await?;
        }
        outcome.obsolete += 1;
        warn!(instance_id = %record.instance_id, "instance missing from upstream listing, applying obsolete policy");
        Ok(())
    }
}

/// Which persistent store backend is currently serving requests.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// `"redis"` or `"memory"`.
    pub backend: &'static str,
}

/// Aggregate health summary returned by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    /// Overall status: `healthy` unless the store has fallen back, the
    /// circuit breaker is open, or the scheduler's execution failure rate
    /// has crossed the unhealthy threshold (spec §4.6).
    pub status: &'static str,
    /// Store backend in use.
    pub store: StoreHealth,
    /// Job queue counts.
    pub queue: QueueStats,
    /// Upstream circuit breaker state, as a lowercase string.
    pub upstream_circuit: &'static str,
    /// Maintenance scheduler status.
    pub scheduler: crate::scheduler::SchedulerStatus,
}

/// Build the health summary from the current component states.
pub fn build_summary(
    store_backend: &'static str,
    queue: QueueStats,
    circuit_state: CircuitState,
    scheduler: crate::scheduler::SchedulerStatus,
) -> HealthSummary {
    let upstream_circuit = match circuit_state {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    };
    let status = if store_backend == "memory" || circuit_state == CircuitState::Open || scheduler.is_unhealthy() {
        "degraded"
    } else {
        "healthy"
    };
    HealthSummary {
        status,
        store: StoreHealth { backend: store_backend },
        queue,
        scheduler,
        upstream_circuit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, PortKind, ProductSnapshot};
    use crate::config::Config;
    use crate::instance::PortEndpoint;
    use crate::store::MemoryStore;
    use crate::upstream::circuit_breaker::CircuitState;
    use crate::upstream::{CreateInstancePayload, MigrationOutcome, UpstreamInstance};
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubUpstream {
        instances: Vec<UpstreamInstance>,
    }

    #[async_trait]
    impl UpstreamAdapter for StubUpstream {
        async fn list_products(
            &self,
            _name: &str,
            _region: Option<&str>,
        ) -> Result<Vec<crate::cache::ProductSnapshot>, CoreError> {
            Ok(vec![])
        }
        async fn get_optimal_product(
            &self,
            _name: &str,
            _region: &str,
        ) -> Result<(crate::cache::ProductSnapshot, String), CoreError> {
            unimplemented!()
        }
        async fn get_template(&self, _id: &str) -> Result<crate::cache::TemplateSnapshot, CoreError> {
            unimplemented!()
        }
        async fn get_registry_auth(&self, _id: &str) -> Result<(String, String), CoreError> {
            unimplemented!()
        }
        async fn create_instance(&self, _payload: CreateInstancePayload) -> Result<UpstreamInstance, CoreError> {
            unimplemented!()
        }
        async fn get_instance(&self, _id: &str) -> Result<UpstreamInstance, CoreError> {
            unimplemented!()
        }
        async fn start_instance(&self, _id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn stop_instance(&self, _id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn delete_instance(&self, _id: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn list_instances(
            &self,
            page: u32,
            _page_size: u32,
            _status: Option<&str>,
        ) -> Result<(Vec<UpstreamInstance>, u64), CoreError> {
            if page == 1 {
                Ok((self.instances.clone(), self.instances.len() as u64))
            } else {
                Ok((vec![], self.instances.len() as u64))
            }
        }
        async fn migrate_instance(&self, _id: &str) -> Result<MigrationOutcome, CoreError> {
            unimplemented!()
        }
        fn circuit_state(&self) -> CircuitState {
            CircuitState::Closed
        }
    }

    fn sample_instance_config() -> crate::instance::InstanceConfig {
        crate::instance::InstanceConfig {
            gpu_num: 1,
            rootfs_size: 60,
            billing_mode: crate::instance::BillingMode::OnDemand,
            requested_region: "CN-HK-01".to_string(),
            webhook_url: None,
            webhook_secret: None,
        }
    }

    #[tokio::test]
    async fn sync_applies_upstream_status_region_and_ports_when_not_local_newer() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let mut record = crate::instance::InstanceRecord::new(
            "test".to_string(),
            sample_instance_config(),
            Utc::now(),
        );
        record.upstream_id = Some("up-1".to_string());
        record.status = InstanceStatus::Running;
        record.product = Some(ProductSnapshot {
            id: "prod-1".to_string(),
            region: "CN-HK-01".to_string(),
            spot_price: 1.0,
            on_demand_price: 2.0,
        });
        cache.put_instance(&record).await.unwrap();

        let upstream = Arc::new(StubUpstream {
            instances: vec![UpstreamInstance {
                upstream_id: "up-1".to_string(),
                status: "EXITED".to_string(),
                region: "AS-SGP-02".to_string(),
                port_mappings: vec![PortEndpoint {
                    port: 8080,
                    endpoint: "10.0.0.1:8080".to_string(),
                }],
            }],
        });

        let sync = SyncService::new(cache.clone(), upstream, Arc::new(Config::for_tests()));
        let outcome = sync.sync_with_upstream().await.unwrap();
        assert_eq!(outcome.updated, 1);

        let merged = cache
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.upstream_id.as_deref() == Some("up-1"))
            .unwrap();
        assert_eq!(merged.status, InstanceStatus::Exited);
        assert_eq!(merged.product.as_ref().unwrap().region, "AS-SGP-02");
        assert_eq!(merged.connection.ports.len(), 1);
        assert_eq!(merged.connection.ports[0].port, 8080);
    }

    #[tokio::test]
    async fn http_check_marks_2xx_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let connection = vec![PortEndpoint {
            port: 8080,
            endpoint: server.uri().trim_start_matches("http://").to_string(),
        }];
        let declared = vec![TemplatePort {
            port: 8080,
            kind: PortKind::Http,
            path: "/".to_string(),
        }];
        let result = check_endpoints(&client, &connection, &declared, Duration::from_secs(2)).await;
        assert_eq!(result.overall_status, OverallHealth::Healthy);
    }

    #[tokio::test]
    async fn missing_connection_endpoint_is_unhealthy() {
        let client = reqwest::Client::new();
        let declared = vec![TemplatePort {
            port: 22,
            kind: PortKind::Tcp,
            path: String::new(),
        }];
        let result = check_endpoints(&client, &[], &declared, Duration::from_millis(50)).await;
        assert_eq!(result.overall_status, OverallHealth::Unhealthy);
        assert!(!result.endpoints[0].healthy);
    }

    fn idle_scheduler_status() -> crate::scheduler::SchedulerStatus {
        crate::scheduler::SchedulerStatus {
            last_sync_at: None,
            last_migration_enqueued_at: None,
            last_auto_stop_enqueued_at: None,
            is_running: false,
            is_enabled: false,
            last_execution: None,
            next_execution: None,
            total_executions: 0,
            failed_executions: 0,
            uptime: Duration::from_secs(0),
            current_job_id: None,
        }
    }

    #[test]
    fn summary_degrades_when_circuit_open() {
        let summary = build_summary(
            "redis",
            QueueStats {
                pending: 0,
                processing: 0,
                completed: 0,
            },
            CircuitState::Open,
            idle_scheduler_status(),
        );
        assert_eq!(summary.status, "degraded");
    }

    #[test]
    fn summary_degrades_when_scheduler_unhealthy() {
        let mut scheduler = idle_scheduler_status();
        scheduler.total_executions = 4;
        scheduler.failed_executions = 2;
        let summary = build_summary(
            "redis",
            QueueStats {
                pending: 0,
                processing: 0,
                completed: 0,
            },
            CircuitState::Closed,
            scheduler,
        );
        assert_eq!(summary.status, "degraded");
    }
}
