// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The instance record, its lifecycle state machine, and the service that
//! mutates it on behalf of request handlers and job handlers.

pub mod state;

pub use state::InstanceStatus;

use crate::cache::{Cache, ProductSnapshot, TemplateSnapshot};
use crate::config::Config;
use crate::error::CoreError;
use crate::queue::JobQueue;
use crate::upstream::{CreateInstancePayload, UpstreamAdapter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Billing mode for a created instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// Spot pricing; subject to reclamation.
    Spot,
    /// On-demand pricing.
    OnDemand,
}

/// User intent captured at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Number of GPUs requested.
    pub gpu_num: u32,
    /// Root filesystem size, in GB.
    pub rootfs_size: u32,
    /// Billing mode.
    pub billing_mode: BillingMode,
    /// Region explicitly requested by the caller.
    pub requested_region: String,
    /// Per-instance webhook URL override.
    pub webhook_url: Option<String>,
    /// Per-instance webhook secret override.
    pub webhook_secret: Option<String>,
}

/// A single exposed endpoint once an instance is `ready`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortEndpoint {
    /// Container port.
    pub port: u16,
    /// Publicly reachable URL or host:port.
    pub endpoint: String,
}

/// Connection details populated once an instance reaches `ready`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    /// Per-port public endpoints.
    pub ports: Vec<PortEndpoint>,
    /// Convenience SSH URL, if the template exposes an SSH port.
    pub ssh_url: Option<String>,
    /// Convenience Jupyter URL, if the template exposes one.
    pub jupyter_url: Option<String>,
}

/// Named timestamps tracked across an instance's lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Timestamps {
    /// When the local record was first inserted.
    pub created: Option<DateTime<Utc>>,
    /// When a start intent was received.
    pub start_requested: Option<DateTime<Utc>>,
    /// When upstream first reported `starting`.
    pub instance_starting: Option<DateTime<Utc>>,
    /// When upstream first reported `running`.
    pub instance_running: Option<DateTime<Utc>>,
    /// When health checking began.
    pub health_check_started: Option<DateTime<Utc>>,
    /// When health checking concluded.
    pub health_check_completed: Option<DateTime<Utc>>,
    /// When the instance reached `ready`.
    pub ready: Option<DateTime<Utc>>,
    /// When a stop intent was received.
    pub stopping: Option<DateTime<Utc>>,
    /// When the instance was confirmed stopped.
    pub stopped: Option<DateTime<Utc>>,
    /// When the instance was marked terminated.
    pub terminated: Option<DateTime<Utc>>,
    /// Last time the client signaled activity (`touchLastUsed`).
    pub last_used: Option<DateTime<Utc>>,
    /// Last time this record was reconciled against upstream.
    pub last_synced: Option<DateTime<Utc>>,
    /// Last successful migration, if any.
    pub last_migration: Option<DateTime<Utc>>,
}

/// Overall health-check status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    /// All endpoints passed.
    Healthy,
    /// At least one passed and at least one failed.
    Partial,
    /// All endpoints failed.
    Unhealthy,
}

/// Health result for a single declared port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointHealth {
    /// Port checked.
    pub port: u16,
    /// HTTP path checked (empty for `tcp`).
    pub path: String,
    /// Port protocol.
    pub kind: crate::cache::PortKind,
    /// Whether this endpoint currently passes.
    pub healthy: bool,
    /// Last time this endpoint was checked.
    pub last_checked: DateTime<Utc>,
    /// Round-trip time of the last check, in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Error from the last failed check.
    pub error: Option<String>,
}

/// Aggregated health-check result for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    /// Overall status derived from `endpoints`.
    pub overall_status: OverallHealth,
    /// Per-endpoint detail.
    pub endpoints: Vec<EndpointHealth>,
}

/// Phase of an in-progress start operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    /// The start intent was received.
    Initiated,
    /// `MONITOR_STARTUP` is polling upstream.
    Monitoring,
    /// Health checks are running.
    HealthChecking,
    /// The instance reached `ready`.
    Completed,
    /// The start failed (timeout or health failure).
    Failed,
}

/// Tracks a single in-progress start operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartupOperation {
    /// Operation id returned synchronously to the caller.
    pub operation_id: String,
    /// Current phase.
    pub phase: StartupPhase,
    /// Per-phase timestamps, mirroring [`Timestamps`] but scoped to this
    /// operation.
    pub phases: HashMap<String, DateTime<Utc>>,
}

/// Where a listed record's data originated, used by `listInstances`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Only a local record exists.
    Local,
    /// Only an upstream record exists (no matching local record).
    Upstream,
    /// A local record was merged with an upstream snapshot.
    Merged,
}

/// Consistency of a merged record, comparing local and upstream state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DataConsistency {
    /// Local and upstream agree.
    Consistent,
    /// Local record reflects a more recent state than upstream has caught
    /// up to.
    LocalNewer,
    /// Upstream reflects a more recent state than the local record has
    /// observed.
    UpstreamNewer,
    /// Local and upstream disagree in a way that isn't a simple staleness
    /// ordering.
    Conflicted,
}

/// The canonical per-instance record. See the crate's `SPEC_FULL.md` §3.1
/// for field semantics and invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Local identifier, prefix `inst-`. Never reused.
    pub instance_id: String,
    /// Upstream-assigned identifier. Empty until creation succeeds, then
    /// immutable (see the `at_most_one_upstream_id` invariant test).
    pub upstream_id: Option<String>,
    /// User-supplied label.
    pub name: String,
    /// Current lifecycle status.
    pub status: InstanceStatus,
    /// Resolved product snapshot.
    pub product: Option<ProductSnapshot>,
    /// Resolved template snapshot.
    pub template: Option<TemplateSnapshot>,
    /// User intent at creation.
    pub config: InstanceConfig,
    /// Populated once `ready`.
    pub connection: ConnectionInfo,
    /// Named lifecycle timestamps.
    pub timestamps: Timestamps,
    /// Most recent failure description, if any.
    pub last_error: Option<String>,
    /// Latest health-check result.
    pub health_check: Option<HealthCheckResult>,
    /// In-progress start operation, if any.
    pub startup_operation: Option<StartupOperation>,
    /// Provenance tag used by the list endpoint.
    pub source: Source,
    /// Set when `source = merged`; omitted otherwise.
    pub data_consistency: Option<DataConsistency>,
}

impl InstanceRecord {
    /// Mint a new record in status `creating`. The `instanceId` has the
    /// form `inst-<unix millis>-<random suffix>`.
    pub fn new(name: String, config: InstanceConfig, now: DateTime<Utc>) -> Self {
        let instance_id = mint_instance_id(now);
        InstanceRecord {
            instance_id,
            upstream_id: None,
            name,
            status: InstanceStatus::Creating,
            product: None,
            template: None,
            config,
            connection: ConnectionInfo::default(),
            timestamps: Timestamps {
                created: Some(now),
                ..Default::default()
            },
            last_error: None,
            health_check: None,
            startup_operation: None,
            source: Source::Local,
            data_consistency: None,
        }
    }

    /// Transition `status`, validating the edge and keeping the invariant
    /// that `ready` implies a populated, healthy connection.
    pub fn transition(&mut self, to: InstanceStatus) -> Result<(), CoreError> {
        self.status.validate_transition(to, &self.instance_id)?;
        if to == InstanceStatus::Ready {
            let healthy = self
                .health_check
                .as_ref()
                .is_some_and(|h| h.overall_status == OverallHealth::Healthy);
            if !healthy || self.connection.ports.is_empty() {
                return Err(CoreError::Conflict {
                    instance_id: self.instance_id.clone(),
                    expected: "populated connection and healthy health_check".to_string(),
                    actual: "incomplete connection/health_check".to_string(),
                });
            }
        }
        self.status = to;
        Ok(())
    }

    /// Set `upstreamId`, enforcing the at-most-once invariant.
    pub fn set_upstream_id(&mut self, upstream_id: String) -> Result<(), CoreError> {
        if self.upstream_id.is_some() {
            return Err(CoreError::Validation {
                field: "upstreamId".to_string(),
                message: "upstreamId is already set and is immutable".to_string(),
            });
        }
        self.upstream_id = Some(upstream_id);
        Ok(())
    }
}

fn mint_instance_id(now: DateTime<Utc>) -> String {
    let suffix: String = {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..8)
            .map(|_| {
                let idx = rng.gen_range(0..36);
                std::char::from_digit(idx, 36).unwrap()
            })
            .collect()
    };
    format!("inst-{}-{}", now.timestamp_millis(), suffix)
}

/// Either a local instance id or a user-supplied name, accepted by
/// `startInstance`/`stopInstance`.
#[derive(Debug, Clone)]
pub enum InstanceSelector {
    /// Select by local instance id.
    Id(String),
    /// Select by user-supplied name (first match wins; name uniqueness is
    /// the HTTP layer's responsibility, not the core's).
    Name(String),
}

/// Response to a successful `createInstance` call.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstanceResponse {
    /// Local instance id.
    pub instance_id: String,
    /// Upstream id, if creation already completed synchronously.
    pub upstream_id: Option<String>,
    /// Current status (`created` on success).
    pub status: InstanceStatus,
    /// Resolved product id.
    pub product_id: String,
    /// Region the product was resolved in (after fallback).
    pub region: String,
    /// Spot price at resolution time.
    pub spot_price: f64,
}

/// Response to `startInstance`/`stopInstance`.
#[derive(Debug, Clone, Serialize)]
pub struct OperationResponse {
    /// Operation id for polling/webhook correlation.
    pub operation_id: String,
    /// Status immediately after the intent was applied.
    pub status: InstanceStatus,
}

/// Mutates [`InstanceRecord`]s on behalf of request handlers and job
/// handlers. Holds the cache, upstream adapter, job queue, and config as
/// shared fields — the same shape as [`crate::app::AppContext`] exposes.
pub struct InstanceService {
    cache: Arc<Cache>,
    upstream: Arc<dyn UpstreamAdapter>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
}

impl InstanceService {
    /// Construct a service over the given collaborators.
    pub fn new(
        cache: Arc<Cache>,
        upstream: Arc<dyn UpstreamAdapter>,
        queue: Arc<JobQueue>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cache,
            upstream,
            queue,
            config,
        }
    }

    /// Execute the creation path described in the crate's `SPEC_FULL.md`
    /// §4.3: resolve product (with region fallback) and template, insert a
    /// `creating` record, call upstream synchronously, then enqueue
    /// monitoring.
    #[tracing::instrument(skip(self), fields(name = %name, product_name = %product_name))]
    pub async fn create_instance(
        &self,
        name: String,
        product_name: String,
        template_id: String,
        config: InstanceConfig,
    ) -> Result<CreateInstanceResponse, CoreError> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation {
                field: "name".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let (product, region_used) = self
            .upstream
            .get_optimal_product(&product_name, &config.requested_region)
            .await?;
        let template = self
            .upstream
            .get_template(&template_id)
            .await
            .map_err(|err| match err {
                CoreError::NotFound { .. } => CoreError::NotFound {
                    kind: "template".to_string(),
                    id: template_id.clone(),
                },
                other => other,
            })?;

        let image_auth_id = match &template.registry_auth_id {
            Some(id) => {
                self.upstream.get_registry_auth(id).await?;
                Some(id.clone())
            }
            None => None,
        };

        let now = Utc::now();
        let mut record = InstanceRecord::new(name, config.clone(), now);
        record.product = Some(product.clone());
        record.template = Some(template.clone());
        self.cache.put_instance(&record).await?;

        let payload = CreateInstancePayload {
            product_id: product.id.clone(),
            template_id: template_id.clone(),
            region: region_used.clone(),
            image_url: template.image_url.clone(),
            image_auth_id,
            gpu_num: config.gpu_num,
            rootfs_size: config.rootfs_size,
            billing_mode: config.billing_mode,
            port_mappings: template.ports.clone(),
            envs: template.environment.clone(),
        };
        let created = self.upstream.create_instance(payload).await;

        let created = match created {
            Ok(created) => created,
            Err(err) => {
                record.transition(InstanceStatus::Failed)?;
                record.last_error = Some(err.to_string());
                self.cache.put_instance(&record).await?;
                return Err(err);
            }
        };

        record.set_upstream_id(created.upstream_id.clone())?;
        record.transition(InstanceStatus::Created)?;
        self.cache.put_instance(&record).await?;

        self.queue
            .enqueue(
                crate::queue::JobType::MonitorInstance,
                serde_json::json!({ "instanceId": record.instance_id }),
                0,
                self.config.max_retry_attempts,
                Some(format!("monitor-{}", record.instance_id)),
            )
            .await?;

        Ok(CreateInstanceResponse {
            instance_id: record.instance_id,
            upstream_id: record.upstream_id,
            status: record.status,
            product_id: product.id,
            region: region_used,
            spot_price: product.spot_price,
        })
    }

    /// Fetch a record by local id.
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord, CoreError> {
        self.cache
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                kind: "instance".to_string(),
                id: instance_id.to_string(),
            })
    }

    async fn resolve(&self, selector: &InstanceSelector) -> Result<InstanceRecord, CoreError> {
        match selector {
            InstanceSelector::Id(id) => self.get_instance(id).await,
            InstanceSelector::Name(name) => self
                .cache
                .list_instances()
                .await?
                .into_iter()
                .find(|record| &record.name == name)
                .ok_or_else(|| CoreError::NotFound {
                    kind: "instance".to_string(),
                    id: name.clone(),
                }),
        }
    }

    /// Start path: mint a startup operation, set `starting`, enqueue
    /// `MONITOR_STARTUP`.
    #[tracing::instrument(skip(self, selector))]
    pub async fn start_instance(
        &self,
        selector: InstanceSelector,
    ) -> Result<OperationResponse, CoreError> {
        let mut record = self.resolve(&selector).await?;
        let now = Utc::now();
        record.transition(InstanceStatus::Starting)?;
        let operation_id = format!("op-{}", now.timestamp_millis());
        record.timestamps.start_requested = Some(now);
        record.startup_operation = Some(StartupOperation {
            operation_id: operation_id.clone(),
            phase: StartupPhase::Initiated,
            phases: HashMap::from([("startRequested".to_string(), now)]),
        });
        self.cache.put_instance(&record).await?;

        self.queue
            .enqueue(
                crate::queue::JobType::MonitorStartup,
                serde_json::json!({
                    "instanceId": record.instance_id,
                    "operationId": operation_id,
                }),
                0,
                self.config.max_retry_attempts,
                Some(format!("monitor-startup-{}", record.instance_id)),
            )
            .await?;

        Ok(OperationResponse {
            operation_id,
            status: record.status,
        })
    }

    /// Stop path: call upstream synchronously, then enqueue the webhook.
    #[tracing::instrument(skip(self, selector))]
    pub async fn stop_instance(
        &self,
        selector: InstanceSelector,
    ) -> Result<OperationResponse, CoreError> {
        let mut record = self.resolve(&selector).await?;
        let upstream_id = record
            .upstream_id
            .clone()
            .ok_or_else(|| CoreError::Conflict {
                instance_id: record.instance_id.clone(),
                expected: "an instance with an upstreamId".to_string(),
                actual: "no upstreamId yet".to_string(),
            })?;

        record.transition(InstanceStatus::Stopping)?;
        record.timestamps.stopping = Some(Utc::now());
        self.cache.put_instance(&record).await?;

        self.upstream.stop_instance(&upstream_id).await?;

        record.transition(InstanceStatus::Stopped)?;
        record.timestamps.stopped = Some(Utc::now());
        self.cache.put_instance(&record).await?;

        let operation_id = format!("op-{}", Utc::now().timestamp_millis());
        if let Some(webhook_url) = record.config.webhook_url.clone() {
            self.queue
                .enqueue(
                    crate::queue::JobType::SendWebhook,
                    serde_json::json!({
                        "url": webhook_url,
                        "secret": record.config.webhook_secret,
                        "instanceId": record.instance_id,
                        "upstreamId": record.upstream_id,
                        "status": "stopped",
                    }),
                    0,
                    5,
                    None,
                )
                .await?;
        }

        Ok(OperationResponse {
            operation_id,
            status: record.status,
        })
    }

    /// Delete path: terminate locally and best-effort delete upstream.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        let mut record = self.get_instance(instance_id).await?;
        if let Some(upstream_id) = &record.upstream_id {
            self.upstream.delete_instance(upstream_id).await?;
        }
        record.transition(InstanceStatus::Terminated)?;
        record.timestamps.terminated = Some(Utc::now());
        self.cache.put_instance(&record).await?;
        Ok(())
    }

    /// PUT-style intent: update `timestamps.lastUsed` only.
    pub async fn touch_last_used(
        &self,
        instance_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, CoreError> {
        let mut record = self.get_instance(instance_id).await?;
        let at = at.unwrap_or_else(Utc::now);
        record.timestamps.last_used = Some(at);
        self.cache.put_instance(&record).await?;
        Ok(at)
    }

    /// List all locally-known instance records. Merging with a live
    /// upstream snapshot (per the merge semantics in §4.3) is performed by
    /// [`crate::health::sync_with_upstream`]; this method returns the local
    /// view only.
    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        self.cache.list_instances().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> InstanceConfig {
        InstanceConfig {
            gpu_num: 1,
            rootfs_size: 60,
            billing_mode: BillingMode::OnDemand,
            requested_region: "CN-HK-01".to_string(),
            webhook_url: None,
            webhook_secret: None,
        }
    }

    #[test]
    fn new_record_starts_in_creating_with_created_timestamp() {
        let now = Utc::now();
        let record = InstanceRecord::new("e2e-1".to_string(), sample_config(), now);
        assert_eq!(record.status, InstanceStatus::Creating);
        assert_eq!(record.timestamps.created, Some(now));
        assert!(record.instance_id.starts_with("inst-"));
    }

    #[test]
    fn upstream_id_can_only_be_set_once() {
        let mut record = InstanceRecord::new("e2e-1".to_string(), sample_config(), Utc::now());
        record.set_upstream_id("u1".to_string()).unwrap();
        let err = record.set_upstream_id("u2".to_string()).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn ready_requires_healthy_connection() {
        let mut record = InstanceRecord::new("e2e-1".to_string(), sample_config(), Utc::now());
        record.set_upstream_id("u1".to_string()).unwrap();
        record.transition(InstanceStatus::Created).unwrap();
        record.transition(InstanceStatus::Starting).unwrap();
        record.transition(InstanceStatus::Running).unwrap();
        let err = record.transition(InstanceStatus::Ready).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));

        record.connection.ports.push(PortEndpoint {
            port: 8888,
            endpoint: "http://host:8888".to_string(),
        });
        record.health_check = Some(HealthCheckResult {
            overall_status: OverallHealth::Healthy,
            endpoints: vec![],
        });
        record.transition(InstanceStatus::Ready).unwrap();
        assert_eq!(record.status, InstanceStatus::Ready);
    }

    #[test]
    fn round_trip_serialization() {
        let mut record = InstanceRecord::new("e2e-1".to_string(), sample_config(), Utc::now());
        record.last_error = Some("boom".to_string());
        let json = serde_json::to_string(&record).unwrap();
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, record.instance_id);
        assert_eq!(back.status, record.status);
        assert_eq!(back.last_error, record.last_error);
    }
}
