// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concrete [`JobHandler`] implementations, one per [`JobType`] the worker
//! actually sees. `CREATE_INSTANCE` has no handler here: the current
//! creation path ([`crate::instance::InstanceService::create_instance`]) is
//! synchronous and never enqueues that job type.

use super::{JobHandler, JobOutcome};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::CoreError;
use crate::health;
use crate::instance::{
    InstanceRecord, InstanceSelector, InstanceService, InstanceStatus, OverallHealth, StartupPhase,
};
use crate::migration::MigrationEngine;
use crate::queue::{JobQueue, JobRecord, JobType};
use crate::upstream::UpstreamAdapter;
use crate::webhook::{WebhookClient, WebhookPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const AUTO_STOP_IDLE_THRESHOLD: Duration = Duration::from_secs(20 * 60);

fn deadline_elapsed(anchor: DateTime<Utc>, max_wait: std::time::Duration) -> bool {
    let max_wait = chrono::Duration::from_std(max_wait).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() - anchor > max_wait
}

fn set_phase(record: &mut InstanceRecord, phase: StartupPhase) {
    let Some(op) = record.startup_operation.as_mut() else {
        return;
    };
    op.phase = phase;
    let key = match phase {
        StartupPhase::Initiated => "startRequested",
        StartupPhase::Monitoring => "monitoring",
        StartupPhase::HealthChecking => "healthChecking",
        StartupPhase::Completed => "completed",
        StartupPhase::Failed => "failed",
    };
    op.phases.insert(key.to_string(), Utc::now());
}

async fn enqueue_status_webhook(
    queue: &JobQueue,
    record: &InstanceRecord,
    status: &str,
    reason: Option<String>,
) -> Result<(), CoreError> {
    let Some(url) = record.config.webhook_url.clone() else {
        return Ok(());
    };
    queue
        .enqueue(
            JobType::SendWebhook,
            serde_json::json!({
                "url": url,
                "secret": record.config.webhook_secret,
                "instanceId": record.instance_id,
                "upstreamId": record.upstream_id,
                "status": status,
                "reason": reason,
            }),
            0,
            5,
            None,
        )
        .await?;
    Ok(())
}

/// Drives one `creating`/`starting` instance one step closer to `ready`,
/// shared by [`MonitorInstanceHandler`] and [`MonitorStartupHandler`]. Each
/// call advances exactly one state transition and reschedules itself; the
/// long poll lives in the job queue's reschedule mechanism, not a loop here.
#[allow(clippy::too_many_arguments)]
async fn advance_towards_ready(
    cache: &Cache,
    upstream: &dyn UpstreamAdapter,
    http_client: &reqwest::Client,
    queue: &JobQueue,
    config: &Config,
    mut record: InstanceRecord,
    anchor: DateTime<Utc>,
    poll_interval: Duration,
    is_startup: bool,
) -> Result<JobOutcome, CoreError> {
    match record.status {
        InstanceStatus::Created | InstanceStatus::Stopped | InstanceStatus::Exited => {
            let upstream_id = record.upstream_id.clone().ok_or_else(|| CoreError::Conflict {
                instance_id: record.instance_id.clone(),
                expected: "an instance with an upstreamId".to_string(),
                actual: "no upstreamId yet".to_string(),
            })?;
            upstream.start_instance(&upstream_id).await?;
            record.transition(InstanceStatus::Starting)?;
            record.timestamps.instance_starting = Some(Utc::now());
            if is_startup {
                set_phase(&mut record, StartupPhase::Monitoring);
            }
            cache.put_instance(&record).await?;
            if is_startup {
                enqueue_status_webhook(queue, &record, "startup_initiated", None).await?;
            }
            Ok(JobOutcome::RescheduleAfter(poll_interval))
        }

        InstanceStatus::Starting => {
            let upstream_id = record.upstream_id.clone().ok_or_else(|| CoreError::Conflict {
                instance_id: record.instance_id.clone(),
                expected: "an instance with an upstreamId".to_string(),
                actual: "no upstreamId yet".to_string(),
            })?;
            let upstream_instance = upstream.get_instance(&upstream_id).await?;
            if upstream_instance.status.eq_ignore_ascii_case("running") {
                record.connection.ports = upstream_instance.port_mappings;
                record.timestamps.instance_running = Some(Utc::now());
                record.transition(InstanceStatus::Running)?;
                cache.put_instance(&record).await?;
                return Ok(JobOutcome::RescheduleAfter(Duration::from_secs(0)));
            }
            if deadline_elapsed(anchor, config.startup_max_wait) {
                return fail_startup(
                    cache,
                    queue,
                    record,
                    is_startup,
                    "startup deadline exceeded while waiting for upstream to report running",
                )
                .await;
            }
            cache.put_instance(&record).await?;
            Ok(JobOutcome::RescheduleAfter(poll_interval))
        }

        InstanceStatus::Running => {
            record.transition(InstanceStatus::HealthChecking)?;
            record.timestamps.health_check_started = Some(Utc::now());
            if is_startup {
                set_phase(&mut record, StartupPhase::HealthChecking);
            }
            cache.put_instance(&record).await?;
            Ok(JobOutcome::RescheduleAfter(Duration::from_secs(0)))
        }

        InstanceStatus::HealthChecking => {
            let Some(template) = record.template.clone() else {
                return fail_startup(
                    cache,
                    queue,
                    record,
                    is_startup,
                    "no template snapshot recorded, cannot run health checks",
                )
                .await;
            };
            let result =
                health::check_endpoints(http_client, &record.connection.ports, &template.ports, HEALTH_CHECK_TIMEOUT)
                    .await;
            let healthy = result.overall_status == OverallHealth::Healthy;
            record.health_check = Some(result);

            if healthy {
                record.timestamps.health_check_completed = Some(Utc::now());
                record.transition(InstanceStatus::Ready)?;
                record.timestamps.ready = Some(Utc::now());
                if is_startup {
                    set_phase(&mut record, StartupPhase::Completed);
                }
                cache.put_instance(&record).await?;
                let status = if is_startup { "startup_completed" } else { "ready" };
                enqueue_status_webhook(queue, &record, status, None).await?;
                return Ok(JobOutcome::Done);
            }

            if deadline_elapsed(anchor, config.startup_max_wait) {
                record.timestamps.health_check_completed = Some(Utc::now());
                return fail_startup(
                    cache,
                    queue,
                    record,
                    is_startup,
                    "health checks did not pass before the startup deadline",
                )
                .await;
            }
            cache.put_instance(&record).await?;
            Ok(JobOutcome::RescheduleAfter(poll_interval))
        }

        // Already ready, stopping/stopped, or terminally failed/terminated:
        // nothing left for a monitor job to do.
        _ => Ok(JobOutcome::Done),
    }
}

async fn fail_startup(
    cache: &Cache,
    queue: &JobQueue,
    mut record: InstanceRecord,
    is_startup: bool,
    reason: &str,
) -> Result<JobOutcome, CoreError> {
    record.last_error = Some(reason.to_string());
    record.transition(InstanceStatus::Failed)?;
    if is_startup {
        set_phase(&mut record, StartupPhase::Failed);
    }
    cache.put_instance(&record).await?;
    let status = if is_startup { "startup_failed" } else { "failed" };
    enqueue_status_webhook(queue, &record, status, Some(reason.to_string())).await?;
    Ok(JobOutcome::Done)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorInstancePayload {
    instance_id: String,
}

/// Drives a freshly-created instance from `created` through to `ready`
/// (or `failed`), anchored to the record's `created` timestamp.
pub struct MonitorInstanceHandler {
    cache: Arc<Cache>,
    upstream: Arc<dyn UpstreamAdapter>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
    http_client: reqwest::Client,
}

impl MonitorInstanceHandler {
    /// Construct a handler over the shared collaborators.
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
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl JobHandler for MonitorInstanceHandler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, CoreError> {
        let payload: MonitorInstancePayload =
            serde_json::from_value(job.payload.clone()).map_err(|err| CoreError::Validation {
                field: "payload".to_string(),
                message: err.to_string(),
            })?;

        let Some(record) = self.cache.get_instance(&payload.instance_id).await? else {
            warn!(instance_id = %payload.instance_id, "monitor_instance job for unknown instance, dropping");
            return Ok(JobOutcome::Done);
        };
        let anchor = record.timestamps.created.unwrap_or_else(Utc::now);

        advance_towards_ready(
            &self.cache,
            self.upstream.as_ref(),
            &self.http_client,
            &self.queue,
            &self.config,
            record,
            anchor,
            self.config.instance_poll_interval,
            false,
        )
        .await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonitorStartupPayload {
    instance_id: String,
}

/// Drives an explicit start intent from `starting` through to `ready` (or
/// `startup_failed`), anchored to the record's `startRequested` timestamp
/// and updating the in-progress [`crate::instance::StartupOperation`].
pub struct MonitorStartupHandler {
    cache: Arc<Cache>,
    upstream: Arc<dyn UpstreamAdapter>,
    queue: Arc<JobQueue>,
    config: Arc<Config>,
    http_client: reqwest::Client,
}

impl MonitorStartupHandler {
    /// Construct a handler over the shared collaborators.
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
            http_client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl JobHandler for MonitorStartupHandler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, CoreError> {
        let payload: MonitorStartupPayload =
            serde_json::from_value(job.payload.clone()).map_err(|err| CoreError::Validation {
                field: "payload".to_string(),
                message: err.to_string(),
            })?;

        let Some(record) = self.cache.get_instance(&payload.instance_id).await? else {
            warn!(instance_id = %payload.instance_id, "monitor_startup job for unknown instance, dropping");
            return Ok(JobOutcome::Done);
        };
        let anchor = record
            .timestamps
            .start_requested
            .or(record.timestamps.created)
            .unwrap_or_else(Utc::now);

        advance_towards_ready(
            &self.cache,
            self.upstream.as_ref(),
            &self.http_client,
            &self.queue,
            &self.config,
            record,
            anchor,
            self.config.instance_poll_interval,
            true,
        )
        .await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendWebhookPayload {
    url: String,
    #[serde(default)]
    secret: Option<String>,
    instance_id: String,
    #[serde(default)]
    upstream_id: Option<String>,
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Delivers one signed outbound webhook notification.
pub struct SendWebhookHandler {
    client: Arc<WebhookClient>,
}

impl SendWebhookHandler {
    /// Construct a handler over the shared webhook client.
    pub fn new(client: Arc<WebhookClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for SendWebhookHandler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, CoreError> {
        let payload: SendWebhookPayload =
            serde_json::from_value(job.payload.clone()).map_err(|err| CoreError::Validation {
                field: "payload".to_string(),
                message: err.to_string(),
            })?;

        let webhook_payload = WebhookPayload {
            instance_id: payload.instance_id,
            upstream_id: payload.upstream_id,
            status: payload.status,
            timestamp: Utc::now(),
            reason: payload.reason,
            error: payload.error,
            ..Default::default()
        };

        self.client
            .deliver(&payload.url, payload.secret.as_deref().unwrap_or(""), &webhook_payload)
            .await?;
        Ok(JobOutcome::Done)
    }
}

/// Runs one migration sweep. Errors propagate for the job-level retry
/// policy; the sweep's own per-instance errors are already absorbed into
/// [`crate::migration::MigrationSummary::errors`] and don't fail the job.
pub struct MigrateSpotInstancesHandler {
    engine: Arc<MigrationEngine>,
}

impl MigrateSpotInstancesHandler {
    /// Construct a handler over the shared migration engine.
    pub fn new(engine: Arc<MigrationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for MigrateSpotInstancesHandler {
    async fn handle(&self, _job: &JobRecord) -> Result<JobOutcome, CoreError> {
        let summary = self.engine.run_sweep().await?;
        info!(?summary, "migration sweep job complete");
        Ok(JobOutcome::Done)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AutoStopPayload {
    #[serde(default)]
    dry_run: bool,
}

/// Stops `running` instances idle past [`AUTO_STOP_IDLE_THRESHOLD`]. Errors
/// stopping an individual instance are logged and skipped rather than
/// aborting the sweep.
pub struct AutoStopHandler {
    instance_service: Arc<InstanceService>,
}

impl AutoStopHandler {
    /// Construct a handler over the shared instance service.
    pub fn new(instance_service: Arc<InstanceService>) -> Self {
        Self { instance_service }
    }
}

#[async_trait]
impl JobHandler for AutoStopHandler {
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, CoreError> {
        let payload: AutoStopPayload = serde_json::from_value(job.payload.clone()).unwrap_or_default();
        run_auto_stop_sweep(&self.instance_service, payload.dry_run).await?;
        Ok(JobOutcome::Done)
    }
}

/// Sweep all `running` instances and stop the ones idle past
/// [`AUTO_STOP_IDLE_THRESHOLD`]. Shared between [`AutoStopHandler`] and the
/// manual trigger surface so both paths apply the same idle definition.
pub async fn run_auto_stop_sweep(instance_service: &InstanceService, dry_run: bool) -> Result<(), CoreError> {
    let instances = instance_service.list_instances().await?;
    let threshold =
        chrono::Duration::from_std(AUTO_STOP_IDLE_THRESHOLD).unwrap_or_else(|_| chrono::Duration::minutes(20));
    let now = Utc::now();

    for record in instances.into_iter().filter(|r| r.status == InstanceStatus::Running) {
        let last_activity = [
            record.timestamps.last_used,
            record.timestamps.ready,
            record.timestamps.start_requested,
            record.timestamps.created,
        ]
        .into_iter()
        .flatten()
        .max();

        let Some(last_activity) = last_activity else {
            continue;
        };
        if now - last_activity < threshold {
            continue;
        }

        if dry_run {
            info!(instance_id = %record.instance_id, "auto-stop: eligible (dry run, not stopping)");
            continue;
        }

        if let Err(err) = instance_service
            .stop_instance(InstanceSelector::Id(record.instance_id.clone()))
            .await
        {
            warn!(instance_id = %record.instance_id, error = %err, "auto-stop failed for this instance, continuing sweep");
        }
    }

    Ok(())
}
