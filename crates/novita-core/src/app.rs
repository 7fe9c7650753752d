// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`AppContext`]: the explicit application-context struct that wires every
//! collaborator together and owns the process's two background loops (the
//! job worker and the maintenance scheduler).
//!
//! Everything in this crate is reached through an `AppContext` rather than
//! through module-level statics — there is exactly one construction path,
//! and tests build their own instance over [`crate::store::MemoryStore`]
//! instead of reaching for a shared global.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::CoreError;
use crate::health::{self, HealthSummary, SyncService, SyncOutcome};
use crate::instance::{
    CreateInstanceResponse, InstanceConfig, InstanceRecord, InstanceSelector, InstanceService, OperationResponse,
};
use crate::migration::{MigrationEngine, MigrationSummary};
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::store::{MemoryStore, RedisStore, Store};
use crate::upstream::{self, HttpUpstreamAdapter, UpstreamAdapter};
use crate::webhook::WebhookClient;
use crate::worker::handlers::{
    AutoStopHandler, MigrateSpotInstancesHandler, MonitorInstanceHandler, MonitorStartupHandler, SendWebhookHandler,
};
use crate::worker::JobWorker;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const JOB_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Every live collaborator, constructed once at startup and shared behind
/// `Arc` by the HTTP layer, the worker loop, and the scheduler loop alike.
pub struct AppContext {
    /// Resolved configuration.
    pub config: Arc<Config>,
    /// Backing key/value store (Redis, or the in-memory fallback).
    pub store: Arc<dyn Store>,
    /// Namespaced cache over the store.
    pub cache: Arc<Cache>,
    /// Upstream GPU provider adapter.
    pub upstream: Arc<dyn UpstreamAdapter>,
    /// Persistent job queue.
    pub queue: Arc<JobQueue>,
    /// Instance lifecycle service.
    pub instance_service: Arc<InstanceService>,
    /// Startup/periodic sync service.
    pub sync_service: Arc<SyncService>,
    /// Spot-instance migration engine.
    pub migration_engine: Arc<MigrationEngine>,
    /// Outbound webhook client.
    pub webhook_client: Arc<WebhookClient>,
    worker: Arc<JobWorker>,
    scheduler: Arc<Scheduler>,
}

impl AppContext {
    /// Wire every collaborator from a resolved [`Config`]. Connects to the
    /// configured store, falling back to [`MemoryStore`] when
    /// `store_enable_fallback` is set and the connection attempt fails; with
    /// no `store_url` at all, the in-memory store is used directly (and a
    /// warning logged, since the health summary reports that as degraded).
    pub async fn new(config: Config) -> Result<Self, CoreError> {
        let config = Arc::new(config);
        let store = build_store(&config).await?;

        let cache = Arc::new(Cache::new(store.clone()));
        let upstream: Arc<dyn UpstreamAdapter> =
            Arc::new(HttpUpstreamAdapter::new(&config, upstream::default_regions())?);
        let queue = Arc::new(JobQueue::new(store.clone()));

        let instance_service = Arc::new(InstanceService::new(
            cache.clone(),
            upstream.clone(),
            queue.clone(),
            config.clone(),
        ));
        let sync_service = Arc::new(SyncService::new(cache.clone(), upstream.clone(), config.clone()));
        let migration_engine = Arc::new(MigrationEngine::new(
            store.clone(),
            cache.clone(),
            upstream.clone(),
            config.clone(),
        ));
        let webhook_client = Arc::new(WebhookClient::new());

        let mut worker = JobWorker::new(queue.clone(), JOB_TIMEOUT, IDLE_POLL_INTERVAL);
        worker.register(
            crate::queue::JobType::MonitorInstance,
            Arc::new(MonitorInstanceHandler::new(
                cache.clone(),
                upstream.clone(),
                queue.clone(),
                config.clone(),
            )),
        );
        worker.register(
            crate::queue::JobType::MonitorStartup,
            Arc::new(MonitorStartupHandler::new(
                cache.clone(),
                upstream.clone(),
                queue.clone(),
                config.clone(),
            )),
        );
        worker.register(
            crate::queue::JobType::SendWebhook,
            Arc::new(SendWebhookHandler::new(webhook_client.clone())),
        );
        worker.register(
            crate::queue::JobType::MigrateSpotInstances,
            Arc::new(MigrateSpotInstancesHandler::new(migration_engine.clone())),
        );
        worker.register(
            crate::queue::JobType::AutoStop,
            Arc::new(AutoStopHandler::new(instance_service.clone())),
        );

        let scheduler = Scheduler::new(store.clone(), queue.clone(), sync_service.clone(), config.clone());

        Ok(Self {
            config,
            store,
            cache,
            upstream,
            queue,
            instance_service,
            sync_service,
            migration_engine,
            webhook_client,
            worker: Arc::new(worker),
            scheduler: Arc::new(scheduler),
        })
    }

    /// Spawn the job worker and scheduler loops as background tasks.
    /// Callers hold the returned handles to await clean shutdown.
    pub fn spawn_background_tasks(&self) -> BackgroundTasks {
        let worker = self.worker.clone();
        let worker_handle = tokio::spawn(async move { worker.run().await });

        let scheduler = self.scheduler.clone();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        BackgroundTasks {
            worker_shutdown: self.worker.shutdown_handle(),
            scheduler_shutdown: self.scheduler.shutdown_handle(),
            worker_handle,
            scheduler_handle,
        }
    }

    /// Resolve a product/template and request instance creation
    /// synchronously, then enqueue startup monitoring.
    pub async fn create_instance(
        &self,
        name: String,
        product_name: String,
        template_id: String,
        config: InstanceConfig,
    ) -> Result<CreateInstanceResponse, CoreError> {
        self.instance_service
            .create_instance(name, product_name, template_id, config)
            .await
    }

    /// Fetch one instance record by id.
    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceRecord, CoreError> {
        self.instance_service.get_instance(instance_id).await
    }

    /// Request a start; the startup path runs asynchronously via
    /// `MONITOR_STARTUP`.
    pub async fn start_instance(&self, selector: InstanceSelector) -> Result<OperationResponse, CoreError> {
        self.instance_service.start_instance(selector).await
    }

    /// Stop synchronously.
    pub async fn stop_instance(&self, selector: InstanceSelector) -> Result<OperationResponse, CoreError> {
        self.instance_service.stop_instance(selector).await
    }

    /// Terminate locally and best-effort delete upstream.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        self.instance_service.delete_instance(instance_id).await
    }

    /// Record recent activity, resetting the auto-stop idle clock.
    pub async fn touch_last_used(
        &self,
        instance_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, CoreError> {
        self.instance_service.touch_last_used(instance_id, at).await
    }

    /// List all locally-known instances.
    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        self.instance_service.list_instances().await
    }

    /// Build the `GET /health` summary from current component state.
    pub async fn health(&self) -> Result<HealthSummary, CoreError> {
        let stats = self.queue.stats().await?;
        Ok(health::build_summary(
            self.store.backend_name(),
            stats,
            self.upstream.circuit_state(),
            self.scheduler.status(),
        ))
    }

    /// Run one sync pass immediately, bypassing the scheduler's interval and
    /// distributed lock. Intended for an operator-triggered endpoint.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome, CoreError> {
        self.sync_service.sync_with_upstream().await
    }

    /// Run one migration sweep immediately.
    pub async fn trigger_migration(&self) -> Result<MigrationSummary, CoreError> {
        self.migration_engine.run_sweep().await
    }

    /// Run one auto-stop sweep immediately.
    pub async fn trigger_auto_stop(&self, dry_run: bool) -> Result<(), CoreError> {
        crate::worker::handlers::run_auto_stop_sweep(&self.instance_service, dry_run).await
    }
}

/// Handles for the two background loops [`AppContext::spawn_background_tasks`]
/// starts, used to drive a graceful shutdown.
pub struct BackgroundTasks {
    worker_shutdown: Arc<Notify>,
    scheduler_shutdown: Arc<Notify>,
    worker_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Signal both loops to stop and wait for them to finish their current
    /// iteration.
    pub async fn shutdown(self) {
        self.scheduler_shutdown.notify_one();
        self.worker_shutdown.notify_one();

        if let Err(err) = self.scheduler_handle.await {
            warn!(error = %err, "scheduler task panicked during shutdown");
        }
        if let Err(err) = self.worker_handle.await {
            warn!(error = %err, "worker task panicked during shutdown");
        }
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn Store>, CoreError> {
    match &config.store_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => Ok(Arc::new(store)),
            Err(err) if config.store_enable_fallback => {
                warn!(error = %err, "store unreachable at startup, falling back to the in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
            Err(err) => Err(err),
        },
        None => {
            info!("no STORE_URL configured, using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wires_up_over_the_in_memory_store_when_unconfigured() {
        let config = Config::for_tests();
        let app = AppContext::new(config).await.unwrap();
        assert_eq!(app.store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn health_reports_degraded_on_the_in_memory_store() {
        let config = Config::for_tests();
        let app = AppContext::new(config).await.unwrap();
        let summary = app.health().await.unwrap();
        assert_eq!(summary.status, "degraded");
        assert_eq!(summary.store.backend, "memory");
    }

    #[tokio::test]
    async fn background_tasks_can_be_started_and_shut_down() {
        let config = Config::for_tests();
        let app = AppContext::new(config).await.unwrap();
        let background = app.spawn_background_tasks();
        tokio::time::sleep(Duration::from_millis(20)).await;
        background.shutdown().await;
    }

    #[tokio::test]
    async fn lifecycle_roundtrip_through_the_app_context() {
        let config = Config::for_tests();
        let app = AppContext::new(config).await.unwrap();
        let instances = app.list_instances().await.unwrap();
        assert!(instances.is_empty());

        let summary = app.trigger_migration().await.unwrap();
        assert_eq!(summary.total_processed, 0);

        app.trigger_auto_stop(true).await.unwrap();
    }
}
