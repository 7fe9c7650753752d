// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic maintenance drivers: startup/periodic sync, migration sweep,
//! auto-stop (spec §4.6).
//!
//! Sync has no corresponding [`crate::queue::JobType`] — it's driven
//! in-process and guarded by a distributed `sync:lock` key so that only one
//! replica performs it at a time. Migration and auto-stop instead enqueue
//! jobs; the job queue's own dedupe keys (`migrate-sweep`,
//! `auto-stop-sweep`) give the single-flight guarantee across ticks — a new
//! job is only created once the previous one has left `pending`/`processing`.

use crate::config::Config;
use crate::error::CoreError;
use crate::health::SyncService;
use crate::queue::{JobQueue, JobType};
use crate::store::{Store, StoreValue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const SYNC_LOCK_KEY: &str = "sync:lock";
const SYNC_LOCK_TTL: Duration = Duration::from_secs(300);
const AUTO_STOP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Snapshot of when each driver last ran, surfaced in the health summary.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Last time this process completed a sync pass (whether or not it
    /// held the distributed lock).
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last time a migration sweep job was enqueued.
    pub last_migration_enqueued_at: Option<DateTime<Utc>>,
    /// Last time an auto-stop sweep job was enqueued.
    pub last_auto_stop_enqueued_at: Option<DateTime<Utc>>,
    /// Whether the tick loop (`run`) is currently active.
    pub is_running: bool,
    /// Whether the scheduler is configured to drive its periodicals. This
    /// scheduler has no single on/off switch — auto-stop always runs once
    /// `run` is started, independent of the per-driver `migration_enabled`/
    /// `sync_enable_automatic_sync` flags — so this is `true` whenever the
    /// tick loop is running.
    pub is_enabled: bool,
    /// The most recent of the three drivers' last-run timestamps.
    pub last_execution: Option<DateTime<Utc>>,
    /// Earliest upcoming tick among the enabled drivers, estimated from
    /// each driver's last run plus its interval.
    pub next_execution: Option<DateTime<Utc>>,
    /// Total driver ticks attempted since the scheduler was constructed.
    pub total_executions: u64,
    /// Of `total_executions`, how many ended in an error.
    pub failed_executions: u64,
    /// Wall-clock time since the scheduler was constructed.
    pub uptime: Duration,
    /// Job id of the most recently enqueued migration/auto-stop sweep.
    pub current_job_id: Option<String>,
}

impl SchedulerStatus {
    /// Per spec §4.6: unhealthy once at least half of all attempted
    /// executions have failed. `false` with zero executions so far.
    pub fn is_unhealthy(&self) -> bool {
        self.total_executions > 0 && self.failed_executions as f64 / self.total_executions as f64 >= 0.5
    }
}

/// Runs the three periodic drivers until shutdown.
pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<JobQueue>,
    sync: Arc<SyncService>,
    config: Arc<Config>,
    shutdown: Arc<Notify>,
    syncing: AtomicBool,
    running: AtomicBool,
    started_at: Instant,
    total_executions: AtomicU64,
    failed_executions: AtomicU64,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    last_migration_enqueued_at: Mutex<Option<DateTime<Utc>>>,
    last_auto_stop_enqueued_at: Mutex<Option<DateTime<Utc>>>,
    current_job_id: Mutex<Option<String>>,
}

impl Scheduler {
    /// Construct a scheduler over the shared collaborators.
    pub fn new(store: Arc<dyn Store>, queue: Arc<JobQueue>, sync: Arc<SyncService>, config: Arc<Config>) -> Self {
        Self {
            store,
            queue,
            sync,
            config,
            shutdown: Arc::new(Notify::new()),
            syncing: AtomicBool::new(false),
            running: AtomicBool::new(false),
            started_at: Instant::now(),
            total_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            last_sync_at: Mutex::new(None),
            last_migration_enqueued_at: Mutex::new(None),
            last_auto_stop_enqueued_at: Mutex::new(None),
            current_job_id: Mutex::new(None),
        }
    }

    /// A handle that can be used to request graceful shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Current status snapshot.
    pub fn status(&self) -> SchedulerStatus {
        let is_running = self.running.load(Ordering::SeqCst);
        let last_sync_at = *self.last_sync_at.lock().unwrap();
        let last_migration_enqueued_at = *self.last_migration_enqueued_at.lock().unwrap();
        let last_auto_stop_enqueued_at = *self.last_auto_stop_enqueued_at.lock().unwrap();

        let last_execution = [last_sync_at, last_migration_enqueued_at, last_auto_stop_enqueued_at]
            .into_iter()
            .flatten()
            .max();

        let mut next_candidates = Vec::new();
        if self.config.sync_enable_automatic_sync {
            let base = last_sync_at.unwrap_or_else(Utc::now);
            next_candidates.push(base + chrono_duration(self.config.sync_interval));
        }
        if self.config.migration_enabled {
            let base = last_migration_enqueued_at.unwrap_or_else(Utc::now);
            next_candidates.push(base + chrono_duration(self.config.migration_interval));
        }
        let base = last_auto_stop_enqueued_at.unwrap_or_else(Utc::now);
        next_candidates.push(base + chrono_duration(AUTO_STOP_INTERVAL));
        let next_execution = next_candidates.into_iter().min();

        SchedulerStatus {
            last_sync_at,
            last_migration_enqueued_at,
            last_auto_stop_enqueued_at,
            is_running,
            is_enabled: is_running,
            last_execution,
            next_execution,
            total_executions: self.total_executions.load(Ordering::SeqCst),
            failed_executions: self.failed_executions.load(Ordering::SeqCst),
            uptime: self.started_at.elapsed(),
            current_job_id: self.current_job_id.lock().unwrap().clone(),
        }
    }

    /// Run the startup sync once, then tick the three drivers until
    /// shutdown is signaled.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.run_sync_tick().await;

        let mut sync_ticker = tokio::time::interval(self.config.sync_interval.max(Duration::from_secs(1)));
        sync_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut migration_ticker = tokio::time::interval(self.config.migration_interval.max(Duration::from_secs(1)));
        migration_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut auto_stop_ticker = tokio::time::interval(AUTO_STOP_INTERVAL);
        auto_stop_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // The first tick of a freshly-built interval fires immediately;
        // we already ran sync above, so consume it without acting again.
        sync_ticker.tick().await;
        migration_ticker.tick().await;
        auto_stop_ticker.tick().await;

        info!("scheduler started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("scheduler received shutdown signal");
                    break;
                }

                _ = sync_ticker.tick() => {
                    if self.config.sync_enable_automatic_sync {
                        self.run_sync_tick().await;
                    }
                }

                _ = migration_ticker.tick() => {
                    if self.config.migration_enabled {
                        self.enqueue_migration_sweep().await;
                    }
                }

                _ = auto_stop_ticker.tick() => {
                    self.enqueue_auto_stop_sweep().await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("scheduler stopped");
    }

    async fn run_sync_tick(&self) {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("sync already in progress in this process, skipping tick");
            return;
        }

        let acquired = self
            .store
            .set_if_absent(SYNC_LOCK_KEY, StoreValue::Bytes(b"1".to_vec()), SYNC_LOCK_TTL)
            .await;
        match acquired {
            Ok(true) => {
                self.total_executions.fetch_add(1, Ordering::SeqCst);
                match self.sync.sync_with_upstream().await {
                    Ok(outcome) => info!(?outcome, "sync pass complete"),
                    Err(err) => {
                        self.failed_executions.fetch_add(1, Ordering::SeqCst);
                        warn!(error = %err, "sync pass failed");
                    }
                }
                let _ = self.store.del(SYNC_LOCK_KEY).await;
                *self.last_sync_at.lock().unwrap() = Some(Utc::now());
            }
            Ok(false) => {
                info!("another replica holds the sync lock, skipping");
            }
            Err(err) => {
                self.total_executions.fetch_add(1, Ordering::SeqCst);
                self.failed_executions.fetch_add(1, Ordering::SeqCst);
                warn!(error = %err, "failed to acquire sync lock");
            }
        }

        self.syncing.store(false, Ordering::SeqCst);
    }

    async fn enqueue_migration_sweep(&self) {
        self.total_executions.fetch_add(1, Ordering::SeqCst);
        match self
            .queue
            .enqueue(
                JobType::MigrateSpotInstances,
                serde_json::json!({}),
                1,
                self.config.max_retry_attempts,
                Some("migrate-sweep".to_string()),
            )
            .await
        {
            Ok(job_id) => {
                info!(job_id, "migration sweep enqueued");
                *self.last_migration_enqueued_at.lock().unwrap() = Some(Utc::now());
                *self.current_job_id.lock().unwrap() = Some(job_id);
            }
            Err(err) => {
                self.failed_executions.fetch_add(1, Ordering::SeqCst);
                warn!(error = %err, "failed to enqueue migration sweep");
            }
        }
    }

    async fn enqueue_auto_stop_sweep(&self) {
        self.total_executions.fetch_add(1, Ordering::SeqCst);
        match self
            .queue
            .enqueue(
                JobType::AutoStop,
                serde_json::json!({"dryRun": false}),
                1,
                self.config.max_retry_attempts,
                Some("auto-stop-sweep".to_string()),
            )
            .await
        {
            Ok(job_id) => {
                info!(job_id, "auto-stop sweep enqueued");
                *self.last_auto_stop_enqueued_at.lock().unwrap() = Some(Utc::now());
                *self.current_job_id.lock().unwrap() = Some(job_id);
            }
            Err(err) => {
                self.failed_executions.fetch_add(1, Ordering::SeqCst);
                warn!(error = %err, "failed to enqueue auto-stop sweep");
            }
        }
    }
}

/// Converts a `std::time::Duration` to a `chrono::Duration`, saturating
/// rather than panicking on the (practically unreachable) overflow case.
fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use crate::upstream::circuit_breaker::CircuitState;
    use crate::upstream::{CreateInstancePayload, MigrationOutcome, UpstreamInstance};
    use async_trait::async_trait;

    struct NoopUpstream;

    #[async_trait]
    impl crate::upstream::UpstreamAdapter for NoopUpstream {
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
        async fn create_instance(
            &self,
            _payload: CreateInstancePayload,
        ) -> Result<UpstreamInstance, CoreError> {
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
            _page: u32,
            _page_size: u32,
            _status: Option<&str>,
        ) -> Result<(Vec<UpstreamInstance>, u64), CoreError> {
            Ok((vec![], 0))
        }
        async fn migrate_instance(&self, _id: &str) -> Result<MigrationOutcome, CoreError> {
            unimplemented!()
        }
        fn circuit_state(&self) -> CircuitState {
            CircuitState::Closed
        }
    }

    fn build_scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let config = Arc::new(Config::for_tests());
        let queue = Arc::new(JobQueue::new(store.clone()));
        let sync = Arc::new(SyncService::new(cache, Arc::new(NoopUpstream), config.clone()));
        let scheduler = Scheduler::new(store.clone(), queue, sync, config);
        (store, scheduler)
    }

    #[tokio::test]
    async fn sync_tick_acquires_and_releases_the_lock() {
        let (store, scheduler) = build_scheduler();
        scheduler.run_sync_tick().await;
        assert!(store.get(SYNC_LOCK_KEY).await.unwrap().is_none());
        assert!(scheduler.status().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn sync_tick_is_skipped_when_lock_is_held() {
        let (store, scheduler) = build_scheduler();
        store
            .set_if_absent(SYNC_LOCK_KEY, StoreValue::Bytes(b"1".to_vec()), SYNC_LOCK_TTL)
            .await
            .unwrap();
        scheduler.run_sync_tick().await;
        assert!(scheduler.status().last_sync_at.is_none());
    }

    #[tokio::test]
    async fn migration_sweep_enqueue_is_deduped_across_ticks() {
        let (_, scheduler) = build_scheduler();
        scheduler.enqueue_migration_sweep().await;
        scheduler.enqueue_migration_sweep().await;
        let stats = scheduler.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }
}
