// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spot-instance migration sweep (spec §4.7): time-based eligibility,
//! upstream-driven migration, recreate-on-failure, dry-run support.
//!
//! Eligibility is purely time-based per the crate's Open Question
//! resolution: a `migration-times:<upstreamId>` key with a 7-day TTL tracks
//! the last attempt, and its absence means the instance is eligible. No
//! spot-reclaim-time heuristics are consulted.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::CoreError;
use crate::instance::{InstanceStatus, Source};
use crate::store::{Store, StoreValue};
use crate::upstream::{CreateInstancePayload, UpstreamAdapter};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ELIGIBILITY_KEY_PREFIX: &str = "migration-times:";
const ELIGIBILITY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Summary of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    /// Candidates considered.
    pub total_processed: u64,
    /// Instances successfully migrated (or that would have been, in dry
    /// run).
    pub migrated: u64,
    /// Candidates skipped: not eligible, or not in a migratable status.
    pub skipped: u64,
    /// Migrations that failed outright.
    pub errors: u64,
    /// Wall-clock time the sweep took, in milliseconds.
    pub execution_time_ms: u64,
}

/// Runs one migration sweep over all locally-known ready instances.
pub struct MigrationEngine {
    store: Arc<dyn Store>,
    cache: Arc<Cache>,
    upstream: Arc<dyn UpstreamAdapter>,
    config: Arc<Config>,
}

impl MigrationEngine {
    /// Construct an engine over the shared collaborators.
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<Cache>,
        upstream: Arc<dyn UpstreamAdapter>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            upstream,
            config,
        }
    }

    /// Run a single sweep, bounded to `config.migration_max_concurrent`
    /// simultaneous migrations. Honors `config.migration_dry_run`.
    #[tracing::instrument(skip(self))]
    pub async fn run_sweep(&self) -> Result<MigrationSummary, CoreError> {
        let started = std::time::Instant::now();
        let mut summary = MigrationSummary::default();

        let candidates: Vec<_> = self
            .cache
            .list_instances()
            .await?
            .into_iter()
            .filter(|record| record.status == InstanceStatus::Exited && record.upstream_id.is_some())
            .collect();

        for chunk in candidates.chunks(self.config.migration_max_concurrent.max(1)) {
            let futures = chunk.iter().map(|record| self.process_one(record));
            let results = futures_util::future::join_all(futures).await;
            for outcome in results {
                summary.total_processed += 1;
                match outcome {
                    Ok(true) => summary.migrated += 1,
                    Ok(false) => summary.skipped += 1,
                    Err(err) => {
                        warn!(error = %err, "migration attempt failed");
                        summary.errors += 1;
                    }
                }
            }
        }

        summary.execution_time_ms = started.elapsed().as_millis() as u64;
        info!(
            total = summary.total_processed,
            migrated = summary.migrated,
            skipped = summary.skipped,
            errors = summary.errors,
            "migration sweep complete"
        );
        Ok(summary)
    }

    /// Returns `Ok(true)` if migrated, `Ok(false)` if skipped as
    /// ineligible.
    async fn process_one(&self, record: &crate::instance::InstanceRecord) -> Result<bool, CoreError> {
        let upstream_id = record.upstream_id.as_ref().expect("filtered above");
        if !self.is_eligible(upstream_id).await? {
            return Ok(false);
        }

        if self.config.migration_dry_run {
            info!(instance_id = %record.instance_id, upstream_id, "dry run: would migrate");
            return Ok(true);
        }

        let outcome = self.upstream.migrate_instance(upstream_id).await?;
        if outcome.success {
            self.mark_attempted(upstream_id).await?;
            let mut updated = record.clone();
            if let Some(new_id) = outcome.new_upstream_id {
                updated.upstream_id = Some(new_id);
            }
            updated.timestamps.last_migration = Some(chrono::Utc::now());
            updated.source = Source::Local;
            self.cache.put_instance(&updated).await?;
            return Ok(true);
        }

        warn!(
            instance_id = %record.instance_id,
            upstream_id,
            reason = ?outcome.error,
            "migration failed in place, attempting recreate"
        );
        self.recreate(record).await?;
        Ok(true)
    }

    async fn recreate(&self, record: &crate::instance::InstanceRecord) -> Result<(), CoreError> {
        let (product, template) = match (&record.product, &record.template) {
            (Some(product), Some(template)) => (product, template),
            _ => {
                return Err(CoreError::Validation {
                    field: "product/template".to_string(),
                    message: "missing product or template snapshot, cannot recreate".to_string(),
                });
            }
        };

        let image_auth_id = match &template.registry_auth_id {
            Some(id) => {
                self.upstream.get_registry_auth(id).await?;
                Some(id.clone())
            }
            None => None,
        };

        let created = self
            .upstream
            .create_instance(CreateInstancePayload {
                product_id: product.id.clone(),
                template_id: template.id.clone(),
                region: product.region.clone(),
                image_url: template.image_url.clone(),
                image_auth_id,
                gpu_num: record.config.gpu_num,
                rootfs_size: record.config.rootfs_size,
                billing_mode: record.config.billing_mode,
                port_mappings: template.ports.clone(),
                envs: template.environment.clone(),
            })
            .await?;

        let mut updated = record.clone();
        updated.name = format!("{}-recreated-{}", record.name, chrono::Utc::now().timestamp_millis());
        updated.upstream_id = Some(created.upstream_id);
        updated.status = InstanceStatus::Starting;
        updated.timestamps.last_migration = Some(chrono::Utc::now());
        self.cache.put_instance(&updated).await?;
        Ok(())
    }

    async fn is_eligible(&self, upstream_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.get(&eligibility_key(upstream_id)).await?.is_none())
    }

    async fn mark_attempted(&self, upstream_id: &str) -> Result<(), CoreError> {
        self.store
            .set(
                &eligibility_key(upstream_id),
                StoreValue::Bytes(b"1".to_vec()),
                Some(ELIGIBILITY_TTL),
            )
            .await
    }
}

fn eligibility_key(upstream_id: &str) -> String {
    format!("{ELIGIBILITY_KEY_PREFIX}{upstream_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use crate::upstream::circuit_breaker::CircuitState;
    use crate::upstream::{CreateInstancePayload as Payload, MigrationOutcome, UpstreamInstance};
    use async_trait::async_trait;

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

    struct StubUpstream {
        migrate_result: MigrationOutcome,
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
        async fn create_instance(&self, payload: Payload) -> Result<UpstreamInstance, CoreError> {
            Ok(UpstreamInstance {
                upstream_id: format!("recreated-{}", payload.product_id),
                status: "starting".to_string(),
                region: payload.region,
                port_mappings: vec![],
            })
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
            Ok(self.migrate_result.clone())
        }
        fn circuit_state(&self) -> CircuitState {
            CircuitState::Closed
        }
    }

    fn test_config(dry_run: bool) -> Arc<Config> {
        let mut config = Config::for_tests();
        config.migration_dry_run = dry_run;
        config.migration_max_concurrent = 2;
        Arc::new(config)
    }

    #[tokio::test]
    async fn eligible_instance_is_migrated_and_marked() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let upstream = Arc::new(StubUpstream {
            migrate_result: MigrationOutcome {
                success: true,
                new_upstream_id: None,
                error: None,
            },
        });
        let mut record = crate::instance::InstanceRecord::new(
            "test".to_string(),
            sample_instance_config(),
            chrono::Utc::now(),
        );
        record.upstream_id = Some("up-1".to_string());
        record.status = InstanceStatus::Exited;
        cache.put_instance(&record).await.unwrap();

        let engine = MigrationEngine::new(store.clone(), cache.clone(), upstream, test_config(false));
        let summary = engine.run_sweep().await.unwrap();
        assert_eq!(summary.migrated, 1);
        assert!(store.get(&eligibility_key("up-1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ineligible_instance_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        store
            .set(&eligibility_key("up-2"), StoreValue::Bytes(b"1".to_vec()), None)
            .await
            .unwrap();
        let upstream = Arc::new(StubUpstream {
            migrate_result: MigrationOutcome {
                success: true,
                new_upstream_id: None,
                error: None,
            },
        });
        let mut record = crate::instance::InstanceRecord::new(
            "test".to_string(),
            sample_instance_config(),
            chrono::Utc::now(),
        );
        record.upstream_id = Some("up-2".to_string());
        record.status = InstanceStatus::Exited;
        cache.put_instance(&record).await.unwrap();

        let engine = MigrationEngine::new(store, cache, upstream, test_config(false));
        let summary = engine.run_sweep().await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.migrated, 0);
    }

    #[tokio::test]
    async fn dry_run_does_not_call_upstream_migrate_or_mark_attempted() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let upstream = Arc::new(StubUpstream {
            migrate_result: MigrationOutcome {
                success: false,
                new_upstream_id: None,
                error: Some("should never be reached".to_string()),
            },
        });
        let mut record = crate::instance::InstanceRecord::new(
            "test".to_string(),
            sample_instance_config(),
            chrono::Utc::now(),
        );
        record.upstream_id = Some("up-3".to_string());
        record.status = InstanceStatus::Exited;
        cache.put_instance(&record).await.unwrap();

        let engine = MigrationEngine::new(store.clone(), cache, upstream, test_config(true));
        let summary = engine.run_sweep().await.unwrap();
        assert_eq!(summary.migrated, 1);
        assert!(store.get(&eligibility_key("up-3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_migration_falls_through_to_recreate_and_does_not_mark_attempted() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(Cache::new(store.clone()));
        let upstream = Arc::new(StubUpstream {
            migrate_result: MigrationOutcome {
                success: false,
                new_upstream_id: None,
                error: Some("reclaimed before migration completed".to_string()),
            },
        });
        let mut record = crate::instance::InstanceRecord::new(
            "gpu-box".to_string(),
            sample_instance_config(),
            chrono::Utc::now(),
        );
        record.upstream_id = Some("up-4".to_string());
        record.status = InstanceStatus::Exited;
        record.product = Some(crate::cache::ProductSnapshot {
            id: "prod-1".to_string(),
            region: "CN-HK-01".to_string(),
            spot_price: 1.0,
            on_demand_price: 2.0,
        });
        record.template = Some(crate::cache::TemplateSnapshot {
            id: "tmpl-1".to_string(),
            image_url: "registry/image:latest".to_string(),
            ports: vec![],
            environment: vec![("KEY".to_string(), "VALUE".to_string())],
            registry_auth_id: None,
        });
        cache.put_instance(&record).await.unwrap();

        let engine = MigrationEngine::new(store.clone(), cache.clone(), upstream, test_config(false));
        let summary = engine.run_sweep().await.unwrap();
        assert_eq!(summary.migrated, 1);

        // A failed attempt must not consume the eligibility window: only a
        // successful migration calls `mark_attempted`.
        assert!(store.get(&eligibility_key("up-4")).await.unwrap().is_none());

        let recreated = cache
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.instance_id == record.instance_id)
            .unwrap();
        assert!(recreated.name.starts_with("gpu-box-recreated-"));
        assert_eq!(recreated.upstream_id, Some("recreated-prod-1".to_string()));
        assert_eq!(recreated.status, InstanceStatus::Starting);
    }
}
