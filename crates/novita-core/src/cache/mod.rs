// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespaced, TTL'd cache over [`crate::store::Store`] for instance
//! records, product snapshots, and template snapshots.
//!
//! Every value is written with a small type tag so that a `scan` over a
//! namespace can defend against foreign-typed keys sharing its prefix (the
//! WRONGTYPE defense described for the job queue's sorted sets): a value
//! whose tag doesn't match the accessor being used is skipped with a
//! warning rather than causing a deserialization panic.

use crate::error::CoreError;
use crate::instance::InstanceRecord;
use crate::store::{Store, StoreValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default TTL for cached product snapshots.
pub const PRODUCT_TTL: Duration = Duration::from_secs(300);
/// Default TTL for cached template snapshots.
pub const TEMPLATE_TTL: Duration = Duration::from_secs(1800);

const INSTANCE_PREFIX: &str = "cache:instance:";
const PRODUCT_PREFIX: &str = "cache:product:";
const TEMPLATE_PREFIX: &str = "cache:template:";

/// A resolved GPU product snapshot, cached by `(productName, region)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductSnapshot {
    /// Upstream product id.
    pub id: String,
    /// Region code this product was offered in.
    pub region: String,
    /// Spot price, in the provider's currency unit.
    pub spot_price: f64,
    /// On-demand price.
    pub on_demand_price: f64,
}

/// A resolved template snapshot, cached by `templateId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSnapshot {
    /// Template id.
    pub id: String,
    /// Container image reference.
    pub image_url: String,
    /// Declared ports.
    pub ports: Vec<TemplatePort>,
    /// Environment variables baked into the template.
    pub environment: Vec<(String, String)>,
    /// Optional registry-auth id, resolved just-in-time (not cached here).
    pub registry_auth_id: Option<String>,
}

/// One port declared by a template, used to drive health checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplatePort {
    /// Container port number.
    pub port: u16,
    /// Port protocol used for health checking.
    pub kind: PortKind,
    /// Path used for HTTP health checks (ignored for `tcp`).
    #[serde(default)]
    pub path: String,
}

/// Port protocol, used to select the health-check strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// HTTP GET health check.
    Http,
    /// Raw TCP connect health check.
    Tcp,
}

/// Type tag written alongside every cached value so a namespace scan can
/// tell a foreign-typed value apart from one of its own kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
enum CacheKind {
    Instance,
    Product,
    Template,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    kind: CacheKind,
    payload: T,
}

/// Namespaced cache over the shared [`Store`].
pub struct Cache {
    store: Arc<dyn Store>,
}

impl Cache {
    /// Wrap a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn instance_key(instance_id: &str) -> String {
        format!("{INSTANCE_PREFIX}{instance_id}")
    }

    fn product_key(product_name: &str, region: &str) -> String {
        format!("{PRODUCT_PREFIX}{product_name}:{region}")
    }

    fn template_key(template_id: &str) -> String {
        format!("{TEMPLATE_PREFIX}{template_id}")
    }

    /// Upsert an instance record. No TTL: instances are durable until
    /// explicitly removed by the sync job or a delete intent.
    pub async fn put_instance(&self, record: &InstanceRecord) -> Result<(), CoreError> {
        let envelope = Envelope {
            kind: CacheKind::Instance,
            payload: record.clone(),
        };
        self.store
            .set(
                &Self::instance_key(&record.instance_id),
                StoreValue::json(&envelope)?,
                None,
            )
            .await
    }

    /// Fetch an instance record by local id.
    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        self.get_typed(&Self::instance_key(instance_id), CacheKind::Instance)
            .await
    }

    /// Remove an instance record (used by the sync job's obsolete-removal
    /// policy and by explicit delete intents).
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), CoreError> {
        self.store.del(&Self::instance_key(instance_id)).await
    }

    /// List every currently-cached instance record, applying the WRONGTYPE
    /// defense: keys under the instance prefix whose envelope tag isn't
    /// `Instance` are skipped with a warning instead of erroring.
    pub async fn list_instances(&self) -> Result<Vec<InstanceRecord>, CoreError> {
        let keys = self.store.scan(INSTANCE_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if !key.starts_with(INSTANCE_PREFIX) {
                continue;
            }
            if let Some(record) = self.get_typed(&key, CacheKind::Instance).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Cache a product snapshot for `productName`/`region` with the default
    /// TTL.
    pub async fn put_product(
        &self,
        product_name: &str,
        region: &str,
        snapshot: &ProductSnapshot,
    ) -> Result<(), CoreError> {
        let envelope = Envelope {
            kind: CacheKind::Product,
            payload: snapshot.clone(),
        };
        self.store
            .set(
                &Self::product_key(product_name, region),
                StoreValue::json(&envelope)?,
                Some(PRODUCT_TTL),
            )
            .await
    }

    /// Fetch a cached product snapshot, if present and unexpired.
    pub async fn get_product(
        &self,
        product_name: &str,
        region: &str,
    ) -> Result<Option<ProductSnapshot>, CoreError> {
        self.get_typed(&Self::product_key(product_name, region), CacheKind::Product)
            .await
    }

    /// Cache a template snapshot with the default TTL.
    pub async fn put_template(
        &self,
        template_id: &str,
        snapshot: &TemplateSnapshot,
    ) -> Result<(), CoreError> {
        let envelope = Envelope {
            kind: CacheKind::Template,
            payload: snapshot.clone(),
        };
        self.store
            .set(
                &Self::template_key(template_id),
                StoreValue::json(&envelope)?,
                Some(TEMPLATE_TTL),
            )
            .await
    }

    /// Fetch a cached template snapshot, if present and unexpired.
    pub async fn get_template(
        &self,
        template_id: &str,
    ) -> Result<Option<TemplateSnapshot>, CoreError> {
        self.get_typed(&Self::template_key(template_id), CacheKind::Template)
            .await
    }

    async fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        expected: CacheKind,
    ) -> Result<Option<T>, CoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let envelope: Envelope<serde_json::Value> = match raw.into_json() {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(key, %err, "cache entry failed to decode, skipping");
                return Ok(None);
            }
        };
        if envelope.kind != expected {
            tracing::warn!(
                key,
                expected = ?expected,
                actual = ?envelope.kind,
                "WRONGTYPE defense: skipping cache entry with mismatched kind"
            );
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(envelope.payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sample_product() -> ProductSnapshot {
        ProductSnapshot {
            id: "prod-1".into(),
            region: "CN-HK-01".into(),
            spot_price: 0.5,
            on_demand_price: 1.2,
        }
    }

    #[tokio::test]
    async fn product_round_trips() {
        let cache = Cache::new(Arc::new(MemoryStore::new()));
        cache
            .put_product("RTX 4090 24GB", "CN-HK-01", &sample_product())
            .await
            .unwrap();
        let got = cache
            .get_product("RTX 4090 24GB", "CN-HK-01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, sample_product());
    }

    #[tokio::test]
    async fn wrongtype_key_under_instance_prefix_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let cache = Cache::new(store.clone());
        // Seed a foreign-tagged value directly under the instance prefix.
        let envelope = Envelope {
            kind: CacheKind::Product,
            payload: sample_product(),
        };
        store
            .set(
                "cache:instance:foreign",
                StoreValue::json(&envelope).unwrap(),
                None,
            )
            .await
            .unwrap();
        let records = cache.list_instances().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let cache = Cache::new(Arc::new(MemoryStore::new()));
        assert!(cache.get_template("tmpl-none").await.unwrap().is_none());
    }
}
