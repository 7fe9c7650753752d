// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The persistent, priority-ordered job queue.
//!
//! Jobs are persisted under the `jobs:` namespace (see the crate's
//! `SPEC_FULL.md` §6.5): `jobs:<jobId>` holds the record, `jobs:pending` and
//! `jobs:processing` are plain membership sets (priority order is derived
//! in-process from each record's own priority/`createdAt`, not from the
//! store), and `jobs:completed` is the one sorted set, scored by completion
//! time. Claims are made atomic with a short-lived `setIfAbsent` lock per
//! job, the store's only cross-key mutual-exclusion primitive.

use crate::error::CoreError;
use crate::store::{Store, StoreValue};
use crate::upstream::retry::backoff_delay;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const PENDING_SET: &str = "jobs:pending";
const PROCESSING_SET: &str = "jobs:processing";
const COMPLETED_ZSET: &str = "jobs:completed";

/// Background job types this core schedules and executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Reserved for an asynchronous-creation variant; not enqueued by the
    /// current synchronous creation path.
    CreateInstance,
    /// Poll upstream after creation until `running` or deadline.
    MonitorInstance,
    /// Poll upstream after a start-from-exited/stopped intent.
    MonitorStartup,
    /// Deliver one signed outbound webhook notification.
    SendWebhook,
    /// Run one migration sweep.
    MigrateSpotInstances,
    /// Evaluate auto-stop over running instances.
    AutoStop,
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed (or waiting for `nextRunAt`).
    Pending,
    /// Owned by exactly one worker for the duration of its handler.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted `maxAttempts`; never retried.
    Failed,
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Minted job id.
    pub job_id: String,
    /// Job type.
    pub job_type: JobType,
    /// Type-specific payload.
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    /// Current status.
    pub status: JobStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Attempts allowed before `failed` is terminal.
    pub max_attempts: u32,
    /// Earliest time this job may be claimed.
    pub next_run_at: DateTime<Utc>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the job was last claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed (success or terminal failure).
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Optional dedupe key; see [`JobQueue::enqueue`].
    pub dedupe_key: Option<String>,
}

fn job_key(job_id: &str) -> String {
    format!("jobs:{job_id}")
}

fn claim_lock_key(job_id: &str) -> String {
    format!("jobs:claim-lock:{job_id}")
}

fn dedupe_index_key(dedupe_key: &str) -> String {
    format!("jobs:dedupe:{dedupe_key}")
}

/// Priority-ordered sort key: higher priority sorts first, ties broken by
/// earlier `createdAt`. Computed in-process over `jobs:pending`'s
/// unordered membership set rather than stored as a score.
fn pending_score(priority: i32, created_at: DateTime<Utc>) -> f64 {
    -(priority as f64) * 1e13 + created_at.timestamp_millis() as f64
}

/// Job queue statistics, surfaced in the health summary.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: u64,
    /// Jobs currently owned by a worker.
    pub processing: u64,
    /// Jobs that completed successfully.
    pub completed: u64,
}

/// The persistent job queue.
pub struct JobQueue {
    store: Arc<dyn Store>,
    accepting_claims: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
    base_backoff: Duration,
}

impl JobQueue {
    /// Construct a queue over the shared store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            accepting_claims: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            base_backoff: Duration::from_secs(1),
        }
    }

    fn mint_job_id(now: DateTime<Utc>) -> String {
        use rand::Rng;
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..6)
                .map(|_| std::char::from_digit(rng.gen_range(0..36), 36).unwrap())
                .collect()
        };
        format!("job-{}-{}", now.timestamp_millis(), suffix)
    }

    async fn find_by_dedupe_key(&self, dedupe_key: &str) -> Result<Option<String>, CoreError> {
        let Some(value) = self.store.get(&dedupe_index_key(dedupe_key)).await? else {
            return Ok(None);
        };
        let job_id: String = value.into_json()?;
        // The indexed job may since have completed; a completed job does
        // not block a fresh enqueue under the same key.
        if let Some(record) = self.get(&job_id).await? {
            if record.status != JobStatus::Completed {
                return Ok(Some(job_id));
            }
        }
        Ok(None)
    }

    /// Enqueue a job. If `dedupe_key` is supplied and a non-completed job
    /// with the same key exists, returns that job's id instead of creating
    /// a new one.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        priority: i32,
        max_attempts: u32,
        dedupe_key: Option<String>,
    ) -> Result<String, CoreError> {
        if let Some(key) = &dedupe_key {
            if let Some(existing) = self.find_by_dedupe_key(key).await? {
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let job_id = Self::mint_job_id(now);
        let record = JobRecord {
            job_id: job_id.clone(),
            job_type,
            payload,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_run_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            dedupe_key: dedupe_key.clone(),
        };
        self.store
            .set(&job_key(&job_id), StoreValue::json(&record)?, None)
            .await?;
        self.store.set_add(PENDING_SET, &job_id).await?;
        if let Some(key) = dedupe_key {
            self.store
                .set(&dedupe_index_key(&key), StoreValue::json(&job_id)?, None)
                .await?;
        }
        Ok(job_id)
    }

    /// Fetch a job record by id.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, CoreError> {
        match self.store.get(&job_key(job_id)).await? {
            Some(value) => Ok(Some(value.into_json()?)),
            None => Ok(None),
        }
    }

    /// Atomically claim the highest-priority pending job whose `nextRunAt`
    /// has arrived. Returns `None` if nothing is claimable, or once
    /// shutdown has begun.
    pub async fn claim(&self) -> Result<Option<JobRecord>, CoreError> {
        if !self.accepting_claims.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let candidates = self.store.set_members(PENDING_SET).await?;
        let now = Utc::now();

        let mut ready = Vec::new();
        for job_id in candidates {
            let Some(record) = self.get(&job_id).await? else {
                continue;
            };
            if record.status != JobStatus::Pending || record.next_run_at > now {
                continue;
            }
            ready.push(record);
        }
        ready.sort_by(|a, b| {
            pending_score(a.priority, a.created_at).total_cmp(&pending_score(b.priority, b.created_at))
        });

        for mut record in ready {
            let acquired = self
                .store
                .set_if_absent(
                    &claim_lock_key(&record.job_id),
                    StoreValue::Bytes(vec![]),
                    Duration::from_secs(600),
                )
                .await?;
            if !acquired {
                continue;
            }
            record.status = JobStatus::Processing;
            record.started_at = Some(now);
            self.store
                .set(&job_key(&record.job_id), StoreValue::json(&record)?, None)
                .await?;
            self.store.set_remove(PENDING_SET, &record.job_id).await?;
            self.store.set_add(PROCESSING_SET, &record.job_id).await?;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(record));
        }
        Ok(None)
    }

    fn finish_in_flight(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Put a claimed job back to `pending` without counting it as a failed
    /// attempt, to run again no sooner than `delay` from now. Used by
    /// handlers that tick a long-running poll (e.g. `MONITOR_INSTANCE`)
    /// rather than finishing in one shot.
    pub async fn reschedule(&self, job_id: &str, delay: Duration) -> Result<(), CoreError> {
        let mut record = self.get(job_id).await?.ok_or_else(|| CoreError::NotFound {
            kind: "job".to_string(),
            id: job_id.to_string(),
        })?;
        record.status = JobStatus::Pending;
        record.next_run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store
            .set(&job_key(job_id), StoreValue::json(&record)?, None)
            .await?;
        self.store.set_remove(PROCESSING_SET, job_id).await?;
        self.store.set_add(PENDING_SET, job_id).await?;
        self.store.del(&claim_lock_key(job_id)).await?;
        self.finish_in_flight();
        Ok(())
    }

    /// Mark a job completed successfully.
    pub async fn complete(&self, job_id: &str) -> Result<(), CoreError> {
        let mut record = self.get(job_id).await?.ok_or_else(|| CoreError::NotFound {
            kind: "job".to_string(),
            id: job_id.to_string(),
        })?;
        let now = Utc::now();
        record.status = JobStatus::Completed;
        record.completed_at = Some(now);
        self.store
            .set(&job_key(job_id), StoreValue::json(&record)?, None)
            .await?;
        self.store.zadd(COMPLETED_ZSET, job_id, now.timestamp_millis() as f64).await?;
        self.store.set_remove(PROCESSING_SET, job_id).await?;
        self.store.del(&claim_lock_key(job_id)).await?;
        self.finish_in_flight();
        Ok(())
    }

    /// Record a failed attempt. If attempts remain, reschedules with
    /// exponential backoff and jitter; otherwise marks the job terminally
    /// failed.
    pub async fn fail(&self, job_id: &str, err: &CoreError) -> Result<(), CoreError> {
        let mut record = self.get(job_id).await?.ok_or_else(|| CoreError::NotFound {
            kind: "job".to_string(),
            id: job_id.to_string(),
        })?;
        record.attempts += 1;
        record.last_error = Some(err.to_string());
        let now = Utc::now();

        if record.attempts < record.max_attempts {
            record.status = JobStatus::Pending;
            record.next_run_at = now + backoff_delay(self.base_backoff, record.attempts);
            self.store
                .set(&job_key(job_id), StoreValue::json(&record)?, None)
                .await?;
            self.store.set_add(PENDING_SET, job_id).await?;
        } else {
            record.status = JobStatus::Failed;
            record.completed_at = Some(now);
            self.store
                .set(&job_key(job_id), StoreValue::json(&record)?, None)
                .await?;
        }
        self.store.set_remove(PROCESSING_SET, job_id).await?;
        self.store.del(&claim_lock_key(job_id)).await?;
        self.finish_in_flight();
        Ok(())
    }

    /// Current queue statistics.
    ///
    /// `jobs:completed` is append-only (nothing ever leaves a completed-jobs
    /// index), so its `zcard` would overcount once jobs start completing in
    /// bulk. Counts come from the job records themselves via a full scan
    /// instead, matching the source of truth `claim`/`complete`/`fail` also
    /// write to.
    pub async fn stats(&self) -> Result<QueueStats, CoreError> {
        let mut stats = QueueStats {
            pending: 0,
            processing: 0,
            completed: 0,
        };
        for key in self.store.scan("jobs:job-").await? {
            let Some(value) = self.store.get(&key).await? else {
                continue;
            };
            let record: JobRecord = match value.into_json() {
                Ok(record) => record,
                Err(_) => continue,
            };
            match record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {}
            }
        }
        Ok(stats)
    }

    /// Stop accepting new claims, then wait up to `timeout` for in-flight
    /// jobs to finish. Jobs that don't finish in time remain `processing`
    /// and are reclaimable by the next process (handlers must be
    /// idempotent).
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting_claims.store(false, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.drained.notified()).await;
    }
}
