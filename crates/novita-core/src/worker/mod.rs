// Copyright (C) 2026 Novita Labs
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The single long-lived worker loop that claims and executes jobs.
//!
//! Unlike a fixed pool of BRPOP workers, this core runs one claim loop
//! (spec §5: "single long-lived worker loop") since job volume here is
//! bounded by instance count, not event throughput. Each claimed job runs
//! under a [`JobHandler`] looked up by [`crate::queue::JobType`], bounded by
//! `job_timeout`.

pub mod handlers;

use crate::error::CoreError;
use crate::queue::{JobQueue, JobRecord, JobType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// What a handler accomplished for one invocation.
pub enum JobOutcome {
    /// The job is finished; mark it `completed`.
    Done,
    /// Not finished yet; run again no sooner than the given delay, without
    /// counting this as a failed attempt (used by long-running polls like
    /// `MONITOR_INSTANCE`).
    RescheduleAfter(Duration),
}

/// Executes one job type's payload.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the handler against one job. Errors are recorded against the
    /// job's attempt count via [`JobQueue::fail`].
    async fn handle(&self, job: &JobRecord) -> Result<JobOutcome, CoreError>;
}

/// Claims jobs from a [`JobQueue`] and dispatches them to registered
/// handlers.
pub struct JobWorker {
    queue: Arc<JobQueue>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    shutdown: Arc<Notify>,
    job_timeout: Duration,
    idle_poll_interval: Duration,
}

impl JobWorker {
    /// Construct a worker over the given queue. `job_timeout` bounds a
    /// single handler invocation (spec §5's `jobTimeoutMs`, default 10
    /// minutes); `idle_poll_interval` is how long to sleep after an empty
    /// claim before trying again.
    pub fn new(queue: Arc<JobQueue>, job_timeout: Duration, idle_poll_interval: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
            job_timeout,
            idle_poll_interval,
        }
    }

    /// Register a handler for a job type. Panics-free: registering the same
    /// type twice replaces the previous handler.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    /// A handle that can be used to request graceful shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signaled.
    pub async fn run(&self) {
        info!("job worker started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("job worker received shutdown signal");
                    break;
                }

                claimed = self.queue.claim() => {
                    match claimed {
                        Ok(Some(job)) => self.execute(job).await,
                        Ok(None) => tokio::time::sleep(self.idle_poll_interval).await,
                        Err(err) => {
                            error!(error = %err, "failed to claim a job");
                            tokio::time::sleep(self.idle_poll_interval).await;
                        }
                    }
                }
            }
        }
        info!("job worker stopped");
    }

    async fn execute(&self, job: JobRecord) {
        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            warn!(job_id = %job.job_id, job_type = ?job.job_type, "no handler registered; dropping job");
            let _ = self.queue.complete(&job.job_id).await;
            return;
        };

        let outcome = tokio::time::timeout(self.job_timeout, handler.handle(&job)).await;
        match outcome {
            Ok(Ok(JobOutcome::Done)) => {
                if let Err(err) = self.queue.complete(&job.job_id).await {
                    error!(job_id = %job.job_id, error = %err, "failed to mark job completed");
                }
            }
            Ok(Ok(JobOutcome::RescheduleAfter(delay))) => {
                if let Err(err) = self.queue.reschedule(&job.job_id, delay).await {
                    error!(job_id = %job.job_id, error = %err, "failed to reschedule job");
                }
            }
            Ok(Err(err)) => {
                warn!(job_id = %job.job_id, error = %err, "job handler failed");
                if let Err(fail_err) = self.queue.fail(&job.job_id, &err).await {
                    error!(job_id = %job.job_id, error = %fail_err, "failed to record job failure");
                }
            }
            Err(_) => {
                let timeout_err = CoreError::JobTimeout {
                    job_id: job.job_id.clone(),
                    timeout: self.job_timeout,
                };
                warn!(job_id = %job.job_id, "job handler exceeded its timeout budget");
                if let Err(fail_err) = self.queue.fail(&job.job_id, &timeout_err).await {
                    error!(job_id = %job.job_id, error = %fail_err, "failed to record job timeout");
                }
            }
        }
    }
}
