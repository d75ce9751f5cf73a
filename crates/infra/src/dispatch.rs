//! Dispatch loop: claim a batch of due jobs and drive each one to a terminal
//! status.
//!
//! Per job, in order:
//! 1. resolve the publisher (unresolved → `failed`, no retry)
//! 2. take the dedupe lease if a guard is configured (held elsewhere → skip)
//! 3. wait for a rate-limit token
//! 4. publish through the retry engine, each attempt under a deadline
//! 5. write `published` or `failed`
//! 6. release the lease, only if this run took it
//!
//! Only the claim can fail a run. Everything after it is recovered per job, so
//! one bad job never stops the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{Span, error, info, instrument, warn};

use herald_core::{Job, JobId};
use herald_observability::{MetricsSink, NoopMetrics, Outcome};

use crate::dedupe::DedupeGuard;
use crate::publisher::{PublisherEntry, PublisherRegistry};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryEngine;
use crate::store::{JobStore, StatusUpdate, StoreError};

/// Dispatch loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How far ahead of now a job counts as due.
    pub window: Duration,
    pub batch_limit: usize,
    /// Deadline for the claim transaction.
    pub claim_timeout: Duration,
    /// Deadline for a single publish attempt.
    pub publish_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            batch_limit: 50,
            claim_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(30),
        }
    }
}

/// Counts for one [`Dispatcher::run_once`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Leased by another process; left untouched this round.
    pub skipped: usize,
    /// Outcome known but the status write failed.
    pub unfinalized: usize,
}

impl DispatchSummary {
    /// Jobs that reached an outcome this run.
    pub fn processed(&self) -> usize {
        self.published + self.failed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `leased` is true only when this process took the dedupe lease for the job.
enum JobOutcome {
    Published {
        external_id: Option<String>,
        leased: bool,
    },
    Failed {
        reason: String,
        leased: bool,
    },
    Skipped,
}

pub struct Dispatcher<S: JobStore> {
    store: S,
    registry: Arc<PublisherRegistry>,
    limiter: Arc<RateLimiter>,
    retry: RetryEngine,
    dedupe: Option<Arc<dyn DedupeGuard>>,
    metrics: Arc<dyn MetricsSink>,
    config: DispatchConfig,
}

impl<S: JobStore> Dispatcher<S> {
    pub fn new(store: S, registry: PublisherRegistry, limiter: Arc<RateLimiter>) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            limiter,
            retry: RetryEngine::default(),
            dedupe: None,
            metrics: Arc::new(NoopMetrics),
            config: DispatchConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dedupe(mut self, dedupe: Arc<dyn DedupeGuard>) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn with_retry(mut self, retry: RetryEngine) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// [`Dispatcher::run_once`] with the configured window and batch limit.
    pub async fn run(&self) -> Result<DispatchSummary, DispatchError> {
        self.run_once(self.config.window, self.config.batch_limit).await
    }

    /// Claim up to `batch_limit` jobs due within `window` and process them
    /// sequentially. Fails only when the claim itself fails.
    #[instrument(
        skip(self),
        fields(window_secs = window.as_secs(), claimed, published, failed),
        err
    )]
    pub async fn run_once(
        &self,
        window: Duration,
        batch_limit: usize,
    ) -> Result<DispatchSummary, DispatchError> {
        let timeout = self.config.claim_timeout;
        let jobs = tokio::time::timeout(timeout, self.store.claim(Utc::now(), window, batch_limit))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "claim",
                timeout,
            })??;

        let mut summary = DispatchSummary {
            claimed: jobs.len(),
            ..Default::default()
        };

        for job in &jobs {
            match self.process(job).await {
                JobOutcome::Skipped => summary.skipped += 1,
                JobOutcome::Published {
                    external_id,
                    leased,
                } => {
                    summary.published += 1;
                    let update = StatusUpdate::published(job.id.clone(), external_id, Utc::now());
                    if !self.finalize(&update).await {
                        summary.unfinalized += 1;
                    }
                    self.metrics
                        .record_outcome(job.destination.as_str(), Outcome::Published);
                    if leased {
                        self.release(&job.id).await;
                    }
                }
                JobOutcome::Failed { reason, leased } => {
                    summary.failed += 1;
                    let update = StatusUpdate::failed(job.id.clone(), reason);
                    if !self.finalize(&update).await {
                        summary.unfinalized += 1;
                    }
                    self.metrics
                        .record_outcome(job.destination.as_str(), Outcome::Failed);
                    if leased {
                        self.release(&job.id).await;
                    }
                }
            }
        }

        let span = Span::current();
        span.record("claimed", summary.claimed);
        span.record("published", summary.published);
        span.record("failed", summary.failed);
        Ok(summary)
    }

    async fn process(&self, job: &Job) -> JobOutcome {
        let Some(entry) = self.registry.resolve(&job.destination) else {
            let reason = format!("unsupported platform: {}", job.destination);
            warn!(job_id = %job.id, destination = %job.destination, "{reason}");
            return JobOutcome::Failed {
                reason,
                leased: false,
            };
        };

        let mut leased = false;
        if let Some(dedupe) = &self.dedupe {
            match dedupe.acquire(&job.id).await {
                Ok(true) => leased = true,
                Ok(false) => {
                    info!(job_id = %job.id, destination = %job.destination, "lease held elsewhere, skipping");
                    return JobOutcome::Skipped;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "dedupe check failed, continuing without lease");
                }
            }
        }

        self.limiter.take(&job.destination).await;

        let mut attempts = 0u32;
        let result = self
            .retry
            .run(|| {
                attempts += 1;
                self.attempt(entry.clone(), job.clone())
            })
            .await;

        match result {
            Ok(external_id) => {
                info!(
                    job_id = %job.id,
                    destination = %job.destination,
                    attempts,
                    external_id = external_id.as_deref().unwrap_or(""),
                    "published"
                );
                JobOutcome::Published {
                    external_id,
                    leased,
                }
            }
            Err(e) => {
                let reason = format!("{e:#}");
                warn!(
                    job_id = %job.id,
                    destination = %job.destination,
                    attempts,
                    error = %reason,
                    "publish failed"
                );
                JobOutcome::Failed { reason, leased }
            }
        }
    }

    /// One publish attempt on its own task, so a panicking adapter only
    /// fails its own job.
    async fn attempt(&self, entry: PublisherEntry, job: Job) -> anyhow::Result<Option<String>> {
        let timeout = self.config.publish_timeout;
        let destination = job.destination.clone();
        let started = Instant::now();

        let handle =
            tokio::spawn(async move { tokio::time::timeout(timeout, entry.invoke(&job)).await });
        let joined = handle.await;

        self.metrics
            .observe_publish(destination.as_str(), started.elapsed());

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow!("publish timeout after {timeout:?}")),
            Err(e) if e.is_panic() => Err(anyhow!("publisher panicked")),
            Err(e) => Err(anyhow!("publish task aborted: {e}")),
        }
    }

    /// Write a terminal status. Returns false when the write failed.
    async fn finalize(&self, update: &StatusUpdate) -> bool {
        match self.store.update_status(update).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    job_id = %update.id,
                    status = %update.status,
                    error = %e,
                    "failed to record job status"
                );
                false
            }
        }
    }

    async fn release(&self, id: &JobId) {
        let Some(dedupe) = &self.dedupe else {
            return;
        };
        if let Err(e) = dedupe.release(id).await {
            warn!(job_id = %id, error = %e, "failed to release lease");
        }
    }
}
