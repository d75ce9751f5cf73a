//! Job store boundary: the atomic claim and the post-publish status write.
//!
//! The claim is the single source of mutual exclusion for job ownership. Any
//! number of dispatch runs may call [`JobStore::claim`] concurrently; each due
//! row is handed to exactly one of them and flipped to `processing` in the same
//! transaction.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use herald_core::{Job, JobId, JobStatus};

/// Batch size used when the caller passes a zero limit.
pub const DEFAULT_CLAIM_LIMIT: usize = 50;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },
    #[error("{operation} exceeded deadline of {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("failed to decode job row: {0}")]
    Decode(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Partial update applied when a job reaches a terminal state.
///
/// Only the fields that are `Some` are written; `updated_at` is always bumped.
/// The metadata patch is merged key-by-key into the existing metadata object.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub id: JobId,
    pub status: JobStatus,
    pub external_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata_patch: Option<serde_json::Value>,
}

impl StatusUpdate {
    /// Transition into `published`. `external_id` is whatever the publisher
    /// reported, if anything.
    pub fn published(id: JobId, external_id: Option<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Published,
            external_id,
            published_at: Some(published_at),
            metadata_patch: None,
        }
    }

    /// Transition into `failed`, recording the reason under `metadata.error`.
    pub fn failed(id: JobId, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: JobStatus::Failed,
            external_id: None,
            published_at: None,
            metadata_patch: Some(json!({ "error": reason.into() })),
        }
    }
}

/// Persistence for scheduled posts as seen by the dispatch loop.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim due jobs: `status = scheduled` and `scheduled_at` in
    /// `[now, now + window)`, oldest first, at most `limit` (0 means
    /// [`DEFAULT_CLAIM_LIMIT`]). Rows already locked by a concurrent claimer
    /// are skipped, never waited on. Returned jobs are already `processing`.
    async fn claim(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Write a terminal status. Callers invoke this at most once per job.
    async fn update_status(&self, update: &StatusUpdate) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn claim(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).claim(now, window, limit).await
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        (**self).update_status(update).await
    }
}

/// Validate claim arguments and compute the half-open window `[start, end)`.
pub(crate) fn claim_bounds(
    now: DateTime<Utc>,
    window: Duration,
    limit: usize,
) -> Result<(DateTime<Utc>, DateTime<Utc>, usize), StoreError> {
    if window.is_zero() {
        return Err(StoreError::InvalidArgument(
            "claim window must be > 0".to_string(),
        ));
    }
    let span = chrono::Duration::from_std(window)
        .map_err(|e| StoreError::InvalidArgument(format!("claim window out of range: {e}")))?;
    let end = now
        .checked_add_signed(span)
        .ok_or_else(|| StoreError::InvalidArgument("claim window overflows".to_string()))?;
    let limit = if limit == 0 { DEFAULT_CLAIM_LIMIT } else { limit };
    Ok((now, end, limit))
}
