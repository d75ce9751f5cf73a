//! In-memory job store for tests/dev.
//!
//! The whole claim runs under one write lock, which gives the same
//! exactly-once hand-out as the row-locking claim in Postgres.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_core::{Job, JobId, JobStatus};

use super::{JobStore, StatusUpdate, StoreError, claim_bounds};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a planned job (what the upstream planner would do).
    pub fn insert(&self, job: Job) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job already exists: {}", job.id)));
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        Ok(id)
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.values().filter(|j| j.status == status).count()
    }

    /// Withdraw a job that has not been claimed yet.
    pub fn cancel(&self, id: &JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.status = job
            .status
            .transition_to(JobStatus::Canceled)
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn claim(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let (start, end, limit) = claim_bounds(now, window, limit)?;
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

        let mut due: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_due_within(start, end))
            .map(|j| (j.scheduled_at, j.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let claimed_at = Utc::now();
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.updated_at = claimed_at;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(&update.id)
            .ok_or_else(|| StoreError::NotFound(update.id.clone()))?;

        job.status = update.status;
        if let Some(external_id) = &update.external_id {
            job.external_id = Some(external_id.clone());
        }
        if let Some(published_at) = update.published_at {
            job.published_at = Some(published_at);
        }
        if let Some(patch) = &update.metadata_patch {
            job.metadata = Some(merge_metadata(job.metadata.take(), patch));
        }
        job.updated_at = Utc::now();
        Ok(())
    }
}

/// Shallow object merge, matching `COALESCE(metadata, '{}') || patch` in SQL.
fn merge_metadata(existing: Option<serde_json::Value>, patch: &serde_json::Value) -> serde_json::Value {
    match (existing, patch) {
        (Some(serde_json::Value::Object(mut base)), serde_json::Value::Object(extra)) => {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(base)
        }
        _ => patch.clone(),
    }
}
