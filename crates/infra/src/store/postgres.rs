//! Postgres-backed job store.
//!
//! ## Claim
//!
//! One statement selects due rows with `FOR UPDATE SKIP LOCKED`, flips them to
//! `processing` and returns them joined with their campaign/content display
//! fields. Concurrent claimers partition the due rows between them: a row
//! locked by one transaction is invisible to the others instead of blocking
//! them, and once committed it is no longer `scheduled`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError | Scenario |
//! |------------|------------|----------|
//! | Database | `Database` | SQL failure, constraint violation |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Database` | connectivity |
//! | ColumnDecode / Decode | `Decode` | unexpected column type |
//! | Other | `Database` | anything else |
//!
//! ## Thread Safety
//!
//! `PostgresJobStore` is `Send + Sync`; all operations go through the SQLx pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::{Span, instrument};

use herald_core::{Destination, Job, JobId, JobStatus};

use super::{JobStore, StatusUpdate, StoreError, claim_bounds};

/// Idempotent DDL for the tables the store reads and writes.
pub const SCHEMA: &str = include_str!("../../../../migrations/0001_scheduled_posts.sql");

const CLAIM_SQL: &str = r#"
WITH due AS (
    SELECT id
    FROM scheduled_posts
    WHERE status = 'scheduled'
      AND scheduled_at >= $1
      AND scheduled_at < $2
    ORDER BY scheduled_at ASC
    LIMIT $3
    FOR UPDATE SKIP LOCKED
),
claimed AS (
    UPDATE scheduled_posts sp
    SET status = 'processing', updated_at = NOW()
    FROM due
    WHERE sp.id = due.id
    RETURNING sp.*
)
SELECT
    claimed.id,
    claimed.campaign_id,
    c.name AS campaign_name,
    claimed.content_id,
    ci.title AS content_title,
    ci.canonical_url AS content_url,
    claimed.platform::text AS platform,
    claimed.caption,
    claimed.hashtags,
    claimed.scheduled_at,
    claimed.status::text AS status,
    claimed.external_id,
    claimed.published_at,
    claimed.metadata,
    claimed.created_at,
    claimed.updated_at
FROM claimed
LEFT JOIN campaigns c ON c.id = claimed.campaign_id
LEFT JOIN content_items ci ON ci.id = claimed.content_id
ORDER BY claimed.scheduled_at ASC, claimed.id ASC
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Safe to run on every start.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Withdraw a job that has not been claimed yet (`scheduled -> canceled`).
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn cancel(&self, id: &JobId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'canceled', updated_at = NOW()
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "job {id} is missing or no longer scheduled"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self),
        fields(window_secs = window.as_secs(), claimed),
        err
    )]
    async fn claim(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let (start, end, limit) = claim_bounds(now, window, limit)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(CLAIM_SQL)
            .bind(start)
            .bind(end)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job_row = JobRow::from_row(&row)
                .map_err(|e| StoreError::Decode(format!("failed to read claimed row: {e}")))?;
            jobs.push(Job::try_from(job_row)?);
        }

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(
        skip(self, update),
        fields(job_id = %update.id, status = %update.status),
        err
    )]
    async fn update_status(&self, update: &StatusUpdate) -> Result<(), StoreError> {
        let mut qb = build_status_update(update);
        let result = qb
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_status", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(update.id.clone()));
        }
        Ok(())
    }
}

/// Build the partial `UPDATE` for a status write: only non-empty fields are
/// set, `updated_at` always is.
fn build_status_update(update: &StatusUpdate) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE scheduled_posts SET status = ");
    qb.push_bind(update.status.as_str().to_string());

    if let Some(external_id) = &update.external_id {
        qb.push(", external_id = ");
        qb.push_bind(external_id.clone());
    }
    if let Some(published_at) = update.published_at {
        qb.push(", published_at = ");
        qb.push_bind(published_at);
    }
    if let Some(patch) = &update.metadata_patch {
        qb.push(", metadata = COALESCE(metadata, '{}'::jsonb) || ");
        qb.push_bind(patch.clone());
        qb.push("::jsonb");
    }

    qb.push(", updated_at = NOW() WHERE id = ");
    qb.push_bind(update.id.as_str().to_string());
    qb
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database {
            operation,
            message: match db_err.code() {
                Some(code) => format!("{} (sqlstate {code})", db_err.message()),
                None => db_err.message().to_string(),
            },
        },
        sqlx::Error::PoolClosed => StoreError::Database {
            operation,
            message: "connection pool closed".to_string(),
        },
        sqlx::Error::PoolTimedOut => StoreError::Database {
            operation,
            message: "timed out waiting for a pooled connection".to_string(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        other => StoreError::Database {
            operation,
            message: other.to_string(),
        },
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: String,
    campaign_id: String,
    campaign_name: Option<String>,
    content_id: Option<String>,
    content_title: Option<String>,
    content_url: Option<String>,
    platform: String,
    caption: Option<String>,
    hashtags: Option<String>,
    scheduled_at: DateTime<Utc>,
    status: String,
    external_id: Option<String>,
    published_at: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            campaign_name: row.try_get("campaign_name")?,
            content_id: row.try_get("content_id")?,
            content_title: row.try_get("content_title")?,
            content_url: row.try_get("content_url")?,
            platform: row.try_get("platform")?,
            caption: row.try_get("caption")?,
            hashtags: row.try_get("hashtags")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status: row.try_get("status")?,
            external_id: row.try_get("external_id")?,
            published_at: row.try_get("published_at")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| StoreError::Decode(format!("job {}: {e}", row.id)))?;

        Ok(Job {
            id: JobId::new(row.id),
            campaign_id: row.campaign_id,
            campaign_name: row.campaign_name,
            content_id: row.content_id,
            content_title: row.content_title,
            content_url: row.content_url,
            destination: Destination::new(row.platform),
            caption: row.caption,
            hashtags: row.hashtags,
            scheduled_at: row.scheduled_at,
            status,
            external_id: row.external_id,
            published_at: row.published_at,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: "p1".into(),
            campaign_id: "c1".into(),
            campaign_name: Some("Launch".into()),
            content_id: None,
            content_title: None,
            content_url: None,
            platform: "LinkedIn".into(),
            caption: None,
            hashtags: Some("#rust".into()),
            scheduled_at: now,
            status: status.into(),
            external_id: None,
            published_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row("processing")).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.destination.as_str(), "linkedin");
        assert_eq!(job.display_title(), "Launch");
    }

    #[test]
    fn unknown_status_is_a_decode_error() {
        assert!(matches!(
            Job::try_from(row("queued")),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn status_update_sql_only_sets_present_fields() {
        let failed = StatusUpdate::failed(JobId::new("p1"), "nope");
        let qb = build_status_update(&failed);
        assert_eq!(
            qb.sql(),
            "UPDATE scheduled_posts SET status = $1, metadata = COALESCE(metadata, '{}'::jsonb) || $2::jsonb, updated_at = NOW() WHERE id = $3"
        );

        let published =
            StatusUpdate::published(JobId::new("p1"), Some("urn:li:post:9".into()), Utc::now());
        let qb = build_status_update(&published);
        assert_eq!(
            qb.sql(),
            "UPDATE scheduled_posts SET status = $1, external_id = $2, published_at = $3, updated_at = NOW() WHERE id = $4"
        );

        let bare = StatusUpdate {
            metadata_patch: None,
            ..StatusUpdate::failed(JobId::new("p1"), "")
        };
        assert_eq!(
            build_status_update(&bare).sql(),
            "UPDATE scheduled_posts SET status = $1, updated_at = NOW() WHERE id = $2"
        );
    }

    #[test]
    fn schema_declares_all_statuses() {
        for status in JobStatus::ALL {
            assert!(SCHEMA.contains(&format!("'{}'", status.as_str())));
        }
        assert!(CLAIM_SQL.contains("FOR UPDATE SKIP LOCKED"));
    }
}
