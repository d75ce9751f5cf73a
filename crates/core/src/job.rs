//! Scheduled post rows and their lifecycle.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle state of a scheduled post.
///
/// ```text
/// scheduled ──claim──▶ processing ──▶ published | failed
///     │
///     └──(external actor)──▶ canceled
/// ```
///
/// `processing` rows left behind by a crashed worker stay there; the pipeline
/// never requeues them on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the planner, waiting for its window.
    Scheduled,
    /// Claimed by exactly one dispatch run.
    Processing,
    /// Delivered upstream.
    Published,
    /// Terminal failure recorded by the dispatch run.
    Failed,
    /// Withdrawn before it was claimed.
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Scheduled,
        JobStatus::Processing,
        JobStatus::Published,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Processing => "processing",
            JobStatus::Published => "published",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Published | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Scheduled, JobStatus::Processing)
                | (JobStatus::Scheduled, JobStatus::Canceled)
                | (JobStatus::Processing, JobStatus::Published)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    /// Validate a transition, returning the target state on success.
    pub fn transition_to(&self, next: JobStatus) -> DomainResult<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// A scheduled post as handed out by the claim step.
///
/// Besides the row itself it carries the denormalised display fields joined
/// from the campaign and content tables, so publishers never go back to the
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub campaign_id: String,
    pub campaign_name: Option<String>,
    pub content_id: Option<String>,
    pub content_title: Option<String>,
    /// Canonical link of the content item.
    pub content_url: Option<String>,
    pub destination: Destination,
    pub caption: Option<String>,
    pub hashtags: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    pub external_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a freshly planned job in `scheduled` state.
    pub fn scheduled(
        id: impl Into<JobId>,
        campaign_id: impl Into<String>,
        destination: impl Into<Destination>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            campaign_id: campaign_id.into(),
            campaign_name: None,
            content_id: None,
            content_title: None,
            content_url: None,
            destination: destination.into(),
            caption: None,
            hashtags: None,
            scheduled_at,
            status: JobStatus::Scheduled,
            external_id: None,
            published_at: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_content(
        mut self,
        title: impl Into<String>,
        url: Option<String>,
    ) -> Self {
        self.content_title = Some(title.into());
        self.content_url = url;
        self
    }

    pub fn with_campaign_name(mut self, name: impl Into<String>) -> Self {
        self.campaign_name = Some(name.into());
        self
    }

    pub fn with_hashtags(mut self, hashtags: impl Into<String>) -> Self {
        self.hashtags = Some(hashtags.into());
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    /// Title shown on the post: the content title, falling back to the
    /// campaign name. Blank values are skipped.
    pub fn display_title(&self) -> &str {
        [self.content_title.as_deref(), self.campaign_name.as_deref()]
            .into_iter()
            .flatten()
            .find(|v| !v.trim().is_empty())
            .unwrap_or("")
    }

    /// Whether the job is claimable within `[start, end)`.
    pub fn is_due_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.status == JobStatus::Scheduled && self.scheduled_at >= start && self.scheduled_at < end
    }
}
