//! Publisher adapters and the destination registry.
//!
//! An adapter always implements [`Publisher`]; it may also implement
//! [`PublisherWithId`] to report the remote post id. The registry stores both
//! capabilities side by side in a [`PublisherEntry`], decided at registration
//! time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use herald_core::{Destination, Job};

/// Plain publish capability.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, job: &Job) -> anyhow::Result<()>;
}

/// Publish capability that also returns the remote id of the created post.
#[async_trait]
pub trait PublisherWithId: Send + Sync {
    async fn publish_with_id(&self, job: &Job) -> anyhow::Result<String>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, job: &Job) -> anyhow::Result<()> {
        (**self).publish(job).await
    }
}

#[async_trait]
impl<P> PublisherWithId for Arc<P>
where
    P: PublisherWithId + ?Sized,
{
    async fn publish_with_id(&self, job: &Job) -> anyhow::Result<String> {
        (**self).publish_with_id(job).await
    }
}

/// Registry entry for one destination.
#[derive(Clone)]
pub struct PublisherEntry {
    publish: Arc<dyn Publisher>,
    publish_with_id: Option<Arc<dyn PublisherWithId>>,
}

impl std::fmt::Debug for PublisherEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherEntry")
            .field("supports_id", &self.supports_id())
            .finish()
    }
}

impl PublisherEntry {
    pub fn publish_only(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publish: publisher,
            publish_with_id: None,
        }
    }

    /// Entry for an adapter with both capabilities.
    pub fn with_id<P>(publisher: Arc<P>) -> Self
    where
        P: Publisher + PublisherWithId + 'static,
    {
        Self {
            publish: publisher.clone(),
            publish_with_id: Some(publisher),
        }
    }

    pub fn supports_id(&self) -> bool {
        self.publish_with_id.is_some()
    }

    /// Run one publish, preferring the id-returning capability.
    pub async fn invoke(&self, job: &Job) -> anyhow::Result<Option<String>> {
        match &self.publish_with_id {
            Some(p) => p.publish_with_id(job).await.map(Some),
            None => self.publish.publish(job).await.map(|()| None),
        }
    }
}

/// Destination name → adapter.
#[derive(Debug, Clone, Default)]
pub struct PublisherRegistry {
    entries: HashMap<Destination, PublisherEntry>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `destination` to `entry`, replacing any previous binding.
    pub fn register(&mut self, destination: impl Into<Destination>, entry: PublisherEntry) -> &mut Self {
        self.entries.insert(destination.into(), entry);
        self
    }

    pub fn register_publisher<P>(&mut self, destination: impl Into<Destination>, publisher: P) -> &mut Self
    where
        P: Publisher + 'static,
    {
        self.register(destination, PublisherEntry::publish_only(Arc::new(publisher)))
    }

    pub fn register_with_id<P>(&mut self, destination: impl Into<Destination>, publisher: P) -> &mut Self
    where
        P: Publisher + PublisherWithId + 'static,
    {
        self.register(destination, PublisherEntry::with_id(Arc::new(publisher)))
    }

    pub fn resolve(&self, destination: &Destination) -> Option<&PublisherEntry> {
        self.entries.get(destination)
    }

    /// Registered destinations, sorted.
    pub fn destinations(&self) -> Vec<&Destination> {
        let mut all: Vec<&Destination> = self.entries.keys().collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Logs the job instead of calling out; returns `dry-run:<job-id>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunPublisher;

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, job: &Job) -> anyhow::Result<()> {
        self.publish_with_id(job).await.map(|_| ())
    }
}

#[async_trait]
impl PublisherWithId for DryRunPublisher {
    async fn publish_with_id(&self, job: &Job) -> anyhow::Result<String> {
        info!(
            job_id = %job.id,
            destination = %job.destination,
            title = job.display_title(),
            "dry-run publish"
        );
        Ok(format!("dry-run:{}", job.id))
    }
}
