//! Integration tests for the full dispatch pipeline.
//!
//! Tests: Claim → RateLimiter → RetryEngine → Publisher → UpdateStatus
//!
//! Verifies:
//! - Unresolved destinations fail without retries
//! - Remote ids and publish timestamps are recorded
//! - Transient upstream errors are retried until success
//! - Concurrent runs partition the due jobs with no overlap

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;

    use herald_core::{Job, JobId, JobStatus};
    use herald_observability::{Outcome, RecordingMetrics};

    use crate::dispatch::Dispatcher;
    use crate::publisher::{Publisher, PublisherRegistry, PublisherWithId};
    use crate::rate_limit::{RateLimitConfig, RateLimiter};
    use crate::store::{InMemoryJobStore, JobStore};

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn due_job(id: &str, destination: &str, offset_secs: i64) -> Job {
        Job::scheduled(
            id,
            "campaign-1",
            destination,
            Utc::now() + ChronoDuration::seconds(offset_secs),
        )
        .with_campaign_name("Spring launch")
    }

    fn limiter(capacity: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            RateLimitConfig::default()
                .with_capacity("linkedin", capacity)
                .with_default_capacity(capacity),
        ))
    }

    /// Returns a fixed remote id and counts calls.
    struct RemoteId {
        id: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Publisher for RemoteId {
        async fn publish(&self, job: &Job) -> anyhow::Result<()> {
            self.publish_with_id(job).await.map(|_| ())
        }
    }

    #[async_trait]
    impl PublisherWithId for RemoteId {
        async fn publish_with_id(&self, _job: &Job) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.id.to_string())
        }
    }

    /// Fails with a rate-limit error until `succeed_on`.
    struct Flaky {
        succeed_on: u32,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn publish(&self, _job: &Job) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.succeed_on {
                bail!("HTTP 429: too many requests");
            }
            Ok(())
        }
    }

    /// Records every job id it sees.
    struct Recorder {
        seen: Arc<Mutex<Vec<JobId>>>,
    }

    #[async_trait]
    impl Publisher for Recorder {
        async fn publish(&self, job: &Job) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(job.id.clone());
            tokio::task::yield_now().await;
            Ok(())
        }
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    #[tokio::test]
    async fn unresolved_destination_is_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        store.insert(due_job("a", "linkedin", 30)).unwrap();

        let metrics = RecordingMetrics::arc();
        let dispatcher = Dispatcher::new(store.clone(), PublisherRegistry::new(), limiter(1))
            .with_metrics(metrics.clone());

        let summary = dispatcher.run_once(WINDOW, 50).await.unwrap();
        assert_eq!((summary.published, summary.failed), (0, 1));

        let job = store.get(&JobId::new("a")).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.external_id.is_none());
        assert!(job.published_at.is_none());
        assert_eq!(
            job.metadata.unwrap()["error"],
            "unsupported platform: linkedin"
        );
        assert_eq!(metrics.count("linkedin", Outcome::Failed), 1);
        // Never reached a publisher, so no attempt latency.
        assert!(metrics.snapshot().publish_latency.is_none());
    }

    #[tokio::test]
    async fn remote_id_is_recorded() {
        let store = Arc::new(InMemoryJobStore::new());
        store.insert(due_job("b", "linkedin", 30)).unwrap();

        let publisher = Arc::new(RemoteId {
            id: "urn:li:post:123",
            calls: AtomicU32::new(0),
        });
        let mut registry = PublisherRegistry::new();
        registry.register("linkedin", crate::publisher::PublisherEntry::with_id(publisher.clone()));

        let metrics = RecordingMetrics::arc();
        let dispatcher =
            Dispatcher::new(store.clone(), registry, limiter(1)).with_metrics(metrics.clone());

        let started = Utc::now();
        let summary = dispatcher.run_once(WINDOW, 50).await.unwrap();
        assert_eq!(summary.published, 1);

        let job = store.get(&JobId::new("b")).unwrap();
        assert_eq!(job.status, JobStatus::Published);
        assert_eq!(job.external_id.as_deref(), Some("urn:li:post:123"));
        assert!(job.published_at.unwrap() >= started);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.count("linkedin", Outcome::Published), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let store = Arc::new(InMemoryJobStore::new());
        store.insert(due_job("c", "twitter", 30)).unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = PublisherRegistry::new();
        registry.register_publisher(
            "twitter",
            Flaky {
                succeed_on: 4,
                calls: calls.clone(),
            },
        );

        let metrics = RecordingMetrics::arc();
        let dispatcher =
            Dispatcher::new(store.clone(), registry, limiter(1)).with_metrics(metrics.clone());
        let summary = dispatcher.run_once(WINDOW, 50).await.unwrap();

        assert_eq!(summary.published, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let job = store.get(&JobId::new("c")).unwrap();
        assert_eq!(job.status, JobStatus::Published);
        assert!(job.external_id.is_none());
        assert_eq!(metrics.snapshot().publish_latency.unwrap().count, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_partition_due_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..10 {
            store.insert(due_job(&format!("d{i}"), "mastodon", 10 + i)).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let build = || {
            let mut registry = PublisherRegistry::new();
            registry.register_publisher("mastodon", Recorder { seen: seen.clone() });
            Dispatcher::new(store.clone(), registry, limiter(1_000))
        };
        let first = build();
        let second = build();

        let (a, b) = tokio::join!(first.run_once(WINDOW, 50), second.run_once(WINDOW, 50));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.processed() + b.processed(), 10);
        assert_eq!(a.claimed + b.claimed, 10);

        let seen = seen.lock().unwrap();
        let unique: HashSet<&JobId> = seen.iter().collect();
        assert_eq!(seen.len(), 10);
        assert_eq!(unique.len(), 10);
        assert_eq!(store.count_by_status(JobStatus::Published), 10);
    }

    // ========================================================================
    // Properties
    // ========================================================================

    #[tokio::test]
    async fn terminal_jobs_are_never_revisited() {
        let store = Arc::new(InMemoryJobStore::new());
        store.insert(due_job("x", "facebook", 5)).unwrap();
        store.insert(due_job("y", "mastodon", 5)).unwrap();

        let mut registry = PublisherRegistry::new();
        registry.register_publisher(
            "mastodon",
            Recorder {
                seen: Arc::new(Mutex::new(Vec::new())),
            },
        );
        let dispatcher = Dispatcher::new(store.clone(), registry, limiter(10));

        dispatcher.run_once(WINDOW, 50).await.unwrap();
        let before = store.list();

        let again = dispatcher.run_once(WINDOW, 50).await.unwrap();
        assert_eq!(again.claimed, 0);

        let after = store.list();
        assert_eq!(before, after);
        assert!(after.iter().all(|j| j.status.is_terminal()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn concurrent_claims_never_overlap(
            due in 0usize..40,
            claimers in 1usize..8,
            limit in 1usize..10,
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            let (batches, remaining) = rt.block_on(async {
                let store = Arc::new(InMemoryJobStore::new());
                let now = Utc::now();
                for i in 0..due {
                    store
                        .insert(Job::scheduled(
                            format!("p{i}"),
                            "c",
                            "linkedin",
                            now + ChronoDuration::seconds(1 + i as i64),
                        ))
                        .unwrap();
                }

                let handles: Vec<_> = (0..claimers)
                    .map(|_| {
                        let store = store.clone();
                        tokio::spawn(async move { store.claim(now, WINDOW, limit).await })
                    })
                    .collect();

                let mut batches = Vec::new();
                for h in handles {
                    batches.push(h.await.unwrap().unwrap());
                }
                (batches, store.count_by_status(JobStatus::Scheduled))
            });

            let mut ids = HashSet::new();
            let mut total = 0;
            for batch in &batches {
                prop_assert!(batch.len() <= limit);
                for job in batch {
                    prop_assert!(ids.insert(job.id.clone()));
                    total += 1;
                }
            }
            prop_assert_eq!(total + remaining, due);
            prop_assert_eq!(total, due.min(claimers * limit));
        }
    }
}
