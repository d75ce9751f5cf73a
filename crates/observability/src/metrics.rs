//! Metrics sink contract.
//!
//! The dispatch loop never owns counters itself; a sink is injected at
//! construction. Every call is fire-and-forget: implementations must not
//! block for long and have no way to fail the pipeline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Terminal outcome of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Published,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Published => "published",
            Outcome::Failed => "failed",
        }
    }
}

/// Receiver of pipeline telemetry.
pub trait MetricsSink: Send + Sync {
    /// Count one terminal outcome for a destination.
    fn record_outcome(&self, destination: &str, outcome: Outcome);

    /// Observe the duration of a single publish attempt.
    fn observe_publish(&self, destination: &str, elapsed: Duration);
}

impl<S> MetricsSink for Arc<S>
where
    S: MetricsSink + ?Sized,
{
    fn record_outcome(&self, destination: &str, outcome: Outcome) {
        (**self).record_outcome(destination, outcome)
    }

    fn observe_publish(&self, destination: &str, elapsed: Duration) {
        (**self).observe_publish(destination, elapsed)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_outcome(&self, _destination: &str, _outcome: Outcome) {}

    fn observe_publish(&self, _destination: &str, _elapsed: Duration) {}
}

/// Emits every observation as a `debug` tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_outcome(&self, destination: &str, outcome: Outcome) {
        debug!(
            metric = "herald_jobs_total",
            destination,
            outcome = outcome.as_str(),
            "counter increment"
        );
    }

    fn observe_publish(&self, destination: &str, elapsed: Duration) {
        debug!(
            metric = "herald_publish_seconds",
            destination,
            seconds = elapsed.as_secs_f64(),
            "duration observation"
        );
    }
}

/// In-process accumulator, used for the per-run summary and in tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    outcomes: BTreeMap<(String, Outcome), u64>,
    latencies: BTreeMap<String, Vec<Duration>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Count for one destination/outcome pair.
    pub fn count(&self, destination: &str, outcome: Outcome) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .outcomes
            .get(&(destination.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.summarise()
    }

    /// Everything recorded since the previous take, then start empty.
    ///
    /// Long-running workers call this once per run so samples never pile up.
    pub fn take_snapshot(&self) -> MetricsSnapshot {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *inner).summarise()
    }
}

impl Recorded {
    fn summarise(&self) -> MetricsSnapshot {
        let mut published = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for ((destination, outcome), count) in &self.outcomes {
            let target = match outcome {
                Outcome::Published => &mut published,
                Outcome::Failed => &mut failed,
            };
            target.insert(destination.clone(), *count);
        }

        let all: Vec<Duration> = self.latencies.values().flatten().copied().collect();

        MetricsSnapshot {
            published,
            failed,
            publish_latency: LatencySummary::from_samples(&all),
        }
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_outcome(&self, destination: &str, outcome: Outcome) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner
            .outcomes
            .entry((destination.to_string(), outcome))
            .or_insert(0) += 1;
    }

    fn observe_publish(&self, destination: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .latencies
            .entry(destination.to_string())
            .or_default()
            .push(elapsed);
    }
}

/// Point-in-time view of a [`RecordingMetrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub published: BTreeMap<String, u64>,
    pub failed: BTreeMap<String, u64>,
    pub publish_latency: Option<LatencySummary>,
}

/// count/min/avg/max over a set of latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

impl LatencySummary {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        let count = samples.len();
        let avg = total / u32::try_from(count).unwrap_or(u32::MAX);
        Some(Self { count, min, avg, max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_counts_per_destination() {
        let m = RecordingMetrics::new();
        m.record_outcome("linkedin", Outcome::Published);
        m.record_outcome("linkedin", Outcome::Published);
        m.record_outcome("linkedin", Outcome::Failed);
        m.record_outcome("twitter", Outcome::Failed);

        assert_eq!(m.count("linkedin", Outcome::Published), 2);
        assert_eq!(m.count("linkedin", Outcome::Failed), 1);
        assert_eq!(m.count("twitter", Outcome::Published), 0);

        let snap = m.snapshot();
        assert_eq!(snap.published.get("linkedin"), Some(&2));
        assert_eq!(snap.failed.get("twitter"), Some(&1));
        assert!(snap.publish_latency.is_none());
    }

    #[test]
    fn latency_summary() {
        let summary = LatencySummary::from_samples(&[
            Duration::from_millis(100),
            Duration::from_millis(300),
            Duration::from_millis(200),
        ])
        .unwrap();

        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, Duration::from_millis(100));
        assert_eq!(summary.max, Duration::from_millis(300));
        assert_eq!(summary.avg, Duration::from_millis(200));
        assert!(LatencySummary::from_samples(&[]).is_none());
    }

    #[test]
    fn sinks_are_usable_behind_arc_dyn() {
        let sinks: Vec<Arc<dyn MetricsSink>> = vec![
            Arc::new(NoopMetrics),
            Arc::new(TracingMetrics),
            RecordingMetrics::arc(),
        ];
        for sink in sinks {
            sink.record_outcome("mastodon", Outcome::Published);
            sink.observe_publish("mastodon", Duration::from_millis(5));
        }
    }

    #[test]
    fn take_snapshot_drains_between_runs() {
        let m = RecordingMetrics::new();
        m.observe_publish("linkedin", Duration::from_millis(40));
        m.record_outcome("linkedin", Outcome::Published);

        let first = m.take_snapshot();
        assert_eq!(first.publish_latency.unwrap().count, 1);
        assert_eq!(first.published.get("linkedin"), Some(&1));

        m.observe_publish("linkedin", Duration::from_millis(90));
        let second = m.take_snapshot();
        let latency = second.publish_latency.unwrap();
        assert_eq!(latency.count, 1);
        assert_eq!(latency.min, Duration::from_millis(90));
        assert!(second.published.is_empty());

        assert!(m.take_snapshot().publish_latency.is_none());
        assert_eq!(m.count("linkedin", Outcome::Published), 0);
    }

    #[test]
    fn snapshot_serialises() {
        let m = RecordingMetrics::new();
        m.observe_publish("facebook", Duration::from_millis(10));
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["publish_latency"]["count"], 1);
    }
}
