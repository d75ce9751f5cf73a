use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use herald_core::Destination;
use herald_infra::{
    Dispatcher, DryRunPublisher, JobStore, PostgresJobStore, PublisherRegistry, RateLimiter,
    RedisDedupeGuard, WorkerConfig,
};
use herald_observability::RecordingMetrics;

#[tokio::main]
async fn main() -> ExitCode {
    herald_observability::init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "worker failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = WorkerConfig::from_env().context("loading configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(config.claim_timeout)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;

    let store = PostgresJobStore::new(pool);
    if config.apply_schema {
        store.ensure_schema().await.context("applying schema")?;
        info!("schema applied");
    }

    let registry = build_registry(&config.dry_run_destinations);
    if registry.is_empty() {
        warn!("no publishers registered; claimed jobs will fail as unsupported");
    }

    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
    let metrics = RecordingMetrics::arc();

    let mut dispatcher = Dispatcher::new(store, registry, limiter)
        .with_metrics(metrics.clone())
        .with_config(config.dispatch());

    if let Some(redis_url) = &config.redis_url {
        if let Some(guard) = connect_dedupe(redis_url, config.dedupe_ttl).await {
            dispatcher = dispatcher.with_dedupe(Arc::new(guard));
        }
    }

    match config.run_interval {
        None => {
            let ok = run_and_report(&dispatcher, &metrics).await;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Some(interval) => {
            run_forever(&dispatcher, &metrics, interval).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_registry(dry_run: &[Destination]) -> PublisherRegistry {
    let mut registry = PublisherRegistry::new();
    for destination in dry_run {
        registry.register_with_id(destination.clone(), DryRunPublisher);
        info!(%destination, "dry-run publisher registered");
    }
    registry
}

/// Connect and PING; on any failure run without the guard.
async fn connect_dedupe(redis_url: &str, ttl: Duration) -> Option<RedisDedupeGuard> {
    let guard = match RedisDedupeGuard::connect(redis_url, ttl).await {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "dedupe cache unreachable, continuing without it");
            return None;
        }
    };
    if let Err(e) = guard.ping().await {
        warn!(error = %e, "dedupe cache ping failed, continuing without it");
        return None;
    }
    info!(ttl_secs = ttl.as_secs(), "dedupe guard enabled");
    Some(guard)
}

/// One run plus the summary log line. Returns false if the claim failed.
///
/// Drains `metrics`, so the latency fields cover this run only.
async fn run_and_report<S: JobStore>(
    dispatcher: &Dispatcher<S>,
    metrics: &RecordingMetrics,
) -> bool {
    let result = dispatcher.run().await;
    let snapshot = metrics.take_snapshot();
    match result {
        Ok(summary) => {
            match snapshot.publish_latency {
                Some(latency) => info!(
                    claimed = summary.claimed,
                    published = summary.published,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    unfinalized = summary.unfinalized,
                    attempts = latency.count,
                    latency_min_ms = latency.min.as_millis() as u64,
                    latency_avg_ms = latency.avg.as_millis() as u64,
                    latency_max_ms = latency.max.as_millis() as u64,
                    "run complete"
                ),
                None => info!(
                    claimed = summary.claimed,
                    published = summary.published,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    unfinalized = summary.unfinalized,
                    "run complete"
                ),
            }
            true
        }
        Err(e) => {
            error!(error = %e, "claim failed");
            false
        }
    }
}

async fn run_forever<S: JobStore>(
    dispatcher: &Dispatcher<S>,
    metrics: &RecordingMetrics,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "running on interval");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_and_report(dispatcher, metrics).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return;
            }
        }
    }
}
