//! Prometheus metrics, behind the `metrics` feature. Mirrors the teacher's
//! global-registry-of-handles pattern (`telemetry::registry`), specialized
//! to the job scheduler's own counters.

#![cfg(feature = "metrics")]

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for the scheduler. Access via
/// [`Metrics::global`]. Handles are cheap to clone (`Arc` internally).
pub struct Metrics {
    pub(crate) registry: Registry,

    /// Total jobs created, ever.
    pub jobs_created_total: IntCounter,
    /// Total jobs removed (explicit `remove` or `deleteAfterRun`).
    pub jobs_removed_total: IntCounter,
    /// Jobs currently held in memory.
    pub jobs_active: IntGauge,

    /// Total run attempts by terminal status.
    /// Label: status (ok, error, timeout, missed).
    pub runs_total: IntCounterVec,
    /// Run duration in seconds.
    pub run_duration_seconds: Histogram,

    /// Create calls rejected for quota.
    pub quota_rejections_total: IntCounter,
    /// Store write failures.
    pub store_write_errors_total: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let jobs_created_total =
            IntCounter::new("taskbeat_jobs_created_total", "Total jobs created")
                .expect("hardcoded metric descriptor");
        let jobs_removed_total =
            IntCounter::new("taskbeat_jobs_removed_total", "Total jobs removed")
                .expect("hardcoded metric descriptor");
        let jobs_active = IntGauge::new("taskbeat_jobs_active", "Jobs currently held in memory")
            .expect("hardcoded metric descriptor");

        let runs_total = IntCounterVec::new(
            Opts::new("taskbeat_runs_total", "Total run attempts by terminal status"),
            &["status"],
        )
        .expect("hardcoded metric descriptor");

        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("taskbeat_run_duration_seconds", "Run duration in seconds")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .expect("hardcoded metric descriptor");

        let quota_rejections_total = IntCounter::new(
            "taskbeat_quota_rejections_total",
            "Create calls rejected for quota",
        )
        .expect("hardcoded metric descriptor");

        let store_write_errors_total = IntCounter::new(
            "taskbeat_store_write_errors_total",
            "Store write failures",
        )
        .expect("hardcoded metric descriptor");

        registry
            .register(Box::new(jobs_created_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(jobs_removed_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(jobs_active.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(runs_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(run_duration_seconds.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(quota_rejections_total.clone()))
            .expect("hardcoded metric");
        registry
            .register(Box::new(store_write_errors_total.clone()))
            .expect("hardcoded metric");

        Self {
            registry,
            jobs_created_total,
            jobs_removed_total,
            jobs_active,
            runs_total,
            run_duration_seconds,
            quota_rejections_total,
            store_write_errors_total,
        }
    }

    pub fn global() -> &'static Self {
        &METRICS
    }
}
