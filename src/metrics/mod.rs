//! Prometheus metrics for the scheduler node
//!
//! This module provides metrics tracking for:
//! - Job lifecycle: enqueues, dedup rejections
//! - Execution: outcomes, handler duration, drain batches
//! - Leadership: heartbeats, transitions, current role
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails or never happens, metrics operations are no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all scheduler metrics
struct SchedulerMetrics {
    jobs_enqueued: CounterVec,
    dedup_rejections: CounterVec,
    jobs_executed: CounterVec,
    execution_duration: HistogramVec,
    drains: Counter,
    drained_jobs: Counter,
    heartbeats: Counter,
    heartbeat_errors: Counter,
    leadership_transitions: CounterVec,
    is_leader: Gauge,
}

/// Global storage for scheduler metrics
static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Call once at application startup. If registration fails the error is
/// returned and every later metric operation becomes a no-op.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = jobwarden::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = SchedulerMetrics {
        jobs_enqueued: register_counter_vec!(
            "jobwarden_jobs_enqueued_total",
            "Total jobs inserted into the queue by name",
            &["name"]
        )?,
        dedup_rejections: register_counter_vec!(
            "jobwarden_dedup_rejections_total",
            "Total enqueues rejected by a dedup guard",
            &["guard"]
        )?,
        jobs_executed: register_counter_vec!(
            "jobwarden_jobs_executed_total",
            "Total job executions by outcome",
            &["outcome"]
        )?,
        execution_duration: register_histogram_vec!(
            "jobwarden_job_duration_seconds",
            "Handler run time in seconds",
            &["name"],
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
        )?,
        drains: register_counter!(
            "jobwarden_drains_total",
            "Total drain batches run by the job observer"
        )?,
        drained_jobs: register_counter!(
            "jobwarden_drained_jobs_total",
            "Total jobs picked up by drain batches"
        )?,
        heartbeats: register_counter!(
            "jobwarden_heartbeats_total",
            "Total leadership heartbeats written"
        )?,
        heartbeat_errors: register_counter!(
            "jobwarden_heartbeat_errors_total",
            "Total leadership heartbeats that failed to write"
        )?,
        leadership_transitions: register_counter_vec!(
            "jobwarden_leadership_transitions_total",
            "Total leadership changes by reason",
            &["reason"]
        )?,
        is_leader: register_gauge!(
            "jobwarden_is_leader",
            "Whether this process currently leads (1 = yes, 0 = no)"
        )?,
    };

    SCHEDULER_METRICS
        .set(metrics)
        .map_err(|_| "Scheduler metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SCHEDULER_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record an inserted job
pub fn record_enqueued(name: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.jobs_enqueued.with_label_values(&[name]).inc();
    }
}

/// Record an enqueue rejected by the `unique` or `singular` guard
pub fn record_rejection(guard: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.dedup_rejections.with_label_values(&[guard]).inc();
    }
}

/// Record the outcome of one job execution
pub fn record_execution(outcome: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.jobs_executed.with_label_values(&[outcome]).inc();
    }
}

/// Record a finished drain batch
pub fn record_drain(jobs: usize) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    m.drains.inc();
    if jobs > 0 {
        m.drained_jobs.inc_by(jobs as f64);
    }
}

/// Record a heartbeat write
pub fn record_heartbeat(ok: bool) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    if ok {
        m.heartbeats.inc();
    } else {
        m.heartbeat_errors.inc();
    }
}

/// Record a leadership change
pub fn record_leadership(reason: &str, is_leader: bool) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    m.leadership_transitions.with_label_values(&[reason]).inc();
    m.is_leader.set(if is_leader { 1.0 } else { 0.0 });
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a handler timer for a job name
pub fn start_execution_timer(name: &str) -> MetricsTimer {
    match SCHEDULER_METRICS.get() {
        Some(m) => MetricsTimer::new(m.execution_duration.with_label_values(&[name]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================
