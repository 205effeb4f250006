//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by sqlforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all sqlforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Stage applications per task, labeled by stage and outcome
/// (`executed`, `checkpointed`, `failed`).
pub static STAGE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of a single stage invocation in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Final task outcomes, labeled by status (`succeeded`, `failed`).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total LLM API requests, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Calling it more than once is harmless: later calls leave the first
/// registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let stage_runs_total = CounterVec::new(
        Opts::new(
            "sqlforge_stage_runs_total",
            "Stage applications per task by outcome",
        ),
        &["stage", "outcome"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "sqlforge_stage_duration_seconds",
            "Stage invocation duration in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["stage"],
    )?;

    let tasks_total = CounterVec::new(
        Opts::new("sqlforge_tasks_total", "Final task outcomes"),
        &["status"],
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("sqlforge_llm_requests_total", "Total LLM API requests"),
        &["model", "status"],
    )?;

    registry.register(Box::new(stage_runs_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = STAGE_RUNS_TOTAL.set(stage_runs_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
