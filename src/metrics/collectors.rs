//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use super::prometheus::{LLM_REQUESTS_TOTAL, STAGE_DURATION, STAGE_RUNS_TOTAL, TASKS_TOTAL};

/// Metrics collector for recording run metrics.
///
/// Recording is a no-op until `init_metrics()` has been called.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one stage application for one task.
    ///
    /// `duration` is observed only for invoked stages, never for restores.
    pub fn record_stage(&self, stage: &str, outcome: &str, duration: Option<Duration>) {
        if let Some(counter) = STAGE_RUNS_TOTAL.get() {
            counter.with_label_values(&[stage, outcome]).inc();
        }

        if let (Some(histogram), Some(duration)) = (STAGE_DURATION.get(), duration) {
            histogram
                .with_label_values(&[stage])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(stage = stage, outcome = outcome, "Recorded stage metric");
    }

    /// Record the final outcome of a task.
    pub fn record_task(&self, status: &str) {
        if let Some(counter) = TASKS_TOTAL.get() {
            counter.with_label_values(&[status]).inc();
        }
    }

    /// Record an LLM API request.
    pub fn record_llm_request(&self, model: &str, status: &str) {
        if let Some(counter) = LLM_REQUESTS_TOTAL.get() {
            counter.with_label_values(&[model, status]).inc();
        }

        tracing::trace!(model = model, status = status, "Recorded LLM request metric");
    }
}
