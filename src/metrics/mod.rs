//! Prometheus metrics for pipeline runs.
//!
//! ```ignore
//! use sqlforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_task("succeeded");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{
    export_metrics, init_metrics, LLM_REQUESTS_TOTAL, REGISTRY, STAGE_DURATION, STAGE_RUNS_TOTAL,
    TASKS_TOTAL,
};
