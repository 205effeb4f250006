//! Run artifacts: SQL files, predictions, the run report and metrics.
//!
//! Layout under the run directory:
//!
//! ```text
//! {run_dir}/
//!   run_config.json
//!   checkpoints/{task_id}/{stage}.json
//!   sql/{task_id}.sql
//!   predictions.json
//!   run_report.json
//!   metrics.prom
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{ConfigError, OutputError};
use crate::metrics::export_metrics;

use super::config::{fields, PlanStep, RunConfig, StageKind};
use super::run_manager::RunSummary;
use super::task::{StageStatus, Task, TaskFailure};

pub const RUN_CONFIG_FILE: &str = "run_config.json";
pub const PREDICTIONS_FILE: &str = "predictions.json";
pub const REPORT_FILE: &str = "run_report.json";
pub const METRICS_FILE: &str = "metrics.prom";
pub const SQL_DIR: &str = "sql";

/// Final status of a task in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
}

/// One line of `predictions.json`. `sql` is `null` when the task produced none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub task_id: String,
    pub db_id: String,
    pub question: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub status: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub completed_stages: Vec<StageKind>,
    pub stage_status: BTreeMap<StageKind, StageStatus>,
}

/// Contents of `run_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: Vec<PlanStep>,
    pub summary: RunSummary,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn new(
        config: &RunConfig,
        plan: &[PlanStep],
        summary: &RunSummary,
        tasks: &[Task],
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        is_complete: impl Fn(&Task) -> bool,
    ) -> Self {
        let tasks = tasks
            .iter()
            .map(|task| {
                let mut stage_status: BTreeMap<StageKind, StageStatus> =
                    plan.iter().map(|step| (step.kind, task.status(step.kind))).collect();
                stage_status.extend(task.stage_statuses().iter().map(|(k, s)| (*k, *s)));

                TaskReport {
                    task_id: task.id.clone(),
                    status: if is_complete(task) {
                        TaskOutcome::Succeeded
                    } else {
                        TaskOutcome::Failed
                    },
                    failure: task.failure().cloned(),
                    completed_stages: task.completed_stages.clone(),
                    stage_status,
                }
            })
            .collect();

        Self {
            run_id: config.run_id.clone(),
            started_at,
            finished_at,
            plan: plan.to_vec(),
            summary: summary.clone(),
            tasks,
        }
    }
}

/// Paths and counts of the written artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSummary {
    pub sql_files: usize,
    pub missing: usize,
    pub predictions: PathBuf,
    pub report: PathBuf,
    pub metrics: PathBuf,
}

/// Writes the artifacts of one run directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    run_dir: PathBuf,
}

impl OutputWriter {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn sql_path(&self, task_id: &str) -> PathBuf {
        self.run_dir.join(SQL_DIR).join(format!("{}.sql", task_id))
    }

    /// Creates the run directory, which must not exist yet.
    pub async fn create_run_dir(&self) -> Result<(), ConfigError> {
        if fs::try_exists(&self.run_dir).await? {
            return Err(ConfigError::RunDirectoryExists(self.run_dir.clone()));
        }
        fs::create_dir_all(&self.run_dir).await?;
        Ok(())
    }

    pub async fn write_run_config(&self, config: &RunConfig) -> Result<PathBuf, OutputError> {
        let path = self.run_dir.join(RUN_CONFIG_FILE);
        write_file(&path, serde_json::to_string_pretty(config)?.as_bytes()).await?;
        Ok(path)
    }

    /// Writes every artifact for the finished tasks.
    ///
    /// Only tasks for which `is_complete` holds and that carry a `sql` string
    /// get a `.sql` file; every task appears in `predictions.json`.
    pub async fn write_outputs(
        &self,
        tasks: &[Task],
        report: &RunReport,
        is_complete: impl Fn(&Task) -> bool,
    ) -> Result<OutputSummary, OutputError> {
        fs::create_dir_all(self.run_dir.join(SQL_DIR)).await?;

        let mut predictions = Vec::with_capacity(tasks.len());
        let mut sql_files = 0;
        for task in tasks {
            let sql = is_complete(task)
                .then(|| task.state.get(fields::SQL).and_then(|v| v.as_str()))
                .flatten()
                .map(str::to_string);

            if let Some(sql) = &sql {
                write_file(&self.sql_path(&task.id), format!("{}\n", sql).as_bytes()).await?;
                sql_files += 1;
            }

            predictions.push(Prediction {
                task_id: task.id.clone(),
                db_id: task.input.db_id.clone(),
                question: task.input.question.clone(),
                sql,
            });
        }

        let predictions_path = self.run_dir.join(PREDICTIONS_FILE);
        write_file(
            &predictions_path,
            serde_json::to_string_pretty(&predictions)?.as_bytes(),
        )
        .await?;

        let report_path = self.run_dir.join(REPORT_FILE);
        write_file(&report_path, serde_json::to_string_pretty(report)?.as_bytes()).await?;

        let metrics_path = self.run_dir.join(METRICS_FILE);
        write_file(&metrics_path, export_metrics().as_bytes()).await?;

        let missing = tasks.len() - sql_files;
        info!(
            run_dir = %self.run_dir.display(),
            sql_files,
            missing,
            "Wrote run outputs"
        );

        Ok(OutputSummary {
            sql_files,
            missing,
            predictions: predictions_path,
            report: report_path,
            metrics: metrics_path,
        })
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    Ok(())
}
