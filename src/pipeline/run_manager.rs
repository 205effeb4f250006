//! Stage-major execution of a validated pipeline over every task.
//!
//! For each plan step the run manager fans the stage out over all tasks that
//! still need it, bounded by a semaphore, then applies the outcomes in
//! dataset order. A task that fails a step is skipped by every later step;
//! other tasks are unaffected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, RunScope};
use crate::error::{ConfigError, DatasetError, OutputError, RunError, StageError};
use crate::metrics::MetricsCollector;
use crate::stages::{Stage, StageRegistry};

use super::config::{PlanStep, RunConfig, StageConfig, StageKind};
use super::output::{OutputSummary, OutputWriter, RunReport};
use super::task::{build_tasks, DatasetRecord, Fields, Task};

/// Counts for one plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: StageKind,
    pub restore_only: bool,
    /// Invoked this run and checkpointed.
    pub executed: usize,
    /// Restored from an existing checkpoint.
    pub restored: usize,
    pub failed: usize,
    /// Tasks that had already failed at an earlier step.
    pub skipped: usize,
}

impl StageSummary {
    fn new(step: PlanStep) -> Self {
        Self {
            stage: step.kind,
            restore_only: step.restore_only,
            executed: 0,
            restored: 0,
            failed: 0,
            skipped: 0,
        }
    }

    fn record_executed(&mut self) {
        self.executed += 1;
    }

    fn record_restored(&mut self) {
        self.restored += 1;
    }

    fn record_failure(&mut self) {
        self.failed += 1;
    }

    fn record_skipped(&mut self) {
        self.skipped += 1;
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_tasks: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stages: Vec<StageSummary>,
}

/// Result of applying one step to one task.
enum StepOutcome {
    Restored(Fields),
    Executed { state: Fields, elapsed: Duration },
    Failed(String),
}

/// Owns the tasks of one run and drives them through the execution plan.
pub struct RunManager {
    config: Arc<RunConfig>,
    registry: StageRegistry,
    store: Arc<dyn CheckpointStore>,
    scope: RunScope,
    plan: Vec<PlanStep>,
    tasks: Vec<Task>,
    summary: RunSummary,
    metrics: MetricsCollector,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl RunManager {
    /// Creates a run manager for a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the run settings are invalid or a stage of
    /// the plan that may execute has no registered implementation.
    pub fn new(
        config: RunConfig,
        registry: StageRegistry,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let plan = config.execution_plan();
        if let Some(missing) = plan
            .iter()
            .find(|step| !step.restore_only && !registry.contains(step.kind))
        {
            return Err(ConfigError::MissingStageImplementation(
                missing.kind.to_string(),
            ));
        }

        let scope = config.checkpoint_scope();
        Ok(Self {
            config: Arc::new(config),
            registry,
            store,
            scope,
            plan,
            tasks: Vec::new(),
            summary: RunSummary::default(),
            metrics: MetricsCollector::new(),
            started_at: Utc::now(),
            finished_at: None,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Builds one task per record, each starting with empty state.
    pub fn initialize_tasks(&mut self, records: Vec<DatasetRecord>) -> Result<usize, DatasetError> {
        self.initialize_tasks_with_state(records, &Fields::new())
    }

    /// Builds one task per record, each starting from `initial`.
    pub fn initialize_tasks_with_state(
        &mut self,
        records: Vec<DatasetRecord>,
        initial: &Fields,
    ) -> Result<usize, DatasetError> {
        self.tasks = build_tasks(records, initial)?;
        self.summary.total_tasks = self.tasks.len();
        info!(
            run_id = %self.config.run_id,
            tasks = self.tasks.len(),
            "Initialized tasks"
        );
        Ok(self.tasks.len())
    }

    /// Whether `task` completed every step of the plan.
    pub fn is_complete(&self, task: &Task) -> bool {
        !task.is_failed() && self.plan.iter().all(|step| task.has_completed(step.kind))
    }

    /// Applies the plan to every task, one step at a time.
    ///
    /// Per-task failures are recorded on the task and never abort the run.
    pub async fn run_tasks(&mut self) -> &RunSummary {
        info!(
            run_id = %self.config.run_id,
            stages = self.plan.len(),
            tasks = self.tasks.len(),
            "Starting run"
        );

        let plan = self.plan.clone();
        for step in plan {
            let summary = self.run_step(step).await;
            info!(
                stage = %summary.stage,
                executed = summary.executed,
                restored = summary.restored,
                failed = summary.failed,
                skipped = summary.skipped,
                "Stage finished"
            );
            self.summary.stages.push(summary);
        }

        let succeeded = self.tasks.iter().filter(|t| self.is_complete(t)).count();
        self.summary.succeeded = succeeded;
        self.summary.failed = self.tasks.len() - succeeded;
        for task in &self.tasks {
            let status = if self.is_complete(task) {
                "succeeded"
            } else {
                "failed"
            };
            self.metrics.record_task(status);
        }

        self.finished_at = Some(Utc::now());
        info!(
            run_id = %self.config.run_id,
            succeeded = self.summary.succeeded,
            failed = self.summary.failed,
            "Run finished"
        );
        &self.summary
    }

    async fn run_step(&mut self, step: PlanStep) -> StageSummary {
        let mut summary = StageSummary::new(step);
        let stage = self.registry.get(step.kind);
        let stage_config = self
            .config
            .pipeline
            .config(step.kind)
            .cloned()
            .unwrap_or_default();
        let limiter = Semaphore::new(self.config.max_concurrency);

        let mut pending = Vec::new();
        for (index, task) in self.tasks.iter().enumerate() {
            if task.is_failed() {
                summary.record_skipped();
            } else if !task.has_completed(step.kind) {
                pending.push(index);
            }
        }

        let outcomes = {
            let this = &*self;
            join_all(pending.iter().map(|&index| {
                let task = &this.tasks[index];
                let stage = stage.as_deref();
                let stage_config = &stage_config;
                let limiter = &limiter;
                async move {
                    let outcome = this
                        .process_task(step, stage, stage_config, task, limiter)
                        .await;
                    (index, outcome)
                }
            }))
            .await
        };

        let stage_name = step.kind.as_str();
        for (index, outcome) in outcomes {
            let task = &mut self.tasks[index];
            match outcome {
                StepOutcome::Restored(snapshot) => {
                    debug!(task_id = %task.id, stage = stage_name, "Restored from checkpoint");
                    task.record_checkpointed(step.kind, snapshot);
                    summary.record_restored();
                    self.metrics.record_stage(stage_name, "checkpointed", None);
                }
                StepOutcome::Executed { state, elapsed } => {
                    task.record_executed(step.kind, state);
                    summary.record_executed();
                    self.metrics
                        .record_stage(stage_name, "executed", Some(elapsed));
                }
                StepOutcome::Failed(reason) => {
                    warn!(task_id = %task.id, stage = stage_name, reason = %reason, "Task failed");
                    task.record_failure(step.kind, reason);
                    summary.record_failure();
                    self.metrics.record_stage(stage_name, "failed", None);
                }
            }
        }

        summary
    }

    async fn process_task(
        &self,
        step: PlanStep,
        stage: Option<&dyn Stage>,
        stage_config: &StageConfig,
        task: &Task,
        limiter: &Semaphore,
    ) -> StepOutcome {
        let _permit = match limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => return StepOutcome::Failed(format!("worker pool closed: {}", e)),
        };

        if self.config.mode.resumes(step.kind) {
            match self.restore(task, step.kind).await {
                Ok(Some(snapshot)) => return StepOutcome::Restored(snapshot),
                Ok(None) if step.restore_only => {
                    return StepOutcome::Failed(format!(
                        "no checkpoint to restore for stage '{}'",
                        step.kind
                    ))
                }
                Ok(None) => {}
                Err(e) => return StepOutcome::Failed(e.to_string()),
            }
        }

        let Some(stage) = stage else {
            return StepOutcome::Failed(format!("stage '{}' is not registered", step.kind));
        };

        let start = Instant::now();
        match self.execute(stage, stage_config, task).await {
            Ok(state) => StepOutcome::Executed {
                state,
                elapsed: start.elapsed(),
            },
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    /// Reads the checkpoint from the resume source and re-writes it under
    /// this run's scope.
    async fn restore(&self, task: &Task, kind: StageKind) -> Result<Option<Fields>, StageError> {
        let Some(source) = self.config.mode.source_scope() else {
            return Ok(None);
        };

        if !self.store.has_stage(&source, &task.id, kind).await? {
            return Ok(None);
        }

        let Some(snapshot) = self.store.get(&source, &task.id, kind).await? else {
            return Ok(None);
        };

        let stored = self.store.put(&self.scope, &task.id, kind, &snapshot).await?;
        Ok(Some(stored))
    }

    async fn execute(
        &self,
        stage: &dyn Stage,
        stage_config: &StageConfig,
        task: &Task,
    ) -> Result<Fields, StageError> {
        let contract = stage.contract();
        contract.check_inputs(&task.state)?;

        let timeout = self.config.stage_timeout();
        let produced = tokio::time::timeout(timeout, stage.run(task, stage_config))
            .await
            .map_err(|_| StageError::Timeout {
                millis: self.config.stage_timeout_ms,
            })??;
        contract.check_outputs(&produced)?;

        let state = task.merged_state(&produced);
        let stored = self
            .store
            .put(&self.scope, &task.id, stage.kind(), &state)
            .await?;
        debug!(task_id = %task.id, stage = %stage.kind(), "Checkpoint written");
        Ok(stored)
    }

    /// Snapshot of the run for `run_report.json`.
    pub fn report(&self) -> RunReport {
        RunReport::new(
            &self.config,
            &self.plan,
            &self.summary,
            &self.tasks,
            self.started_at,
            self.finished_at.unwrap_or_else(Utc::now),
            |task| self.is_complete(task),
        )
    }

    /// Creates the run directory and records the run configuration.
    ///
    /// # Errors
    ///
    /// Fails when the run directory already exists.
    pub async fn prepare_run_dir(&self) -> Result<OutputWriter, RunError> {
        let writer = OutputWriter::new(self.config.run_dir());
        writer.create_run_dir().await?;
        writer.write_run_config(&self.config).await?;
        Ok(writer)
    }

    /// Writes SQL files, predictions, the run report and metrics.
    pub async fn generate_sql_files(&self) -> Result<OutputSummary, OutputError> {
        let writer = OutputWriter::new(self.config.run_dir());
        writer
            .write_outputs(&self.tasks, &self.report(), |task| self.is_complete(task))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::CheckpointError;
    use crate::pipeline::config::{PipelineDefinition, RunMode};
    use crate::stages::StageContract;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a fixed field; fails for questions containing "boom".
    struct FixedStage {
        kind: StageKind,
        field: &'static str,
        calls: AtomicUsize,
    }

    impl FixedStage {
        fn new(kind: StageKind, field: &'static str) -> Arc<Self> {
            Arc::new(Self {
                kind,
                field,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Stage for FixedStage {
        fn kind(&self) -> StageKind {
            self.kind
        }

        fn contract(&self) -> StageContract {
            StageContract::new(Vec::<String>::new(), [self.field])
        }

        async fn run(&self, task: &Task, _config: &StageConfig) -> Result<Fields, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if task.input.question.contains("boom") {
                return Err(StageError::MalformedResponse("boom".to_string()));
            }
            let mut fields = Fields::new();
            fields.insert(self.field.to_string(), json!(self.kind.as_str()));
            Ok(fields)
        }
    }

    fn pipeline(stages: &[&str]) -> PipelineDefinition {
        PipelineDefinition::validate(stages, &PipelineDefinition::default_setup()).unwrap()
    }

    fn records() -> Vec<DatasetRecord> {
        vec![
            DatasetRecord::new("fine", "db").with_question_id(1),
            DatasetRecord::new("boom", "db").with_question_id(2),
        ]
    }

    #[tokio::test]
    async fn test_failed_task_is_skipped_by_later_stages() {
        let first = FixedStage::new(StageKind::KeywordExtraction, "a");
        let second = FixedStage::new(StageKind::ColumnFiltering, "b");
        let registry = StageRegistry::new()
            .with_stage(first.clone())
            .with_stage(second.clone());
        let config = RunConfig::new(
            "dev.json",
            pipeline(&["keyword_extraction", "column_filtering"]),
        )
        .with_run_id("test-run");

        let mut manager =
            RunManager::new(config, registry, Arc::new(MemoryCheckpointStore::new())).unwrap();
        manager.initialize_tasks(records()).unwrap();
        let summary = manager.run_tasks().await.clone();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.stages[0].failed, 1);
        assert_eq!(summary.stages[1].skipped, 1);
        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);

        let failed = manager.task("db_2").unwrap();
        assert!(failed.completed_stages.is_empty());
        assert_eq!(
            failed.failure().map(|f| f.stage),
            Some(StageKind::KeywordExtraction)
        );
    }

    #[tokio::test]
    async fn test_missing_implementation_is_a_config_error() {
        let registry =
            StageRegistry::new().with_stage(FixedStage::new(StageKind::KeywordExtraction, "a"));
        let config = RunConfig::new(
            "dev.json",
            pipeline(&["keyword_extraction", "table_selection"]),
        );

        let result = RunManager::new(config, registry, Arc::new(MemoryCheckpointStore::new()));
        assert!(matches!(
            result,
            Err(ConfigError::MissingStageImplementation(stage)) if stage == "table_selection"
        ));
    }

    #[tokio::test]
    async fn test_undeclared_output_fails_task() {
        struct Rogue;

        #[async_trait]
        impl Stage for Rogue {
            fn kind(&self) -> StageKind {
                StageKind::KeywordExtraction
            }

            async fn run(&self, _task: &Task, _config: &StageConfig) -> Result<Fields, StageError> {
                let mut fields = Fields::new();
                fields.insert("sql".to_string(), json!("SELECT 1"));
                Ok(fields)
            }
        }

        let registry = StageRegistry::new().with_stage(Arc::new(Rogue));
        let config =
            RunConfig::new("dev.json", pipeline(&["keyword_extraction"])).with_run_id("rogue");
        let mut manager =
            RunManager::new(config, registry, Arc::new(MemoryCheckpointStore::new())).unwrap();
        manager
            .initialize_tasks(vec![DatasetRecord::new("q", "db")])
            .unwrap();
        manager.run_tasks().await;

        let task = &manager.tasks()[0];
        assert!(task.is_failed());
        assert!(task.failure().unwrap().reason.contains("undeclared"));
        assert!(task.state.is_empty());
    }

    #[tokio::test]
    async fn test_stage_timeout_fails_task() {
        struct Slow;

        #[async_trait]
        impl Stage for Slow {
            fn kind(&self) -> StageKind {
                StageKind::KeywordExtraction
            }

            async fn run(&self, _task: &Task, _config: &StageConfig) -> Result<Fields, StageError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Fields::new())
            }
        }

        let config = RunConfig::new("dev.json", pipeline(&["keyword_extraction"]))
            .with_run_id("slow")
            .with_stage_timeout(Duration::from_secs(1));
        let mut manager = RunManager::new(
            config,
            StageRegistry::new().with_stage(Arc::new(Slow)),
            Arc::new(MemoryCheckpointStore::new()),
        )
        .unwrap();
        manager
            .initialize_tasks(vec![DatasetRecord::new("q", "db")])
            .unwrap();

        manager.run_tasks().await;

        let failure = manager.tasks()[0].failure().unwrap();
        assert!(failure.reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_restore_only_step_requires_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let source = RunScope::for_run_dir("results/earlier");

        let mut snapshot = Fields::new();
        snapshot.insert("keywords".to_string(), json!(["schools"]));
        store
            .put(&source, "db_1", StageKind::KeywordExtraction, &snapshot)
            .await
            .unwrap();

        let generation = FixedStage::new(StageKind::CandidateGeneration, "sql");
        let config = RunConfig::new("dev.json", pipeline(&["candidate_generation"]))
            .with_run_id("resumed")
            .with_mode(RunMode::Resume {
                source: "results/earlier".into(),
                stages: vec![StageKind::KeywordExtraction],
            });

        let mut manager = RunManager::new(
            config,
            StageRegistry::new().with_stage(generation.clone()),
            store.clone(),
        )
        .unwrap();
        manager
            .initialize_tasks(vec![
                DatasetRecord::new("q1", "db").with_question_id(1),
                DatasetRecord::new("q2", "db").with_question_id(2),
            ])
            .unwrap();
        manager.run_tasks().await;

        let restored = manager.task("db_1").unwrap();
        assert_eq!(
            restored.status(StageKind::KeywordExtraction),
            crate::pipeline::StageStatus::Checkpointed
        );
        assert_eq!(restored.state["keywords"], json!(["schools"]));
        assert_eq!(restored.state["sql"], json!("candidate_generation"));

        let missing = manager.task("db_2").unwrap();
        assert!(missing.is_failed());
        assert_eq!(generation.calls.load(Ordering::SeqCst), 1);

        let scope = manager.config().checkpoint_scope();
        assert!(store
            .has_stage(&scope, "db_1", StageKind::KeywordExtraction)
            .await
            .unwrap());
    }

    /// Delegates to a memory store but fails every I/O for one task.
    struct BrokenDiskStore {
        inner: Arc<MemoryCheckpointStore>,
        broken_task: &'static str,
        fail_gets: bool,
        has_stage_calls: AtomicUsize,
        get_calls: AtomicUsize,
    }

    impl BrokenDiskStore {
        fn new(inner: Arc<MemoryCheckpointStore>, broken_task: &'static str) -> Self {
            Self {
                inner,
                broken_task,
                fail_gets: false,
                has_stage_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
            }
        }

        fn disk_error() -> CheckpointError {
            CheckpointError::Io(std::io::Error::other("disk unavailable"))
        }
    }

    #[async_trait]
    impl CheckpointStore for BrokenDiskStore {
        async fn put(
            &self,
            scope: &RunScope,
            task_id: &str,
            stage: StageKind,
            state: &Fields,
        ) -> Result<Fields, CheckpointError> {
            if task_id == self.broken_task {
                return Err(Self::disk_error());
            }
            self.inner.put(scope, task_id, stage, state).await
        }

        async fn get(
            &self,
            scope: &RunScope,
            task_id: &str,
            stage: StageKind,
        ) -> Result<Option<Fields>, CheckpointError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_gets && task_id == self.broken_task {
                return Err(Self::disk_error());
            }
            self.inner.get(scope, task_id, stage).await
        }

        async fn has_stage(
            &self,
            scope: &RunScope,
            task_id: &str,
            stage: StageKind,
        ) -> Result<bool, CheckpointError> {
            self.has_stage_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.has_stage(scope, task_id, stage).await
        }
    }

    fn healthy_records() -> Vec<DatasetRecord> {
        vec![
            DatasetRecord::new("first", "db").with_question_id(1),
            DatasetRecord::new("second", "db").with_question_id(2),
        ]
    }

    #[tokio::test]
    async fn test_checkpoint_write_failure_fails_only_that_task() {
        let inner = Arc::new(MemoryCheckpointStore::new());
        let keywords = FixedStage::new(StageKind::KeywordExtraction, "a");
        let filtering = FixedStage::new(StageKind::ColumnFiltering, "b");
        let config = RunConfig::new(
            "dev.json",
            pipeline(&["keyword_extraction", "column_filtering"]),
        )
        .with_run_id("broken-disk");
        let source = config.run_dir();

        let mut manager = RunManager::new(
            config,
            StageRegistry::new()
                .with_stage(keywords.clone())
                .with_stage(filtering.clone()),
            Arc::new(BrokenDiskStore::new(inner.clone(), "db_1")),
        )
        .unwrap();
        manager.initialize_tasks(healthy_records()).unwrap();
        let summary = manager.run_tasks().await.clone();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let broken = manager.task("db_1").unwrap();
        assert!(broken.completed_stages.is_empty());
        assert_eq!(
            broken.status(StageKind::KeywordExtraction),
            crate::pipeline::StageStatus::Failed
        );
        let failure = broken.failure().unwrap();
        assert_eq!(failure.stage, StageKind::KeywordExtraction);
        assert!(failure.reason.contains("disk unavailable"));

        let healthy = manager.task("db_2").unwrap();
        assert!(manager.is_complete(healthy));
        assert_eq!(filtering.calls.load(Ordering::SeqCst), 1);

        // Resuming against a working store re-executes the unsaved stage.
        let rerun_keywords = FixedStage::new(StageKind::KeywordExtraction, "a");
        let rerun_filtering = FixedStage::new(StageKind::ColumnFiltering, "b");
        let config = RunConfig::new(
            "dev.json",
            pipeline(&["keyword_extraction", "column_filtering"]),
        )
        .with_run_id("broken-disk-resumed")
        .with_mode(RunMode::Resume {
            source,
            stages: vec![StageKind::KeywordExtraction, StageKind::ColumnFiltering],
        });
        let mut resumed = RunManager::new(
            config,
            StageRegistry::new()
                .with_stage(rerun_keywords.clone())
                .with_stage(rerun_filtering.clone()),
            inner,
        )
        .unwrap();
        resumed.initialize_tasks(healthy_records()).unwrap();
        let summary = resumed.run_tasks().await.clone();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(rerun_keywords.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rerun_filtering.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            resumed
                .task("db_1")
                .unwrap()
                .status(StageKind::KeywordExtraction),
            crate::pipeline::StageStatus::Executed
        );
        assert_eq!(
            resumed
                .task("db_2")
                .unwrap()
                .status(StageKind::KeywordExtraction),
            crate::pipeline::StageStatus::Checkpointed
        );
    }

    #[tokio::test]
    async fn test_checkpoint_read_failure_fails_only_that_task() {
        let inner = Arc::new(MemoryCheckpointStore::new());
        let source = RunScope::for_run_dir("results/earlier");
        let mut snapshot = Fields::new();
        snapshot.insert("a".to_string(), json!("restored"));
        for task_id in ["db_1", "db_2"] {
            inner
                .put(&source, task_id, StageKind::KeywordExtraction, &snapshot)
                .await
                .unwrap();
        }

        let mut store = BrokenDiskStore::new(inner, "db_1");
        store.fail_gets = true;
        let store = Arc::new(store);

        let keywords = FixedStage::new(StageKind::KeywordExtraction, "a");
        let config = RunConfig::new("dev.json", pipeline(&["keyword_extraction"]))
            .with_run_id("unreadable")
            .with_mode(RunMode::Resume {
                source: "results/earlier".into(),
                stages: vec![StageKind::KeywordExtraction],
            });
        let mut manager = RunManager::new(
            config,
            StageRegistry::new().with_stage(keywords.clone()),
            store.clone(),
        )
        .unwrap();
        manager.initialize_tasks(healthy_records()).unwrap();
        manager.run_tasks().await;

        let broken = manager.task("db_1").unwrap();
        assert!(broken.is_failed());
        assert!(broken.completed_stages.is_empty());

        let healthy = manager.task("db_2").unwrap();
        assert_eq!(
            healthy.status(StageKind::KeywordExtraction),
            crate::pipeline::StageStatus::Checkpointed
        );
        assert_eq!(healthy.state["a"], json!("restored"));
        assert_eq!(keywords.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resume_checks_existence_before_reading() {
        let inner = Arc::new(MemoryCheckpointStore::new());
        let source = RunScope::for_run_dir("results/earlier");
        let mut snapshot = Fields::new();
        snapshot.insert("a".to_string(), json!("restored"));
        inner
            .put(&source, "db_1", StageKind::KeywordExtraction, &snapshot)
            .await
            .unwrap();

        let store = Arc::new(BrokenDiskStore::new(inner, "none"));
        let keywords = FixedStage::new(StageKind::KeywordExtraction, "a");
        let config = RunConfig::new("dev.json", pipeline(&["keyword_extraction"]))
            .with_run_id("existence")
            .with_mode(RunMode::Resume {
                source: "results/earlier".into(),
                stages: vec![StageKind::KeywordExtraction],
            });
        let mut manager = RunManager::new(
            config,
            StageRegistry::new().with_stage(keywords.clone()),
            store.clone(),
        )
        .unwrap();
        manager.initialize_tasks(healthy_records()).unwrap();
        manager.run_tasks().await;

        // db_2 has no checkpoint, so only db_1 is read.
        assert_eq!(store.has_stage_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 1);
        assert_eq!(keywords.calls.load(Ordering::SeqCst), 1);
    }
}
