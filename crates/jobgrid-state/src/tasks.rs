//! Tasks: creation under a running job, the task status and stage machines,
//! leases, and the bulk cascades a job applies to its tasks.
//!
//! Status and stage are independent. Stages only move forward:
//!
//! ```text
//! begin ──► training ──► predicting ──► evaluating ──► end
//! ```

use std::str::FromStr;

use tracing::{debug, info};

use jobgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::query::{ListQuery, Page, SortField, SortOrder, SortValue, ValueKind, paginate};
use crate::store::{Document, Leasable, StateStore, insert_new_doc, load_doc, load_matching};
use crate::tables::TASKS;
use crate::types::*;

impl Document for Task {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = TASKS;
    const KIND: &'static str = "task";

    fn key(&self) -> &str {
        &self.id
    }

    fn refresh(&mut self, _now: u64) {
        Task::refresh(self);
    }
}

impl Leasable for Task {
    fn holder(&self) -> Option<&str> {
        self.process.as_deref()
    }

    fn set_holder(&mut self, process: Option<String>) {
        self.process = process;
    }

    fn releasable_on_death(&self) -> bool {
        self.status != TaskStatus::Error
    }
}

// ── Status and stage machines ──────────────────────────────────────

impl TaskStatus {
    /// Whether a task may move from `self` to `target`.
    pub fn can_become(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        self == target
            || matches!(
                (self, target),
                (_, Error)
                    | (Scheduled | Pausing | Paused, Running)
                    | (Running, Pausing)
                    | (Pausing, Paused)
                    | (Running, Completed)
                    | (Running | Pausing | Paused, Terminating)
                    | (Terminating, Terminated)
                    | (Scheduled, Canceled)
            )
    }
}

impl Task {
    pub fn apply_status(&mut self, target: TaskStatus, now: u64) -> StateResult<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_become(target) {
            return Err(StateError::BadInput(format!(
                "task {} cannot go from {} to {}",
                self.id, self.status, target
            )));
        }
        if target == TaskStatus::Error {
            // Abort the stage in flight.
            if let Some(current) = self.stage_times.interval_mut(self.stage) {
                if current.start.is_some() {
                    current.end.get_or_insert(now);
                }
            }
        }
        self.status = target;
        self.refresh();
        Ok(())
    }

    /// Advance to `target`, closing the current stage and opening the next.
    pub fn apply_stage(&mut self, target: TaskStage, now: u64) -> StateResult<()> {
        if self.stage == target {
            return Ok(());
        }
        if self.status == TaskStatus::Error {
            return Err(StateError::BadInput(format!(
                "task {} is in error, its stage is frozen",
                self.id
            )));
        }
        if target.rank() < self.stage.rank() {
            return Err(StateError::BadInput(format!(
                "task {} cannot go back from stage {} to {}",
                self.id, self.stage, target
            )));
        }
        if let Some(current) = self.stage_times.interval_mut(self.stage) {
            current.end.get_or_insert(now);
        }
        if let Some(next) = self.stage_times.interval_mut(target) {
            next.start.get_or_insert(now);
        }
        self.stage = target;
        self.refresh();
        Ok(())
    }
}

// ── Filters and sorting ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TaskFilter {
    Id(String),
    Job(String),
    Process(String),
    User(String),
    Dataset(String),
    Model(String),
    Objective(String),
    Status(TaskStatus),
    Stage(TaskStage),
    AltObjective(String),
}

impl TaskFilter {
    pub fn parse(key: &str, value: &str) -> StateResult<Self> {
        Ok(match key {
            "id" => TaskFilter::Id(value.to_string()),
            "job" => TaskFilter::Job(value.to_string()),
            "process" => TaskFilter::Process(value.to_string()),
            "user" => TaskFilter::User(value.to_string()),
            "dataset" => TaskFilter::Dataset(value.to_string()),
            "model" => TaskFilter::Model(value.to_string()),
            "objective" => TaskFilter::Objective(value.to_string()),
            "status" => TaskFilter::Status(value.parse()?),
            "stage" => TaskFilter::Stage(value.parse()?),
            "alt-objective" => TaskFilter::AltObjective(value.to_string()),
            other => {
                return Err(StateError::BadInput(format!(
                    "unsupported task filter {other:?}"
                )));
            }
        })
    }

    pub fn matches(&self, task: &Task) -> bool {
        match self {
            TaskFilter::Id(id) => &task.id == id,
            TaskFilter::Job(job) => &task.job == job,
            TaskFilter::Process(process) => task.process.as_deref() == Some(process.as_str()),
            TaskFilter::User(user) => &task.user == user,
            TaskFilter::Dataset(dataset) => &task.dataset == dataset,
            TaskFilter::Model(model) => &task.model == model,
            TaskFilter::Objective(objective) => &task.objective == objective,
            TaskFilter::Status(status) => task.status == *status,
            TaskFilter::Stage(stage) => task.stage == *stage,
            TaskFilter::AltObjective(alt) => task.alt_objectives.contains(alt),
        }
    }
}

fn matches_all(filters: &[TaskFilter], task: &Task) -> bool {
    filters.iter().all(|f| f.matches(task))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSort {
    Id,
    Job,
    Process,
    User,
    Dataset,
    Model,
    Objective,
    Quality,
    QualityTrain,
    QualityExpected,
    CreationTime,
    Status,
    Stage,
}

impl FromStr for TaskSort {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        Ok(match s {
            "id" => TaskSort::Id,
            "job" => TaskSort::Job,
            "process" => TaskSort::Process,
            "user" => TaskSort::User,
            "dataset" => TaskSort::Dataset,
            "model" => TaskSort::Model,
            "objective" => TaskSort::Objective,
            "quality" => TaskSort::Quality,
            "quality-train" => TaskSort::QualityTrain,
            "quality-expected" => TaskSort::QualityExpected,
            "creation-time" => TaskSort::CreationTime,
            "status" => TaskSort::Status,
            "stage" => TaskSort::Stage,
            other => {
                return Err(StateError::BadInput(format!(
                    "invalid task sort field {other:?}"
                )));
            }
        })
    }
}

impl SortField<Task> for TaskSort {
    fn kind(&self) -> ValueKind {
        match self {
            TaskSort::Quality | TaskSort::QualityTrain | TaskSort::QualityExpected => {
                ValueKind::Float
            }
            TaskSort::CreationTime | TaskSort::Stage => ValueKind::Int,
            _ => ValueKind::Text,
        }
    }

    fn value_of(&self, task: &Task) -> SortValue {
        match self {
            TaskSort::Id => SortValue::Text(task.id.clone()),
            TaskSort::Job => SortValue::Text(task.job.clone()),
            TaskSort::Process => SortValue::Text(task.process.clone().unwrap_or_default()),
            TaskSort::User => SortValue::Text(task.user.clone()),
            TaskSort::Dataset => SortValue::Text(task.dataset.clone()),
            TaskSort::Model => SortValue::Text(task.model.clone()),
            TaskSort::Objective => SortValue::Text(task.objective.clone()),
            TaskSort::Quality => SortValue::Float(task.quality),
            TaskSort::QualityTrain => SortValue::Float(task.quality_train),
            TaskSort::QualityExpected => SortValue::Float(task.quality_expected),
            TaskSort::CreationTime => SortValue::Int(task.creation_time as i64),
            TaskSort::Status => SortValue::Text(task.status.to_string()),
            // Pipeline order rather than alphabetical.
            TaskSort::Stage => SortValue::Int(i64::from(task.stage.rank())),
        }
    }
}

// ── Inputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub job: JobId,
    pub model: String,
    /// Concrete configuration drawn from the job's configuration space.
    pub config: String,
}

/// Field-level task update. The stage is applied before the status, so a
/// single update can both finish a stage and fail the task.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub quality: Option<f64>,
    pub quality_train: Option<f64>,
    pub quality_expected: Option<f64>,
    pub alt_qualities: Option<Vec<f64>>,
    pub status: Option<TaskStatus>,
    pub stage: Option<TaskStage>,
    pub status_message: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn stage(stage: TaskStage) -> Self {
        Self {
            stage: Some(stage),
            ..Self::default()
        }
    }
}

// ── Store operations ───────────────────────────────────────────────

impl StateStore {
    /// Instantiate the next task of a running job. The sequence number is
    /// derived from the sibling count inside the same write transaction, so
    /// concurrent creations for one job never collide.
    pub fn create_task(&self, caller: &Caller, new: NewTask) -> StateResult<Task> {
        let now = epoch_millis();
        let mut task = self.write(|txn| {
            let job: Job = load_doc(txn, &new.job)?
                .filter(|j: &Job| caller.can_see(&j.user))
                .ok_or_else(|| StateError::NotFound(format!("job {}", new.job)))?;
            if job.status != JobStatus::Running {
                return Err(StateError::BadInput(format!(
                    "job {} is {}, not running",
                    job.id, job.status
                )));
            }
            if !job.models.contains(&new.model) {
                return Err(StateError::BadInput(format!(
                    "job {} does not list model {}",
                    job.id, new.model
                )));
            }

            let siblings = load_matching(txn, |t: &Task| t.job == job.id)?.len() as u64;
            let task = Task {
                id: task_id(&job.id, siblings + 1),
                job: job.id.clone(),
                process: None,
                user: job.user.clone(),
                dataset: job.dataset.clone(),
                model: new.model,
                objective: job.objective.clone(),
                alt_objectives: job.alt_objectives.clone(),
                config: new.config,
                quality: 0.0,
                quality_train: 0.0,
                quality_expected: 0.0,
                alt_qualities: Vec::new(),
                status: TaskStatus::Scheduled,
                status_message: String::new(),
                stage: TaskStage::Begin,
                stage_times: StageTimes::default(),
                stage_durations: StageDurations::default(),
                creation_time: now,
                running_duration: 0,
            };
            insert_new_doc(txn, &task)?;
            Ok(task)
        })?;
        task.refresh();
        info!(id = %task.id, model = %task.model, "task created");
        Ok(task)
    }

    pub fn get_task(&self, caller: &Caller, id: &str) -> StateResult<Task> {
        match self.fetch::<Task>(id)? {
            Some(task) if caller.can_see(&task.user) => Ok(task),
            _ => Err(StateError::NotFound(format!("task {id}"))),
        }
    }

    pub fn list_tasks(
        &self,
        caller: &Caller,
        filters: &[TaskFilter],
        query: &ListQuery<TaskSort>,
    ) -> StateResult<Page<Task>> {
        let docs = self.scan(|t: &Task| caller.can_see(&t.user) && matches_all(filters, t))?;
        paginate(docs, query)
    }

    pub fn count_tasks(&self, caller: &Caller, filters: &[TaskFilter]) -> StateResult<usize> {
        self.count(|t: &Task| caller.can_see(&t.user) && matches_all(filters, t))
    }

    /// Apply a field-level update. Either every field is applied or none is.
    pub fn update_task(&self, caller: &Caller, id: &str, update: TaskUpdate) -> StateResult<Task> {
        let now = epoch_millis();
        let task = self.modify(id, |_, task: &mut Task| {
            caller.authorize(Task::KIND, &task.id, &task.user)?;
            if let Some(quality) = update.quality {
                task.quality = quality;
            }
            if let Some(quality) = update.quality_train {
                task.quality_train = quality;
            }
            if let Some(quality) = update.quality_expected {
                task.quality_expected = quality;
            }
            if let Some(qualities) = &update.alt_qualities {
                task.alt_qualities = qualities.clone();
            }
            if let Some(message) = &update.status_message {
                task.status_message = message.clone();
            }
            if let Some(stage) = update.stage {
                task.apply_stage(stage, now)?;
            }
            if let Some(status) = update.status {
                task.apply_status(status, now)?;
            }
            Ok(())
        })?;
        debug!(%id, status = %task.status, stage = %task.stage, "task updated");
        Ok(task)
    }

    pub fn lease_task(
        &self,
        filters: &[TaskFilter],
        process_id: &str,
        sort: Option<TaskSort>,
        order: SortOrder,
    ) -> StateResult<Option<Task>> {
        self.lease(|t: &Task| matches_all(filters, t), sort, order, process_id)
    }

    pub fn release_task(&self, id: &str, process_id: &str) -> StateResult<()> {
        self.release::<Task>(id, process_id)
    }

    // ── Job cascades ───────────────────────────────────────────────

    /// Move every task of `job_id` whose status is in `from` to `to`, in
    /// one conditional bulk update. Re-applying is harmless.
    fn cascade_tasks(&self, job_id: &str, from: &[TaskStatus], to: TaskStatus) -> StateResult<usize> {
        let moved = self.update_all(
            |t: &Task| t.job == job_id && from.contains(&t.status),
            |t| t.status = to,
        )?;
        debug!(job = %job_id, to = %to, moved, "task cascade applied");
        Ok(moved)
    }

    pub fn pause_running_tasks(&self, job_id: &str) -> StateResult<usize> {
        self.cascade_tasks(
            job_id,
            &[TaskStatus::Scheduled, TaskStatus::Running],
            TaskStatus::Pausing,
        )
    }

    pub fn resume_paused_tasks(&self, job_id: &str) -> StateResult<usize> {
        self.cascade_tasks(
            job_id,
            &[TaskStatus::Pausing, TaskStatus::Paused],
            TaskStatus::Scheduled,
        )
    }

    pub fn terminate_running_tasks(&self, job_id: &str) -> StateResult<usize> {
        self.cascade_tasks(
            job_id,
            &[
                TaskStatus::Scheduled,
                TaskStatus::Running,
                TaskStatus::Pausing,
                TaskStatus::Paused,
            ],
            TaskStatus::Terminating,
        )
    }
}
