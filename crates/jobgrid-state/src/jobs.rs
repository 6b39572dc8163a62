//! Jobs: submission, listing, the job status machine, leases, and the
//! fan-out of newly activated models into running jobs.
//!
//! ```text
//! scheduled | resuming         ──► running
//! running                      ──► pausing | completed
//! pausing                      ──► paused
//! pausing | paused             ──► resuming
//! running | pausing | paused   ──► terminating
//! terminating                  ──► terminated
//! any                          ──► error
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use redb::WriteTransaction;
use serde_json::json;
use tracing::{debug, info, warn};

use jobgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::id::new_object_id;
use crate::query::{ListQuery, Page, SortField, SortOrder, SortValue, ValueKind, paginate};
use crate::store::{Document, Leasable, StateStore, insert_new_doc, load_doc, store_doc};
use crate::tables::JOBS;
use crate::types::*;

const DEFAULT_MAX_TASKS: u64 = 100;

impl Document for Job {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = JOBS;
    const KIND: &'static str = "job";

    fn key(&self) -> &str {
        &self.id
    }

    fn refresh(&mut self, now: u64) {
        Job::refresh(self, now);
    }
}

impl Leasable for Job {
    fn holder(&self) -> Option<&str> {
        self.process.as_deref()
    }

    fn set_holder(&mut self, process: Option<String>) {
        self.process = process;
    }

    fn releasable_on_death(&self) -> bool {
        self.status != JobStatus::Error
    }
}

// ── Status machine ─────────────────────────────────────────────────

impl JobStatus {
    /// Whether a job may move from `self` to `target`. Staying put is
    /// always allowed and has no effect.
    pub fn can_become(self, target: JobStatus) -> bool {
        use JobStatus::*;
        self == target
            || matches!(
                (self, target),
                (_, Error)
                    | (Scheduled | Resuming, Running)
                    | (Running, Pausing)
                    | (Pausing, Paused)
                    | (Pausing | Paused, Resuming)
                    | (Running, Completed)
                    | (Running | Pausing | Paused, Terminating)
                    | (Terminating, Terminated)
            )
    }
}

impl Job {
    /// Move to `target`, stamping the interval fields the transition owns.
    pub fn apply_status(&mut self, target: JobStatus, now: u64) -> StateResult<()> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_become(target) {
            return Err(StateError::BadInput(format!(
                "job {} cannot go from {} to {}",
                self.id, self.status, target
            )));
        }

        if self.status == JobStatus::Paused {
            if let Some(start) = self.pause_start_time.take() {
                self.prev_pause_duration = self
                    .prev_pause_duration
                    .saturating_add(now.saturating_sub(start));
            }
        }

        match target {
            JobStatus::Running => {
                self.running_time.start.get_or_insert(now);
            }
            JobStatus::Paused => self.pause_start_time = Some(now),
            JobStatus::Completed | JobStatus::Terminated | JobStatus::Error => {
                self.running_time.end.get_or_insert(now);
            }
            _ => {}
        }

        self.status = target;
        self.refresh(now);
        Ok(())
    }
}

// ── Filters and sorting ────────────────────────────────────────────

/// Predicate over jobs. All filters in a list must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum JobFilter {
    Id(String),
    User(String),
    Dataset(String),
    Objective(String),
    Status(JobStatus),
    AcceptNewModels(bool),
    /// Job lists this model.
    Model(String),
    /// Job lists this alternative objective.
    AltObjective(String),
    Process(String),
}

impl JobFilter {
    /// Build a filter from its query-string form.
    pub fn parse(key: &str, value: &str) -> StateResult<Self> {
        Ok(match key {
            "id" => JobFilter::Id(value.to_string()),
            "user" => JobFilter::User(value.to_string()),
            "dataset" => JobFilter::Dataset(value.to_string()),
            "objective" => JobFilter::Objective(value.to_string()),
            "status" => JobFilter::Status(value.parse()?),
            "accept-new-models" => JobFilter::AcceptNewModels(value.parse().map_err(|_| {
                StateError::BadInput(format!("invalid accept-new-models {value:?}"))
            })?),
            "model" => JobFilter::Model(value.to_string()),
            "alt-objective" => JobFilter::AltObjective(value.to_string()),
            "process" => JobFilter::Process(value.to_string()),
            other => {
                return Err(StateError::BadInput(format!(
                    "unsupported job filter {other:?}"
                )));
            }
        })
    }

    pub fn matches(&self, job: &Job) -> bool {
        match self {
            JobFilter::Id(id) => &job.id == id,
            JobFilter::User(user) => &job.user == user,
            JobFilter::Dataset(dataset) => &job.dataset == dataset,
            JobFilter::Objective(objective) => &job.objective == objective,
            JobFilter::Status(status) => job.status == *status,
            JobFilter::AcceptNewModels(accept) => job.accept_new_models == *accept,
            JobFilter::Model(model) => job.models.contains(model),
            JobFilter::AltObjective(alt) => job.alt_objectives.contains(alt),
            JobFilter::Process(process) => job.process.as_deref() == Some(process.as_str()),
        }
    }
}

fn matches_all(filters: &[JobFilter], job: &Job) -> bool {
    filters.iter().all(|f| f.matches(job))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSort {
    User,
    Dataset,
    Objective,
    CreationTime,
    RunningTimeStart,
    RunningTimeEnd,
    Status,
}

impl FromStr for JobSort {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        Ok(match s {
            "user" => JobSort::User,
            "dataset" => JobSort::Dataset,
            "objective" => JobSort::Objective,
            "creation-time" => JobSort::CreationTime,
            "running-time-start" => JobSort::RunningTimeStart,
            "running-time-end" => JobSort::RunningTimeEnd,
            "status" => JobSort::Status,
            other => {
                return Err(StateError::BadInput(format!(
                    "invalid job sort field {other:?}"
                )));
            }
        })
    }
}

impl SortField<Job> for JobSort {
    fn kind(&self) -> ValueKind {
        match self {
            JobSort::CreationTime | JobSort::RunningTimeStart | JobSort::RunningTimeEnd => {
                ValueKind::Int
            }
            _ => ValueKind::Text,
        }
    }

    fn value_of(&self, job: &Job) -> SortValue {
        match self {
            JobSort::User => SortValue::Text(job.user.clone()),
            JobSort::Dataset => SortValue::Text(job.dataset.clone()),
            JobSort::Objective => SortValue::Text(job.objective.clone()),
            JobSort::CreationTime => SortValue::Int(job.creation_time as i64),
            JobSort::RunningTimeStart => {
                SortValue::Int(job.running_time.start.unwrap_or(0) as i64)
            }
            JobSort::RunningTimeEnd => SortValue::Int(job.running_time.end.unwrap_or(0) as i64),
            JobSort::Status => SortValue::Text(job.status.to_string()),
        }
    }
}

// ── Inputs ─────────────────────────────────────────────────────────

/// A job submission. The submitting caller becomes the owner.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub dataset: String,
    pub models: Vec<String>,
    pub config_overrides: BTreeMap<String, String>,
    pub accept_new_models: bool,
    pub objective: String,
    pub alt_objectives: Vec<String>,
    /// Zero selects the default of 100.
    pub max_tasks: u64,
}

/// Field-level job update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub models: Option<Vec<String>>,
    pub config_overrides: Option<BTreeMap<String, String>>,
    pub accept_new_models: Option<bool>,
    pub max_tasks: Option<u64>,
    pub status: Option<JobStatus>,
    pub status_message: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Outcome of appending a model to every job that can use it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelFanOut {
    pub model: String,
    pub updated: Vec<JobId>,
    /// Jobs whose update failed and should be retried individually.
    pub failed: Vec<JobId>,
}

// ── Validation helpers ─────────────────────────────────────────────

fn require_module(
    txn: &WriteTransaction,
    id: &str,
    kind: ModuleKind,
) -> StateResult<Module> {
    let module: Module = load_doc(txn, id)?
        .ok_or_else(|| StateError::BadInput(format!("{kind} {id} does not exist")))?;
    if module.kind != kind {
        return Err(StateError::BadInput(format!(
            "module {id} is a {}, not a {kind}",
            module.kind
        )));
    }
    if module.status != ModuleStatus::Active {
        return Err(StateError::BadInput(format!(
            "{kind} {id} is {}, not active",
            module.status
        )));
    }
    Ok(module)
}

/// Derive a job's aggregate configuration space from its models. A
/// caller-supplied override replaces the module's own definition.
fn build_config_space(
    txn: &WriteTransaction,
    job_id: &str,
    models: &[String],
    overrides: &BTreeMap<String, String>,
) -> StateResult<String> {
    if models.is_empty() {
        return Err(StateError::BadInput("a job needs at least one model".to_string()));
    }
    let mut choices = Vec::with_capacity(models.len());
    for model_id in models {
        let module = require_module(txn, model_id, ModuleKind::Model)?;
        let definition = overrides.get(model_id).unwrap_or(&module.config_space);
        let config: serde_json::Value = serde_json::from_str(definition).map_err(|e| {
            StateError::BadInput(format!("config space of model {model_id}: {e}"))
        })?;
        choices.push(json!({ "id": model_id, "config": config }));
    }
    let space = json!({ "id": job_id, "model": { ".choice": choices } });
    serde_json::to_string(&space).map_err(|e| StateError::Serialize(e.to_string()))
}

/// A model can train on a validated dataset with identical schemas.
fn schemas_fit(dataset: &Dataset, model: &Module) -> bool {
    dataset.status == DatasetStatus::Validated
        && dataset.schema_in == model.schema_in
        && dataset.schema_out == model.schema_out
}

/// Whether `job` should receive newly activated `model`.
fn wants_model(job: &Job, model: &str, datasets: &BTreeSet<String>) -> bool {
    job.status.is_open()
        && job.accept_new_models
        && datasets.contains(&job.dataset)
        && !job.models.iter().any(|m| m == model)
}

// ── Store operations ───────────────────────────────────────────────

impl StateStore {
    /// Submit a job. It starts out running.
    pub fn create_job(&self, caller: &Caller, new: NewJob) -> StateResult<Job> {
        let id = new_object_id()?;
        let now = epoch_millis();
        let mut job = self.write(|txn| {
            let dataset: Dataset = load_doc(txn, &new.dataset)?.ok_or_else(|| {
                StateError::BadInput(format!("dataset {} does not exist", new.dataset))
            })?;
            if dataset.status != DatasetStatus::Validated {
                return Err(StateError::BadInput(format!(
                    "dataset {} is {}, not validated",
                    dataset.id, dataset.status
                )));
            }
            require_module(txn, &new.objective, ModuleKind::Objective)?;
            for alt in &new.alt_objectives {
                require_module(txn, alt, ModuleKind::Objective)?;
            }
            let config_space = build_config_space(txn, &id, &new.models, &new.config_overrides)?;

            let job = Job {
                id: id.clone(),
                user: caller.user.clone(),
                dataset: new.dataset,
                models: new.models,
                config_space,
                config_overrides: new.config_overrides,
                accept_new_models: new.accept_new_models,
                objective: new.objective,
                alt_objectives: new.alt_objectives,
                max_tasks: if new.max_tasks == 0 {
                    DEFAULT_MAX_TASKS
                } else {
                    new.max_tasks
                },
                creation_time: now,
                running_time: TimeInterval {
                    start: Some(now),
                    end: None,
                },
                running_duration: 0,
                pause_start_time: None,
                pause_duration: 0,
                prev_pause_duration: 0,
                status: JobStatus::Running,
                status_message: String::new(),
                process: None,
            };
            insert_new_doc(txn, &job)?;
            Ok(job)
        })?;
        job.refresh(now);
        info!(id = %job.id, user = %job.user, models = job.models.len(), "job created");
        Ok(job)
    }

    pub fn get_job(&self, caller: &Caller, id: &str) -> StateResult<Job> {
        match self.fetch::<Job>(id)? {
            Some(job) if caller.can_see(&job.user) => Ok(job),
            _ => Err(StateError::NotFound(format!("job {id}"))),
        }
    }

    pub fn list_jobs(
        &self,
        caller: &Caller,
        filters: &[JobFilter],
        query: &ListQuery<JobSort>,
    ) -> StateResult<Page<Job>> {
        let docs = self.scan(|j: &Job| caller.can_see(&j.user) && matches_all(filters, j))?;
        paginate(docs, query)
    }

    pub fn count_jobs(&self, caller: &Caller, filters: &[JobFilter]) -> StateResult<usize> {
        self.count(|j: &Job| caller.can_see(&j.user) && matches_all(filters, j))
    }

    /// Apply a field-level update. Either every field is applied or none is.
    pub fn update_job(&self, caller: &Caller, id: &str, update: JobUpdate) -> StateResult<Job> {
        let now = epoch_millis();
        let job = self.modify(id, |txn, job: &mut Job| {
            caller.authorize(Job::KIND, &job.id, &job.user)?;

            if update.models.is_some() || update.config_overrides.is_some() {
                if let Some(models) = &update.models {
                    job.models = models.clone();
                }
                if let Some(overrides) = &update.config_overrides {
                    job.config_overrides = overrides.clone();
                }
                job.config_space =
                    build_config_space(txn, &job.id, &job.models, &job.config_overrides)?;
            }
            if let Some(accept) = update.accept_new_models {
                job.accept_new_models = accept;
            }
            if let Some(max_tasks) = update.max_tasks {
                job.max_tasks = max_tasks;
            }
            if let Some(message) = &update.status_message {
                job.status_message = message.clone();
            }
            if let Some(status) = update.status {
                job.apply_status(status, now)?;
            }
            Ok(())
        })?;
        debug!(%id, status = %job.status, "job updated");
        Ok(job)
    }

    /// Lease the first unleased job matching `filters`, regardless of owner.
    pub fn lease_job(
        &self,
        filters: &[JobFilter],
        process_id: &str,
        sort: Option<JobSort>,
        order: SortOrder,
    ) -> StateResult<Option<Job>> {
        self.lease(|j: &Job| matches_all(filters, j), sort, order, process_id)
    }

    pub fn release_job(&self, id: &str, process_id: &str) -> StateResult<()> {
        self.release::<Job>(id, process_id)
    }

    /// Ids of jobs that should receive `model_id` now that it is active:
    /// open jobs accepting new models on a validated dataset whose schemas
    /// match the model's, which do not list the model yet.
    pub fn applicable_jobs_for_model(&self, model_id: &str) -> StateResult<Vec<JobId>> {
        let module = self.get_module(model_id)?;
        if module.kind != ModuleKind::Model || module.status != ModuleStatus::Active {
            return Err(StateError::BadInput(format!(
                "module {model_id} is not an active model"
            )));
        }
        let datasets: BTreeSet<String> = self
            .scan(|d: &Dataset| schemas_fit(d, &module))?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let jobs = self.scan(|j: &Job| wants_model(j, model_id, &datasets))?;
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    /// Append `model_id` to one job if it still qualifies. Returns whether
    /// the job changed; re-applying is harmless.
    pub fn append_model_to_job(&self, job_id: &str, model_id: &str) -> StateResult<bool> {
        let appended = self.write(|txn| {
            let Some(mut job) = load_doc::<Job>(txn, job_id)? else {
                return Err(StateError::NotFound(format!("job {job_id}")));
            };
            let model = require_module(txn, model_id, ModuleKind::Model)?;
            let dataset: Option<Dataset> = load_doc(txn, &job.dataset)?;
            let datasets: BTreeSet<String> = dataset
                .filter(|d| schemas_fit(d, &model))
                .map(|d| d.id)
                .into_iter()
                .collect();
            if !wants_model(&job, model_id, &datasets) {
                return Ok(false);
            }
            job.models.push(model_id.to_string());
            job.config_space =
                build_config_space(txn, &job.id, &job.models, &job.config_overrides)?;
            store_doc(txn, &job)?;
            Ok(true)
        })?;
        if appended {
            debug!(job = %job_id, model = %model_id, "model appended to job");
        }
        Ok(appended)
    }

    /// Append a newly activated model to every job that can use it. Each
    /// job is updated in its own transaction; failures are reported rather
    /// than aborting the fan-out.
    pub fn add_model_to_applicable_jobs(&self, model_id: &str) -> StateResult<ModelFanOut> {
        let mut report = ModelFanOut {
            model: model_id.to_string(),
            ..ModelFanOut::default()
        };
        for job_id in self.applicable_jobs_for_model(model_id)? {
            match self.append_model_to_job(&job_id, model_id) {
                Ok(true) => report.updated.push(job_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(job = %job_id, model = %model_id, error = %e, "model fan-out failed");
                    report.failed.push(job_id);
                }
            }
        }
        info!(
            model = %model_id,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "model added to applicable jobs"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn alice() -> Caller {
        Caller::user("alice")
    }

    /// Store a copy of `job` with its status forced, bypassing the machine.
    fn force_status(store: &StateStore, job: &Job, status: JobStatus) -> Job {
        let mut forced = job.clone();
        forced.status = status;
        store.put(&forced).unwrap();
        forced
    }

    // ── Creation ───────────────────────────────────────────────────

    #[test]
    fn create_starts_running_with_config_space() {
        let store = seeded_store();
        let job = store.create_job(&alice(), new_job(&["m1", "m2"])).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.user, "alice");
        assert_eq!(job.max_tasks, 100);
        assert_eq!(job.running_time.start, Some(job.creation_time));
        assert!(job.running_time.end.is_none());
        assert!(job.process.is_none());

        let space: serde_json::Value = serde_json::from_str(&job.config_space).unwrap();
        assert_eq!(space["id"], job.id.as_str());
        let choices = space["model"][".choice"].as_array().unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0]["id"], "m1");
        assert_eq!(choices[1]["config"]["m2-depth"][".choice"][2], 3);
    }

    #[test]
    fn create_validates_references() {
        let store = seeded_store();
        store
            .put_dataset(&dataset("raw", SCHEMA_IN, DatasetStatus::Unpacked))
            .unwrap();
        store
            .put_module(&module("m3", ModuleKind::Model, ModuleStatus::Created))
            .unwrap();

        let cases = [
            NewJob { dataset: "missing".into(), ..new_job(&["m1"]) },
            NewJob { dataset: "raw".into(), ..new_job(&["m1"]) },
            new_job(&[]),
            new_job(&["nope"]),
            new_job(&["m3"]),
            new_job(&["accuracy"]),
            NewJob { objective: "m1".into(), ..new_job(&["m1"]) },
            NewJob { alt_objectives: vec!["ghost".into()], ..new_job(&["m1"]) },
        ];
        for new in cases {
            let err = store.create_job(&alice(), new.clone()).unwrap_err();
            assert!(matches!(err, StateError::BadInput(_)), "{new:?}: {err}");
        }
        assert_eq!(store.count_jobs(&Caller::root(), &[]).unwrap(), 0);
    }

    #[test]
    fn config_override_replaces_module_definition() {
        let store = seeded_store();
        let mut new = new_job(&["m1"]);
        new.config_overrides
            .insert("m1".into(), r#"{"m1-depth":{".choice":[7]}}"#.into());
        let job = store.create_job(&alice(), new).unwrap();
        let space: serde_json::Value = serde_json::from_str(&job.config_space).unwrap();
        assert_eq!(space["model"][".choice"][0]["config"]["m1-depth"][".choice"][0], 7);
    }

    // ── Status machine ─────────────────────────────────────────────

    #[test]
    fn transition_table() {
        use JobStatus::*;
        let legal = [
            (Scheduled, Running),
            (Resuming, Running),
            (Running, Pausing),
            (Pausing, Paused),
            (Pausing, Resuming),
            (Paused, Resuming),
            (Running, Completed),
            (Running, Terminating),
            (Pausing, Terminating),
            (Paused, Terminating),
            (Terminating, Terminated),
        ];
        for &from in JobStatus::ALL {
            for &to in JobStatus::ALL {
                let expected = from == to || to == Error || legal.contains(&(from, to));
                assert_eq!(from.can_become(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn illegal_transition_leaves_job_untouched() {
        let store = seeded_store();
        let job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        let stored = force_status(&store, &job, JobStatus::Completed);

        let err = store
            .update_job(
                &alice(),
                &job.id,
                JobUpdate {
                    status: Some(JobStatus::Running),
                    status_message: Some("again".into()),
                    max_tasks: Some(5),
                    ..JobUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::BadInput(_)));

        let after = store.get_job(&alice(), &job.id).unwrap();
        assert_eq!(after.status, stored.status);
        assert_eq!(after.status_message, "");
        assert_eq!(after.max_tasks, 100);
    }

    #[test]
    fn same_status_is_a_no_op() {
        let store = seeded_store();
        let job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        let again = store
            .update_job(&alice(), &job.id, JobUpdate::status(JobStatus::Running))
            .unwrap();
        assert_eq!(again.running_time, job.running_time);
    }

    #[test]
    fn pause_resume_folds_pause_time() {
        let mut job = seeded_job();
        job.apply_status(JobStatus::Pausing, 2_000).unwrap();
        job.apply_status(JobStatus::Paused, 3_000).unwrap();
        assert_eq!(job.pause_start_time, Some(3_000));

        job.refresh(4_000);
        assert_eq!(job.pause_duration, 1_000);
        assert_eq!(job.running_duration, 2_000);

        job.apply_status(JobStatus::Resuming, 5_000).unwrap();
        assert_eq!(job.pause_start_time, None);
        assert_eq!(job.prev_pause_duration, 2_000);
        job.apply_status(JobStatus::Running, 5_500).unwrap();
        assert_eq!(job.running_time.start, Some(1_000));

        job.apply_status(JobStatus::Completed, 9_000).unwrap();
        assert_eq!(job.running_time.end, Some(9_000));
        assert_eq!(job.pause_duration, 2_000);
        assert_eq!(job.running_duration, 6_000);
    }

    #[test]
    fn terminate_from_paused_closes_pause() {
        let mut job = seeded_job();
        job.apply_status(JobStatus::Pausing, 2_000).unwrap();
        job.apply_status(JobStatus::Paused, 2_000).unwrap();
        job.apply_status(JobStatus::Terminating, 2_500).unwrap();
        assert_eq!(job.prev_pause_duration, 500);
        assert!(job.running_time.end.is_none());
        job.apply_status(JobStatus::Terminated, 3_000).unwrap();
        assert_eq!(job.running_time.end, Some(3_000));
    }

    #[test]
    fn error_stamps_end_once() {
        let mut job = seeded_job();
        job.apply_status(JobStatus::Completed, 2_000).unwrap();
        job.apply_status(JobStatus::Error, 3_000).unwrap();
        assert_eq!(job.running_time.end, Some(2_000));
    }

    fn seeded_job() -> Job {
        Job {
            id: "j".into(),
            user: "alice".into(),
            dataset: "iris".into(),
            models: vec!["m1".into()],
            config_space: String::new(),
            config_overrides: BTreeMap::new(),
            accept_new_models: false,
            objective: "accuracy".into(),
            alt_objectives: Vec::new(),
            max_tasks: 10,
            creation_time: 1_000,
            running_time: TimeInterval {
                start: Some(1_000),
                end: None,
            },
            running_duration: 0,
            pause_start_time: None,
            pause_duration: 0,
            prev_pause_duration: 0,
            status: JobStatus::Running,
            status_message: String::new(),
            process: None,
        }
    }

    // ── Updates ────────────────────────────────────────────────────

    #[test]
    fn model_update_rebuilds_config_space() {
        let store = seeded_store();
        let job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        let updated = store
            .update_job(
                &alice(),
                &job.id,
                JobUpdate {
                    models: Some(vec!["m2".into()]),
                    ..JobUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.models, vec!["m2".to_string()]);
        assert!(updated.config_space.contains("m2-depth"));
        assert!(!updated.config_space.contains("m1-depth"));

        let err = store
            .update_job(
                &alice(),
                &job.id,
                JobUpdate {
                    models: Some(vec!["f1".into()]),
                    ..JobUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StateError::BadInput(_)));
    }

    // ── Access ─────────────────────────────────────────────────────

    #[test]
    fn callers_see_own_and_root_jobs() {
        let store = seeded_store();
        let mine = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        let shared = store.create_job(&Caller::root(), new_job(&["m1"])).unwrap();
        let theirs = store.create_job(&Caller::user("bob"), new_job(&["m1"])).unwrap();

        let page = store
            .list_jobs(&alice(), &[], &ListQuery::default())
            .unwrap();
        let mut ids: Vec<_> = page.items.iter().map(|j| j.id.clone()).collect();
        ids.sort();
        let mut expected = vec![mine.id.clone(), shared.id.clone()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(store.count_jobs(&Caller::root(), &[]).unwrap(), 3);

        assert!(store.get_job(&alice(), &theirs.id).unwrap_err().is_not_found());
        let err = store
            .update_job(&alice(), &theirs.id, JobUpdate::status(JobStatus::Pausing))
            .unwrap_err();
        assert!(err.is_not_found());
        let err = store
            .update_job(&alice(), &shared.id, JobUpdate::status(JobStatus::Pausing))
            .unwrap_err();
        assert!(matches!(err, StateError::Unauthorized(_)));
    }

    // ── Listing ────────────────────────────────────────────────────

    #[test]
    fn paging_by_creation_time() {
        let store = seeded_store();
        let mut ids = Vec::new();
        for created in [1_000u64, 2_000, 3_000] {
            let mut job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
            job.creation_time = created;
            store.put(&job).unwrap();
            ids.push(job.id);
        }

        let query = ListQuery::default()
            .limit(2)
            .sort_by(JobSort::CreationTime, SortOrder::Asc);
        let first = store.list_jobs(&alice(), &[], &query).unwrap();
        let got: Vec<_> = first.items.iter().map(|j| j.id.clone()).collect();
        assert_eq!(got, ids[..2].to_vec());
        assert_eq!(first.total_result_size, 3);
        assert_eq!(first.returned_result_size, 2);
        let cursor = first.next_page_cursor.clone().unwrap();

        let second = store
            .list_jobs(&alice(), &[], &query.clone().cursor(cursor))
            .unwrap();
        let got: Vec<_> = second.items.iter().map(|j| j.id.clone()).collect();
        assert_eq!(got, ids[2..].to_vec());
        assert!(second.next_page_cursor.is_none());
    }

    #[test]
    fn filters_parse_and_match() {
        let store = seeded_store();
        let a = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        store.create_job(&alice(), new_job(&["m2"])).unwrap();

        let filters = vec![
            JobFilter::parse("model", "m1").unwrap(),
            JobFilter::parse("status", "running").unwrap(),
            JobFilter::parse("accept-new-models", "true").unwrap(),
        ];
        let page = store
            .list_jobs(&alice(), &filters, &ListQuery::default())
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, a.id);

        assert!(JobFilter::parse("colour", "red").is_err());
        assert!(JobFilter::parse("accept-new-models", "maybe").is_err());
        assert!("mood".parse::<JobSort>().is_err());
    }

    // ── Leases ─────────────────────────────────────────────────────

    #[test]
    fn lease_and_release() {
        let store = seeded_store();
        let job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        force_status(&store, &job, JobStatus::Pausing);
        let pausing = [JobFilter::Status(JobStatus::Pausing)];

        let leased = store
            .lease_job(&pausing, "p1", None, SortOrder::Asc)
            .unwrap()
            .unwrap();
        assert_eq!(leased.process.as_deref(), Some("p1"));
        assert!(store.lease_job(&pausing, "p2", None, SortOrder::Asc).unwrap().is_none());

        assert!(store.release_job(&job.id, "p2").unwrap_err().is_not_found());
        let held = store.get_job(&Caller::root(), &job.id).unwrap();
        assert_eq!(held.process.as_deref(), Some("p1"));

        store.release_job(&job.id, "p1").unwrap();
        assert!(store.get_job(&Caller::root(), &job.id).unwrap().process.is_none());
        assert!(store.release_job(&job.id, "p1").unwrap_err().is_not_found());
    }

    #[test]
    fn lease_follows_sort_order() {
        let store = seeded_store();
        let mut ids = Vec::new();
        for created in [3_000u64, 1_000, 2_000] {
            let mut job = store.create_job(&alice(), new_job(&["m1"])).unwrap();
            job.creation_time = created;
            store.put(&job).unwrap();
            ids.push(job.id);
        }
        let first = store
            .lease_job(&[], "p1", Some(JobSort::CreationTime), SortOrder::Desc)
            .unwrap()
            .unwrap();
        assert_eq!(first.id, ids[0]);
        let second = store
            .lease_job(&[], "p1", Some(JobSort::CreationTime), SortOrder::Desc)
            .unwrap()
            .unwrap();
        assert_eq!(second.id, ids[2]);
    }

    #[test]
    fn concurrent_leases_hand_out_one_job() {
        let store = seeded_store();
        store.create_job(&alice(), new_job(&["m1"])).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .lease_job(&[], &format!("p{i}"), None, SortOrder::Asc)
                        .unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(winners, 1);
    }

    // ── Model fan-out ──────────────────────────────────────────────

    #[test]
    fn new_model_reaches_exactly_the_eligible_jobs() {
        let store = seeded_store();
        store
            .put_dataset(&dataset("images", "tensor[32,32]", DatasetStatus::Validated))
            .unwrap();

        let eligible_a = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        let eligible_b = store.create_job(&Caller::user("bob"), new_job(&["m1"])).unwrap();
        let paused = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        force_status(&store, &paused, JobStatus::Paused);

        let closed = store
            .create_job(&alice(), NewJob { accept_new_models: false, ..new_job(&["m1"]) })
            .unwrap();
        let finished = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        force_status(&store, &finished, JobStatus::Terminated);
        let has_it = store.create_job(&alice(), new_job(&["m1", "m2"])).unwrap();
        let mut elsewhere = store.create_job(&alice(), new_job(&["m1"])).unwrap();
        elsewhere.dataset = "images".into();
        store.put(&elsewhere).unwrap();

        let report = store.add_model_to_applicable_jobs("m2").unwrap();
        let mut updated = report.updated.clone();
        updated.sort();
        let mut expected = vec![eligible_a.id.clone(), eligible_b.id.clone(), paused.id.clone()];
        expected.sort();
        assert_eq!(updated, expected);
        assert!(report.failed.is_empty());

        for id in &expected {
            let job = store.get_job(&Caller::root(), id).unwrap();
            assert_eq!(job.models, vec!["m1".to_string(), "m2".to_string()]);
            assert!(job.config_space.contains("m2-depth"));
        }
        for id in [&closed.id, &finished.id, &elsewhere.id] {
            let job = store.get_job(&Caller::root(), id).unwrap();
            assert_eq!(job.models, vec!["m1".to_string()]);
        }
        let untouched = store.get_job(&Caller::root(), &has_it.id).unwrap();
        assert_eq!(untouched.models.len(), 2);

        // Re-running the fan-out changes nothing.
        let again = store.add_model_to_applicable_jobs("m2").unwrap();
        assert!(again.updated.is_empty());
    }

    #[test]
    fn fan_out_rejects_inactive_models() {
        let store = seeded_store();
        store
            .put_module(&module("m9", ModuleKind::Model, ModuleStatus::Archived))
            .unwrap();
        assert!(matches!(
            store.add_model_to_applicable_jobs("m9"),
            Err(StateError::BadInput(_))
        ));
        assert!(store.add_model_to_applicable_jobs("ghost").unwrap_err().is_not_found());
    }
}
