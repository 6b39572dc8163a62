//! Domain types for the jobgrid state store.
//!
//! These types represent the persisted state of processes, jobs, tasks,
//! datasets and modules. All types are serializable to/from JSON for
//! storage in redb tables. Derived durations are stored for readers but
//! always recomputed from the interval timestamps when a document is loaded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Owner identity of documents created by the system itself. Documents it
/// owns are visible to every caller.
pub const ROOT_USER: &str = "root";

/// Unique identifier for a registered process.
pub type ProcessId = String;

/// Unique identifier for a job.
pub type JobId = String;

/// Declares a closed string-valued enum with its wire names.
macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident ($label:literal) { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = StateError;

            fn from_str(s: &str) -> Result<Self, StateError> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StateError::BadInput(format!("invalid {} {other:?}", $label))),
                }
            }
        }
    };
}

// ── Caller ─────────────────────────────────────────────────────────

/// Identity on whose behalf a store call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
}

impl Caller {
    pub fn root() -> Self {
        Self {
            user: ROOT_USER.to_string(),
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self { user: name.into() }
    }

    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }

    /// Non-root callers see their own documents and those owned by root.
    pub fn can_see(&self, owner: &str) -> bool {
        self.is_root() || owner == self.user || owner == ROOT_USER
    }

    pub fn can_modify(&self, owner: &str) -> bool {
        self.is_root() || owner == self.user
    }

    /// Gate a modification of the `kind` document `id` owned by `owner`.
    /// Documents the caller cannot see are reported as missing.
    pub(crate) fn authorize(&self, kind: &str, id: &str, owner: &str) -> Result<(), StateError> {
        if !self.can_see(owner) {
            return Err(StateError::NotFound(format!("{kind} {id}")));
        }
        if !self.can_modify(owner) {
            return Err(StateError::Unauthorized(format!(
                "user {} cannot modify {kind} {id}",
                self.user
            )));
        }
        Ok(())
    }
}

// ── Intervals ──────────────────────────────────────────────────────

/// Start and end of an interval in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl TimeInterval {
    /// Length of a closed interval; zero while either bound is missing.
    pub fn closed_length(&self) -> u64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => 0,
        }
    }
}

// ── Process ────────────────────────────────────────────────────────

named_enum! {
    /// Role a process plays in the fleet.
    ProcessKind ("process type") {
        Controller => "controller",
        Worker => "worker",
        Scheduler => "scheduler",
    }
}

named_enum! {
    ProcessStatus ("process status") {
        Idle => "idle",
        Working => "working",
        Terminated => "terminated",
    }
}

/// A registered process. Never deleted; terminated processes stay as history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Process {
    pub id: ProcessId,
    /// Operating system pid.
    pub process_id: u32,
    pub host_id: String,
    pub host_address: String,
    pub start_time: u64,
    pub last_keepalive: u64,
    #[serde(rename = "type")]
    pub kind: ProcessKind,
    pub resource: String,
    pub status: ProcessStatus,
    pub running_ordinal: u32,
    /// Store-wide sequence number stamped whenever `running_ordinal` is
    /// written. The earliest claim of an ordinal owns it.
    pub ordinal_claim: u64,
}

impl Process {
    pub fn is_live(&self) -> bool {
        self.status != ProcessStatus::Terminated
    }
}

// ── Job ────────────────────────────────────────────────────────────

named_enum! {
    JobStatus ("job status") {
        Scheduled => "scheduled",
        Running => "running",
        Pausing => "pausing",
        Paused => "paused",
        Resuming => "resuming",
        Completed => "completed",
        Terminating => "terminating",
        Terminated => "terminated",
        Error => "error",
    }
}

impl JobStatus {
    /// Statuses in which a job still accepts newly activated models.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            JobStatus::Scheduled
                | JobStatus::Running
                | JobStatus::Pausing
                | JobStatus::Paused
                | JobStatus::Resuming
        )
    }
}

/// A model-search job submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    pub id: JobId,
    pub user: String,
    pub dataset: String,
    pub models: Vec<String>,
    /// Aggregate configuration space derived from `models`.
    pub config_space: String,
    /// Per-model configuration definitions that replace the module's own.
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
    pub accept_new_models: bool,
    pub objective: String,
    pub alt_objectives: Vec<String>,
    pub max_tasks: u64,
    pub creation_time: u64,
    pub running_time: TimeInterval,
    pub running_duration: u64,
    pub pause_start_time: Option<u64>,
    pub pause_duration: u64,
    pub prev_pause_duration: u64,
    pub status: JobStatus,
    pub status_message: String,
    pub process: Option<ProcessId>,
}

impl Job {
    /// Recompute derived durations as of `now`.
    pub fn refresh(&mut self, now: u64) {
        let current_pause = match (self.status, self.pause_start_time) {
            (JobStatus::Paused, Some(start)) => now.saturating_sub(start),
            _ => 0,
        };
        self.pause_duration = self.prev_pause_duration.saturating_add(current_pause);
        self.running_duration = match self.running_time.start {
            Some(start) => self
                .running_time
                .end
                .unwrap_or(now)
                .saturating_sub(start)
                .saturating_sub(self.pause_duration),
            None => 0,
        };
    }
}

// ── Task ───────────────────────────────────────────────────────────

named_enum! {
    TaskStatus ("task status") {
        Scheduled => "scheduled",
        Running => "running",
        Pausing => "pausing",
        Paused => "paused",
        Completed => "completed",
        Terminating => "terminating",
        Terminated => "terminated",
        Canceled => "canceled",
        Error => "error",
    }
}

named_enum! {
    /// Execution phase of a task, orthogonal to its status.
    TaskStage ("task stage") {
        Begin => "begin",
        Training => "training",
        Predicting => "predicting",
        Evaluating => "evaluating",
        End => "end",
    }
}

impl TaskStage {
    /// Position in the stage pipeline; stages only move to a higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStage::Begin => 0,
            TaskStage::Training => 1,
            TaskStage::Predicting => 2,
            TaskStage::Evaluating => 3,
            TaskStage::End => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTimes {
    pub training: TimeInterval,
    pub predicting: TimeInterval,
    pub evaluating: TimeInterval,
}

impl StageTimes {
    /// Interval of a timed stage; `begin` and `end` have none.
    pub fn interval_mut(&mut self, stage: TaskStage) -> Option<&mut TimeInterval> {
        match stage {
            TaskStage::Training => Some(&mut self.training),
            TaskStage::Predicting => Some(&mut self.predicting),
            TaskStage::Evaluating => Some(&mut self.evaluating),
            TaskStage::Begin | TaskStage::End => None,
        }
    }
}

/// Milliseconds spent in each completed stage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDurations {
    pub training: u64,
    pub predicting: u64,
    pub evaluating: u64,
}

/// A unit of work: one model configuration trained and evaluated for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Task {
    /// `{job}/{sequence:010}`.
    pub id: String,
    pub job: JobId,
    pub process: Option<ProcessId>,
    pub user: String,
    pub dataset: String,
    pub model: String,
    pub objective: String,
    pub alt_objectives: Vec<String>,
    pub config: String,
    pub quality: f64,
    pub quality_train: f64,
    pub quality_expected: f64,
    pub alt_qualities: Vec<f64>,
    pub status: TaskStatus,
    pub status_message: String,
    pub stage: TaskStage,
    pub stage_times: StageTimes,
    pub stage_durations: StageDurations,
    pub creation_time: u64,
    pub running_duration: u64,
}

impl Task {
    pub fn refresh(&mut self) {
        self.stage_durations = StageDurations {
            training: self.stage_times.training.closed_length(),
            predicting: self.stage_times.predicting.closed_length(),
            evaluating: self.stage_times.evaluating.closed_length(),
        };
        self.running_duration = self.stage_durations.training
            + self.stage_durations.predicting
            + self.stage_durations.evaluating;
    }

    /// Sequence number encoded in the task id.
    pub fn sequence(&self) -> Option<u64> {
        self.id.rsplit_once('/').and_then(|(_, seq)| seq.parse().ok())
    }
}

/// Task id for the `sequence`-th task of `job`.
pub fn task_id(job: &str, sequence: u64) -> String {
    format!("{job}/{sequence:010}")
}

// ── Catalog ────────────────────────────────────────────────────────

named_enum! {
    DatasetStatus ("dataset status") {
        Created => "created",
        Transferred => "transferred",
        Unpacked => "unpacked",
        Validated => "validated",
        Archived => "archived",
        Error => "error",
    }
}

/// A dataset that jobs train on. Content validation happens elsewhere; the
/// store only tracks its schema and status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Dataset {
    pub id: String,
    pub user: String,
    pub schema_in: String,
    pub schema_out: String,
    pub status: DatasetStatus,
    pub process: Option<ProcessId>,
}

named_enum! {
    ModuleKind ("module type") {
        Model => "model",
        Objective => "objective",
        Optimizer => "optimizer",
    }
}

named_enum! {
    ModuleStatus ("module status") {
        Created => "created",
        Transferred => "transferred",
        Active => "active",
        Archived => "archived",
        Error => "error",
    }
}

/// A model, objective or optimizer module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Module {
    pub id: String,
    pub user: String,
    #[serde(rename = "type")]
    pub kind: ModuleKind,
    pub schema_in: String,
    pub schema_out: String,
    /// JSON configuration space definition of a model.
    pub config_space: String,
    pub status: ModuleStatus,
    pub process: Option<ProcessId>,
}
