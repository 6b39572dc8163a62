//! Fixtures shared by the maintainer tests.

use jobgrid_state::*;

const SCHEMA_IN: &str = "tensor[4]";
const SCHEMA_OUT: &str = "category[3]";

pub fn model(id: &str, status: ModuleStatus) -> Module {
    Module {
        id: id.to_string(),
        user: ROOT_USER.to_string(),
        kind: ModuleKind::Model,
        schema_in: SCHEMA_IN.to_string(),
        schema_out: SCHEMA_OUT.to_string(),
        config_space: format!(r#"{{"{id}-depth":{{".choice":[1,2]}}}}"#),
        status,
        process: None,
    }
}

/// In-memory store with a validated dataset `iris`, an active model `m1`
/// and an active objective `accuracy`.
pub fn seeded_state() -> StateStore {
    let state = StateStore::open_in_memory().unwrap();
    state
        .put_dataset(&Dataset {
            id: "iris".to_string(),
            user: ROOT_USER.to_string(),
            schema_in: SCHEMA_IN.to_string(),
            schema_out: SCHEMA_OUT.to_string(),
            status: DatasetStatus::Validated,
            process: None,
        })
        .unwrap();
    state.put_module(&model("m1", ModuleStatus::Active)).unwrap();
    let mut objective = model("accuracy", ModuleStatus::Active);
    objective.kind = ModuleKind::Objective;
    state.put_module(&objective).unwrap();
    state
}

pub fn submit(state: &StateStore) -> Job {
    state
        .create_job(
            &Caller::user("alice"),
            NewJob {
                dataset: "iris".to_string(),
                models: vec!["m1".to_string()],
                accept_new_models: true,
                objective: "accuracy".to_string(),
                ..NewJob::default()
            },
        )
        .unwrap()
}

pub fn set_job_status(state: &StateStore, job: &Job, status: JobStatus) {
    state
        .update_job(&Caller::root(), &job.id, JobUpdate::status(status))
        .unwrap();
}

/// Create a task for `job` and walk it to `status`. Returns the task id.
pub fn spawn_task(state: &StateStore, job: &Job, status: TaskStatus) -> String {
    let task = state
        .create_task(
            &Caller::root(),
            NewTask {
                job: job.id.clone(),
                model: "m1".to_string(),
                config: r#"{"m1-depth":1}"#.to_string(),
            },
        )
        .unwrap();
    let path: &[TaskStatus] = match status {
        TaskStatus::Scheduled => &[],
        TaskStatus::Running => &[TaskStatus::Running],
        TaskStatus::Pausing => &[TaskStatus::Running, TaskStatus::Pausing],
        TaskStatus::Completed => &[TaskStatus::Running, TaskStatus::Completed],
        TaskStatus::Terminating => &[TaskStatus::Running, TaskStatus::Terminating],
        other => panic!("no fixture path to {other}"),
    };
    for &step in path {
        state
            .update_task(&Caller::root(), &task.id, TaskUpdate::status(step))
            .unwrap();
    }
    task.id
}

pub fn task_status(state: &StateStore, id: &str) -> TaskStatus {
    state.get_task(&Caller::root(), id).unwrap().status
}
