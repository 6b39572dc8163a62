//! Fan-out of a newly activated model into the jobs that can use it.

use std::time::Duration;

use tracing::{error, info};

use jobgrid_core::retry_sync;
use jobgrid_state::{ModelFanOut, StateResult, StateStore};

/// Append `model_id` to every applicable job. Jobs whose append failed in
/// the bulk pass are retried one by one under the same backoff; a job is
/// only reported as failed when its store rejects the append outright.
pub async fn fan_out_model(
    state: &StateStore,
    model_id: &str,
    initial_backoff: Duration,
) -> StateResult<ModelFanOut> {
    let mut report = retry_sync("add model to applicable jobs", initial_backoff, || {
        state.add_model_to_applicable_jobs(model_id)
    })
    .await?;

    for job_id in std::mem::take(&mut report.failed) {
        let appended = retry_sync("append model to job", initial_backoff, || {
            state.append_model_to_job(&job_id, model_id)
        })
        .await;
        match appended {
            Ok(true) => report.updated.push(job_id),
            Ok(false) => {}
            Err(e) => {
                error!(job = %job_id, model = %model_id, error = %e, "model fan-out abandoned for job");
                report.failed.push(job_id);
            }
        }
    }
    info!(model = %model_id, jobs = report.updated.len(), "model fanned out");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use jobgrid_state::*;

    #[tokio::test]
    async fn new_model_joins_open_jobs() {
        let state = seeded_state();
        let open = submit(&state);
        let closed = submit(&state);
        set_job_status(&state, &closed, JobStatus::Terminating);
        set_job_status(&state, &closed, JobStatus::Terminated);
        state.put_module(&model("m2", ModuleStatus::Active)).unwrap();

        let report = fan_out_model(&state, "m2", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(report.updated, vec![open.id.clone()]);
        assert!(report.failed.is_empty());

        let open = state.get_job(&Caller::root(), &open.id).unwrap();
        assert_eq!(open.models, vec!["m1".to_string(), "m2".to_string()]);
        let closed = state.get_job(&Caller::root(), &closed.id).unwrap();
        assert_eq!(closed.models, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn inactive_model_is_rejected() {
        let state = seeded_state();
        submit(&state);
        state.put_module(&model("m2", ModuleStatus::Created)).unwrap();
        let err = fan_out_model(&state, "m2", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::BadInput(_)));
    }
}
