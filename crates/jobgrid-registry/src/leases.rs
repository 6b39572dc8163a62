//! Release of every lease a dead or departing process holds.

use std::time::Duration;

use tracing::info;

use jobgrid_core::retry_sync;
use jobgrid_state::{Dataset, Job, Leasable, Module, StateResult, StateStore, Task};

/// How many leases were cleared per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedLeases {
    pub datasets: usize,
    pub modules: usize,
    pub jobs: usize,
    pub tasks: usize,
}

impl ReleasedLeases {
    pub fn total(&self) -> usize {
        self.datasets + self.modules + self.jobs + self.tasks
    }
}

/// Clear the leases `process_id` holds in every leasable collection.
/// Documents in an error state keep theirs. Each collection is retried on
/// its own until the store accepts the update, and re-running the whole
/// cascade is harmless.
pub async fn release_all_leases(
    state: &StateStore,
    process_id: &str,
    initial_backoff: Duration,
) -> StateResult<ReleasedLeases> {
    let released = ReleasedLeases {
        datasets: release_kind::<Dataset>(state, process_id, initial_backoff).await?,
        modules: release_kind::<Module>(state, process_id, initial_backoff).await?,
        jobs: release_kind::<Job>(state, process_id, initial_backoff).await?,
        tasks: release_kind::<Task>(state, process_id, initial_backoff).await?,
    };
    if released.total() > 0 {
        info!(
            process = %process_id,
            datasets = released.datasets,
            modules = released.modules,
            jobs = released.jobs,
            tasks = released.tasks,
            "leases released"
        );
    }
    Ok(released)
}

async fn release_kind<D: Leasable>(
    state: &StateStore,
    process_id: &str,
    initial_backoff: Duration,
) -> StateResult<usize> {
    let what = format!("release {} leases", D::KIND);
    retry_sync(&what, initial_backoff, || {
        state.release_leases_held_by::<D>(process_id)
    })
    .await
}
