//! Job status maintainer — drives jobs out of pausing, resuming and
//! terminating.
//!
//! Each pass leases at most one job per transitional status and settles it
//! in its own tokio task: the matching bulk change is applied to the job's
//! tasks, the job moves to its settled status, and the lease is released.
//! Every store call is retried until it goes through. A crash part-way
//! leaves the job in its transitional status with the lease cleared by the
//! reaper, and the next maintainer simply repeats the cascade.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use jobgrid_core::retry_sync;
use jobgrid_state::*;

const TRANSITIONAL: [JobStatus; 3] = [
    JobStatus::Pausing,
    JobStatus::Resuming,
    JobStatus::Terminating,
];

type TaskCascade = fn(&StateStore, &str) -> StateResult<usize>;

/// Where a transitional job ends up, and what happens to its tasks on the
/// way there.
fn settlement(status: JobStatus) -> Option<(JobStatus, TaskCascade)> {
    match status {
        JobStatus::Pausing => Some((JobStatus::Paused, StateStore::pause_running_tasks)),
        JobStatus::Resuming => Some((JobStatus::Running, StateStore::resume_paused_tasks)),
        JobStatus::Terminating => Some((JobStatus::Terminated, StateStore::terminate_running_tasks)),
        _ => None,
    }
}

#[derive(Clone)]
pub struct JobStatusMaintainer {
    state: StateStore,
    /// The process that holds the leases this maintainer takes.
    process_id: String,
    period: Duration,
    retry_initial_backoff: Duration,
}

impl JobStatusMaintainer {
    pub fn new(state: StateStore, process_id: impl Into<String>) -> Self {
        Self {
            state,
            process_id: process_id.into(),
            period: Duration::from_secs(1),
            retry_initial_backoff: Duration::from_secs(1),
        }
    }

    /// Set the interval between polls.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_retry_initial_backoff(mut self, initial: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self
    }

    /// Lease one job per transitional status and spawn its settlement.
    /// Returns the handles of the spawned settlements.
    pub fn poll_once(&self) -> Vec<JoinHandle<()>> {
        self.lease_transitional()
            .into_iter()
            .map(|job| {
                let maintainer = self.clone();
                tokio::spawn(async move { maintainer.settle(job).await })
            })
            .collect()
    }

    /// Poll on every period until `shutdown` flips, then wait for the
    /// settlements still in flight so their leases are returned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(process = %self.process_id, "job status maintainer started");
        let mut settlements = JoinSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    for job in self.lease_transitional() {
                        let maintainer = self.clone();
                        settlements.spawn(async move { maintainer.settle(job).await });
                    }
                }
                Some(done) = settlements.join_next(), if !settlements.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "job settlement did not finish");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(in_flight = settlements.len(), "job status maintainer shutting down");
                    break;
                }
            }
        }
        while let Some(done) = settlements.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "job settlement did not finish");
            }
        }
    }

    fn lease_transitional(&self) -> Vec<Job> {
        let mut leased = Vec::new();
        for status in TRANSITIONAL {
            let result = self.state.lease_job(
                &[JobFilter::Status(status)],
                &self.process_id,
                Some(JobSort::CreationTime),
                SortOrder::Asc,
            );
            match result {
                Ok(Some(job)) => leased.push(job),
                Ok(None) => {}
                Err(e) => warn!(%status, error = %e, "job lease failed"),
            }
        }
        leased
    }

    /// Settle a job this maintainer leased, then give the lease back. The
    /// lease is returned even when settling is abandoned, so the job stays
    /// available to whoever acts on it next.
    pub async fn settle(&self, job: Job) {
        if let Err(e) = self.drive(&job).await {
            error!(job = %job.id, status = %job.status, error = %e, "job settlement abandoned");
        }
        let released = retry_sync("release job", self.retry_initial_backoff, || {
            self.state.release_job(&job.id, &self.process_id)
        })
        .await;
        match released {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(job = %job.id, "job lease was already gone");
            }
            Err(e) => error!(job = %job.id, error = %e, "job lease release failed"),
        }
    }

    async fn drive(&self, job: &Job) -> StateResult<()> {
        let Some((settled, cascade)) = settlement(job.status) else {
            warn!(job = %job.id, status = %job.status, "leased job is not transitional");
            return Ok(());
        };
        let backoff = self.retry_initial_backoff;

        let moved = retry_sync("cascade job status to tasks", backoff, || {
            cascade(&self.state, &job.id)
        })
        .await?;
        retry_sync("settle job status", backoff, || {
            self.state
                .update_job(&Caller::root(), &job.id, JobUpdate::status(settled))
        })
        .await?;
        info!(job = %job.id, from = %job.status, to = %settled, tasks = moved, "job settled");
        Ok(())
    }
}
