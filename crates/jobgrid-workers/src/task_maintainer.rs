//! Task status maintainer — settles tasks left in pausing or terminating.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use jobgrid_core::retry_sync;
use jobgrid_state::*;

const TRANSITIONAL: [TaskStatus; 2] = [TaskStatus::Pausing, TaskStatus::Terminating];

fn settled_status(status: TaskStatus) -> Option<TaskStatus> {
    match status {
        TaskStatus::Pausing => Some(TaskStatus::Paused),
        TaskStatus::Terminating => Some(TaskStatus::Terminated),
        _ => None,
    }
}

#[derive(Clone)]
pub struct TaskStatusMaintainer {
    state: StateStore,
    process_id: String,
    period: Duration,
    retry_initial_backoff: Duration,
}

impl TaskStatusMaintainer {
    pub fn new(state: StateStore, process_id: impl Into<String>) -> Self {
        Self {
            state,
            process_id: process_id.into(),
            period: Duration::from_secs(1),
            retry_initial_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_retry_initial_backoff(mut self, initial: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self
    }

    /// Lease one task per transitional status and spawn its settlement.
    /// Returns the handles of the spawned settlements.
    pub fn poll_once(&self) -> Vec<JoinHandle<()>> {
        self.lease_transitional()
            .into_iter()
            .map(|task| {
                let maintainer = self.clone();
                tokio::spawn(async move { maintainer.settle(task).await })
            })
            .collect()
    }

    /// Poll on every period until `shutdown` flips, then wait for the
    /// settlements still in flight so their leases are returned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(process = %self.process_id, "task status maintainer started");
        let mut settlements = JoinSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    for task in self.lease_transitional() {
                        let maintainer = self.clone();
                        settlements.spawn(async move { maintainer.settle(task).await });
                    }
                }
                Some(done) = settlements.join_next(), if !settlements.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "task settlement did not finish");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(in_flight = settlements.len(), "task status maintainer shutting down");
                    break;
                }
            }
        }
        while let Some(done) = settlements.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "task settlement did not finish");
            }
        }
    }

    fn lease_transitional(&self) -> Vec<Task> {
        let mut leased = Vec::new();
        for status in TRANSITIONAL {
            let result = self.state.lease_task(
                &[TaskFilter::Status(status)],
                &self.process_id,
                Some(TaskSort::CreationTime),
                SortOrder::Asc,
            );
            match result {
                Ok(Some(task)) => leased.push(task),
                Ok(None) => {}
                Err(e) => warn!(%status, error = %e, "task lease failed"),
            }
        }
        leased
    }

    /// Move a leased task to its settled status and release it.
    pub async fn settle(&self, task: Task) {
        let backoff = self.retry_initial_backoff;
        if let Some(settled) = settled_status(task.status) {
            let updated = retry_sync("settle task status", backoff, || {
                self.state
                    .update_task(&Caller::root(), &task.id, TaskUpdate::status(settled))
            })
            .await;
            match updated {
                Ok(_) => info!(task = %task.id, from = %task.status, to = %settled, "task settled"),
                Err(e) => error!(task = %task.id, error = %e, "task settlement abandoned"),
            }
        } else {
            warn!(task = %task.id, status = %task.status, "leased task is not transitional");
        }

        let released = retry_sync("release task", backoff, || {
            self.state.release_task(&task.id, &self.process_id)
        })
        .await;
        if let Err(e) = released {
            error!(task = %task.id, error = %e, "task lease release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn maintainer(state: &StateStore) -> TaskStatusMaintainer {
        TaskStatusMaintainer::new(state.clone(), "controller-1")
            .with_retry_initial_backoff(Duration::from_millis(1))
    }

    async fn poll(m: &TaskStatusMaintainer) {
        for handle in m.poll_once() {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn pausing_and_terminating_tasks_settle() {
        let state = seeded_state();
        let job = submit(&state);
        let pausing = spawn_task(&state, &job, TaskStatus::Pausing);
        let terminating = spawn_task(&state, &job, TaskStatus::Terminating);
        let running = spawn_task(&state, &job, TaskStatus::Running);

        poll(&maintainer(&state)).await;

        assert_eq!(task_status(&state, &pausing), TaskStatus::Paused);
        assert_eq!(task_status(&state, &terminating), TaskStatus::Terminated);
        assert_eq!(task_status(&state, &running), TaskStatus::Running);
        for id in [&pausing, &terminating] {
            assert!(state.get_task(&Caller::root(), id).unwrap().process.is_none());
        }
    }

    #[tokio::test]
    async fn settling_twice_is_harmless() {
        let state = seeded_state();
        let job = submit(&state);
        let id = spawn_task(&state, &job, TaskStatus::Pausing);
        let m = maintainer(&state);
        let leased = state
            .lease_task(&[], "controller-1", None, SortOrder::Asc)
            .unwrap()
            .unwrap();

        m.settle(leased.clone()).await;
        // Second run finds the task already paused and no lease to return.
        m.settle(leased).await;
        assert_eq!(task_status(&state, &id), TaskStatus::Paused);
    }

    #[tokio::test]
    async fn abandoned_settlement_still_releases_the_lease() {
        let state = seeded_state();
        let job = submit(&state);
        let id = spawn_task(&state, &job, TaskStatus::Pausing);
        let m = maintainer(&state);
        let leased = state
            .lease_task(&[], "controller-1", None, SortOrder::Asc)
            .unwrap()
            .unwrap();

        // The worker reports a failure before the maintainer gets to it, so
        // pausing can no longer complete.
        state
            .update_task(&Caller::root(), &id, TaskUpdate::status(TaskStatus::Error))
            .unwrap();
        m.settle(leased).await;

        let current = state.get_task(&Caller::root(), &id).unwrap();
        assert_eq!(current.status, TaskStatus::Error);
        assert!(current.process.is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_settlements_in_flight() {
        let state = seeded_state();
        let job = submit(&state);
        let id = spawn_task(&state, &job, TaskStatus::Pausing);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            maintainer(&state)
                .with_period(Duration::from_millis(5))
                .run(shutdown_rx),
        );
        // Stop as soon as the task has been picked up.
        for _ in 0..1000 {
            let task = state.get_task(&Caller::root(), &id).unwrap();
            if task.status != TaskStatus::Pausing || task.process.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let task = state.get_task(&Caller::root(), &id).unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.process.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let state = seeded_state();
        let job = submit(&state);
        let id = spawn_task(&state, &job, TaskStatus::Terminating);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            maintainer(&state)
                .with_period(Duration::from_millis(10))
                .run(shutdown_rx),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(task_status(&state, &id), TaskStatus::Terminated);
    }
}
