//! Liveness reaper — terminates processes that stopped sending keepalives
//! and frees whatever they were holding.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use jobgrid_core::{epoch_millis, retry_sync};
use jobgrid_state::{Process, StateStore};

use crate::error::RegistryResult;
use crate::leases::release_all_leases;

/// Background loop that reaps processes with stale keepalives.
#[derive(Clone)]
pub struct LivenessReaper {
    state: StateStore,
    /// A process is dead once its last keepalive is older than this.
    timeout: Duration,
    /// Pause between reaper passes.
    period: Duration,
    retry_initial_backoff: Duration,
}

impl LivenessReaper {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            timeout: Duration::from_secs(25),
            period: Duration::from_secs(5),
            retry_initial_backoff: Duration::from_secs(1),
        }
    }

    /// Set the keepalive staleness threshold.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the interval between passes.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_retry_initial_backoff(mut self, initial: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self
    }

    /// Run one pass: terminate every stale process, one atomic step at a
    /// time, and release its leases before moving to the next. Returns the
    /// processes this pass terminated.
    pub async fn reap_once(&self) -> RegistryResult<Vec<Process>> {
        let cutoff = epoch_millis().saturating_sub(self.timeout.as_millis() as u64);
        let mut reaped = Vec::new();
        loop {
            let next = retry_sync("terminate stale process", self.retry_initial_backoff, || {
                self.state.terminate_stale_process(cutoff)
            })
            .await?;
            let Some(process) = next else {
                break;
            };
            warn!(
                id = %process.id,
                kind = %process.kind,
                ordinal = process.running_ordinal,
                last_keepalive = process.last_keepalive,
                "process missed its keepalives, terminated"
            );
            release_all_leases(&self.state, &process.id, self.retry_initial_backoff).await?;
            reaped.push(process);
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaper pass finished");
        }
        Ok(reaped)
    }

    /// Reap on every period until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timeout_ms = self.timeout.as_millis() as u64,
            period_ms = self.period.as_millis() as u64,
            "liveness reaper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "reaper pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("liveness reaper shutting down");
                    break;
                }
            }
        }
    }
}
