//! Process registry — registration, ordinals, and keepalives.
//!
//! Every process announces itself by inserting a process document that
//! carries a running ordinal: the smallest positive integer no other live
//! process of the same kind uses. Picking the ordinal and inserting the
//! document are separate store calls, so two processes starting together
//! can pick the same number. After inserting, a process looks at every
//! live peer holding its ordinal and keeps it only if it has the earliest
//! ordinal claim (the store-wide counter stamped on each insert and each
//! reassignment, ties broken by id). Losers pick again and re-check.
//!
//! An accepted process never loses its ordinal: every later claim carries a
//! larger counter, so the earliest claim stays the earliest.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobgrid_state::*;

use crate::error::{RegistryError, RegistryResult};
use crate::host::HostIdentity;
use crate::leases::{ReleasedLeases, release_all_leases};

/// Registers processes and keeps their registration alive.
#[derive(Clone)]
pub struct ProcessRegistry {
    state: StateStore,
    host: HostIdentity,
    resource: String,
    keepalive_period: Duration,
    retry_initial_backoff: Duration,
}

impl ProcessRegistry {
    /// Create a registry for processes on this host.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            host: HostIdentity::detect(),
            resource: "cpu".to_string(),
            keepalive_period: Duration::from_secs(5),
            retry_initial_backoff: Duration::from_secs(1),
        }
    }

    /// Record `host` instead of the detected identity.
    pub fn with_host(mut self, host: HostIdentity) -> Self {
        self.host = host;
        self
    }

    /// Set the compute resource processes advertise.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    /// Set the interval between keepalives.
    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.keepalive_period = period;
        self
    }

    /// Set the first delay of the lease-release retry on deregistration.
    pub fn with_retry_initial_backoff(mut self, initial: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self
    }

    /// Register the calling OS process as a `kind` process and settle its
    /// ordinal. The returned document holds an ordinal unique among live
    /// processes of that kind.
    pub fn register(&self, kind: ProcessKind) -> RegistryResult<Process> {
        let ordinal = self.free_ordinal(kind, None)?;
        let process = self.state.create_process(NewProcess {
            process_id: std::process::id(),
            host_id: self.host.host_id.clone(),
            host_address: self.host.host_address.clone(),
            kind,
            resource: self.resource.clone(),
            running_ordinal: ordinal,
        })?;
        let process = self.settle_ordinal(process)?;
        info!(
            id = %process.id,
            %kind,
            ordinal = process.running_ordinal,
            host = %process.host_id,
            "process registered"
        );
        Ok(process)
    }

    /// Re-check `process`'s ordinal against its live peers until it holds
    /// it alone, moving to a fresh ordinal each time it loses.
    pub fn settle_ordinal(&self, mut process: Process) -> RegistryResult<Process> {
        loop {
            let peers = self.state.live_processes(process.kind)?;
            if !peers.iter().any(|p| p.id == process.id) {
                return Err(RegistryError::Terminated(process.id));
            }
            let winner = peers
                .iter()
                .filter(|p| p.running_ordinal == process.running_ordinal)
                .min_by(|a, b| {
                    a.ordinal_claim
                        .cmp(&b.ordinal_claim)
                        .then_with(|| a.id.cmp(&b.id))
                });
            if winner.is_some_and(|w| w.id == process.id) {
                return Ok(process);
            }

            let taken = process.running_ordinal;
            let ordinal = lowest_unused(&peers, Some(&process.id))
                .ok_or(RegistryError::OrdinalsExhausted(process.kind))?;
            process = self.state.claim_ordinal(&process.id, ordinal)?;
            debug!(id = %process.id, lost = taken, retry = ordinal, "ordinal contested");
        }
    }

    /// Smallest ordinal no live `kind` process other than `except` holds.
    fn free_ordinal(&self, kind: ProcessKind, except: Option<&str>) -> RegistryResult<u32> {
        let peers = self.state.live_processes(kind)?;
        lowest_unused(&peers, except).ok_or(RegistryError::OrdinalsExhausted(kind))
    }

    /// Record a keepalive for `process_id`.
    pub fn keepalive(&self, process_id: &str) -> RegistryResult<Process> {
        let process = self.state.process_keepalive(process_id)?;
        if !process.is_live() {
            warn!(id = %process_id, "keepalive for a process that was already reaped");
        }
        Ok(process)
    }

    /// Mark `process_id` terminated and clear every lease it holds.
    pub async fn deregister(&self, process_id: &str) -> RegistryResult<ReleasedLeases> {
        self.state
            .set_process_status(process_id, ProcessStatus::Terminated)?;
        let released =
            release_all_leases(&self.state, process_id, self.retry_initial_backoff).await?;
        info!(id = %process_id, released = released.total(), "process deregistered");
        Ok(released)
    }

    /// Emit keepalives for `process_id` until `shutdown` flips.
    pub fn spawn_keepalive(
        &self,
        process_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        let process_id = process_id.to_string();
        tokio::spawn(async move { registry.run_keepalive_loop(&process_id, shutdown).await })
    }

    async fn run_keepalive_loop(&self, process_id: &str, mut shutdown: watch::Receiver<bool>) {
        debug!(id = %process_id, period_ms = self.keepalive_period.as_millis() as u64, "keepalive loop starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.keepalive_period) => {
                    if let Err(e) = self.keepalive(process_id) {
                        warn!(id = %process_id, error = %e, "keepalive failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(id = %process_id, "keepalive loop shutting down");
                    break;
                }
            }
        }
    }
}

fn lowest_unused(peers: &[Process], except: Option<&str>) -> Option<u32> {
    let used: BTreeSet<u32> = peers
        .iter()
        .filter(|p| Some(p.id.as_str()) != except)
        .map(|p| p.running_ordinal)
        .collect();
    (1..=u32::MAX).find(|n| !used.contains(n))
}
