//! Process documents: registration records, keepalives, and termination of
//! processes whose keepalive went stale.

use std::str::FromStr;

use tracing::{debug, info};

use jobgrid_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::id::new_object_id;
use crate::query::{ListQuery, Page, SortField, SortValue, ValueKind, paginate};
use crate::store::{Document, StateStore, insert_new_doc, next_counter, store_doc};
use crate::tables::{ORDINAL_CLAIMS, PROCESSES};
use crate::types::*;

impl Document for Process {
    const TABLE: redb::TableDefinition<'static, &'static str, &'static [u8]> = PROCESSES;
    const KIND: &'static str = "process";

    fn key(&self) -> &str {
        &self.id
    }
}

/// Predicate over processes. All filters in a list must hold.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessFilter {
    Id(String),
    ProcessId(u32),
    HostId(String),
    HostAddress(String),
    Kind(ProcessKind),
    Resource(String),
    Status(ProcessStatus),
}

impl ProcessFilter {
    /// Build a filter from its query-string form.
    pub fn parse(key: &str, value: &str) -> StateResult<Self> {
        Ok(match key {
            "id" => ProcessFilter::Id(value.to_string()),
            "process-id" => ProcessFilter::ProcessId(value.parse().map_err(|_| {
                StateError::BadInput(format!("invalid process-id {value:?}"))
            })?),
            "host-id" => ProcessFilter::HostId(value.to_string()),
            "host-address" => ProcessFilter::HostAddress(value.to_string()),
            "type" => ProcessFilter::Kind(value.parse()?),
            "resource" => ProcessFilter::Resource(value.to_string()),
            "status" => ProcessFilter::Status(value.parse()?),
            other => {
                return Err(StateError::BadInput(format!(
                    "unsupported process filter {other:?}"
                )));
            }
        })
    }

    pub fn matches(&self, p: &Process) -> bool {
        match self {
            ProcessFilter::Id(id) => &p.id == id,
            ProcessFilter::ProcessId(pid) => p.process_id == *pid,
            ProcessFilter::HostId(host) => &p.host_id == host,
            ProcessFilter::HostAddress(addr) => &p.host_address == addr,
            ProcessFilter::Kind(kind) => p.kind == *kind,
            ProcessFilter::Resource(resource) => &p.resource == resource,
            ProcessFilter::Status(status) => p.status == *status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSort {
    ProcessId,
    HostId,
    HostAddress,
    StartTime,
    Kind,
    Resource,
    Status,
    RunningOrdinal,
}

impl FromStr for ProcessSort {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        Ok(match s {
            "process-id" => ProcessSort::ProcessId,
            "host-id" => ProcessSort::HostId,
            "host-address" => ProcessSort::HostAddress,
            "start-time" => ProcessSort::StartTime,
            "type" => ProcessSort::Kind,
            "resource" => ProcessSort::Resource,
            "status" => ProcessSort::Status,
            "running-ordinal" => ProcessSort::RunningOrdinal,
            other => {
                return Err(StateError::BadInput(format!(
                    "invalid process sort field {other:?}"
                )));
            }
        })
    }
}

impl SortField<Process> for ProcessSort {
    fn kind(&self) -> ValueKind {
        match self {
            ProcessSort::ProcessId | ProcessSort::StartTime | ProcessSort::RunningOrdinal => {
                ValueKind::Int
            }
            _ => ValueKind::Text,
        }
    }

    fn value_of(&self, p: &Process) -> SortValue {
        match self {
            ProcessSort::ProcessId => SortValue::Int(i64::from(p.process_id)),
            ProcessSort::HostId => SortValue::Text(p.host_id.clone()),
            ProcessSort::HostAddress => SortValue::Text(p.host_address.clone()),
            ProcessSort::StartTime => SortValue::Int(p.start_time as i64),
            ProcessSort::Kind => SortValue::Text(p.kind.to_string()),
            ProcessSort::Resource => SortValue::Text(p.resource.clone()),
            ProcessSort::Status => SortValue::Text(p.status.to_string()),
            ProcessSort::RunningOrdinal => SortValue::Int(i64::from(p.running_ordinal)),
        }
    }
}

/// Fields of a process supplied at registration.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub process_id: u32,
    pub host_id: String,
    pub host_address: String,
    pub kind: ProcessKind,
    pub resource: String,
    pub running_ordinal: u32,
}

impl StateStore {
    /// Insert a freshly started process. The id, timestamps and ordinal
    /// claim are assigned here.
    pub fn create_process(&self, new: NewProcess) -> StateResult<Process> {
        let id = new_object_id()?;
        let now = epoch_millis();
        let process = self.write(|txn| {
            let process = Process {
                id,
                process_id: new.process_id,
                host_id: new.host_id,
                host_address: new.host_address,
                start_time: now,
                last_keepalive: now,
                kind: new.kind,
                resource: new.resource,
                status: ProcessStatus::Idle,
                running_ordinal: new.running_ordinal,
                ordinal_claim: next_counter(txn, ORDINAL_CLAIMS)?,
            };
            insert_new_doc(txn, &process)?;
            Ok(process)
        })?;
        info!(
            id = %process.id,
            kind = %process.kind,
            ordinal = process.running_ordinal,
            "process created"
        );
        Ok(process)
    }

    pub fn get_process(&self, id: &str) -> StateResult<Process> {
        self.fetch_required(id)
    }

    /// Processes are visible to every caller.
    pub fn list_processes(
        &self,
        filters: &[ProcessFilter],
        query: &ListQuery<ProcessSort>,
    ) -> StateResult<Page<Process>> {
        let docs = self.scan(|p: &Process| filters.iter().all(|f| f.matches(p)))?;
        paginate(docs, query)
    }

    pub fn count_processes(&self, filters: &[ProcessFilter]) -> StateResult<usize> {
        self.count(|p: &Process| filters.iter().all(|f| f.matches(p)))
    }

    /// Non-terminated processes of `kind`.
    pub fn live_processes(&self, kind: ProcessKind) -> StateResult<Vec<Process>> {
        self.scan(|p: &Process| p.kind == kind && p.is_live())
    }

    /// Move a process to `ordinal`, stamping a new claim sequence.
    pub fn claim_ordinal(&self, id: &str, ordinal: u32) -> StateResult<Process> {
        let process = self.modify(id, |txn, p: &mut Process| {
            p.running_ordinal = ordinal;
            p.ordinal_claim = next_counter(txn, ORDINAL_CLAIMS)?;
            Ok(())
        })?;
        debug!(%id, ordinal, claim = process.ordinal_claim, "ordinal claimed");
        Ok(process)
    }

    /// Record that the process is still alive.
    pub fn process_keepalive(&self, id: &str) -> StateResult<Process> {
        let now = epoch_millis();
        self.modify(id, |_, p: &mut Process| {
            p.last_keepalive = now;
            Ok(())
        })
    }

    pub fn set_process_status(&self, id: &str, status: ProcessStatus) -> StateResult<Process> {
        self.modify(id, |_, p: &mut Process| {
            p.status = status;
            Ok(())
        })
    }

    /// Mark one process whose last keepalive precedes `cutoff` as terminated.
    /// The oldest keepalive goes first.
    pub fn terminate_stale_process(&self, cutoff: u64) -> StateResult<Option<Process>> {
        self.find_and_modify(
            |p: &Process| p.is_live() && p.last_keepalive < cutoff,
            |a, b| {
                a.last_keepalive
                    .cmp(&b.last_keepalive)
                    .then_with(|| a.id.cmp(&b.id))
            },
            |p| p.status = ProcessStatus::Terminated,
        )
    }

    /// Terminate every stale process, one atomic step at a time, and return
    /// the processes this call terminated.
    pub fn terminate_stale_processes(&self, cutoff: u64) -> StateResult<Vec<Process>> {
        let mut terminated = Vec::new();
        while let Some(process) = self.terminate_stale_process(cutoff)? {
            info!(id = %process.id, kind = %process.kind, "stale process terminated");
            terminated.push(process);
        }
        Ok(terminated)
    }

    /// Overwrite a process document. Used by tooling and tests that need to
    /// stage keepalive history.
    pub fn put_process(&self, process: &Process) -> StateResult<()> {
        self.write(|txn| store_doc(txn, process))
    }
}
