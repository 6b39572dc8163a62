//! redb table definitions for the jobgrid state store.
//!
//! Document tables use `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Task keys are `{job_id}/{sequence:010}` so a job's tasks
//! sort together.

use redb::TableDefinition;

/// Registered processes keyed by process id.
pub const PROCESSES: TableDefinition<&str, &[u8]> = TableDefinition::new("processes");

/// Jobs keyed by job id.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Tasks keyed by `{job_id}/{sequence}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Datasets keyed by dataset id.
pub const DATASETS: TableDefinition<&str, &[u8]> = TableDefinition::new("datasets");

/// Modules (models, objectives, optimizers) keyed by module id.
pub const MODULES: TableDefinition<&str, &[u8]> = TableDefinition::new("modules");

/// Monotonic store-wide counters keyed by name.
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Counter stamped on every ordinal claim.
pub const ORDINAL_CLAIMS: &str = "ordinal-claims";
