//! jobgrid-workers — background loops that finish what users request.
//!
//! Users only ever move jobs and tasks into transitional statuses (pausing,
//! resuming, terminating). The maintainers here lease those documents and
//! carry them the rest of the way:
//!
//! ```text
//! JobStatusMaintainer
//!   pausing      ── pause tasks ─────►  paused
//!   resuming     ── reschedule tasks ─►  running
//!   terminating  ── terminate tasks ──►  terminated
//!
//! TaskStatusMaintainer
//!   pausing      ─►  paused
//!   terminating  ─►  terminated
//! ```

pub mod fan_out;
pub mod job_maintainer;
pub mod task_maintainer;

#[cfg(test)]
mod testutil;

pub use fan_out::fan_out_model;
pub use job_maintainer::JobStatusMaintainer;
pub use task_maintainer::TaskStatusMaintainer;
