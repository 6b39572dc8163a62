//! jobgrid-state — shared document store for jobgrid processes.
//!
//! Backed by [redb](https://docs.rs/redb). Controllers, schedulers and
//! workers never talk to each other directly; everything they coordinate on
//! (process registrations, jobs, tasks, dataset and module leases) lives
//! here.
//!
//! # Architecture
//!
//! ```text
//!   processes ─┐
//!   jobs ──────┼──► typed entity ops ──► lease / query ──► store ──► redb
//!   tasks ─────┤
//!   catalog ───┘
//! ```
//!
//! Every document is JSON-serialized into redb's `&[u8]` value columns.
//! Operations that read and then write (leases, status transitions, task
//! numbering, ordinal claims) run inside a single redb write transaction,
//! which redb serializes. That is the only atomicity the rest of the
//! system relies on.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. redb holds an exclusive lock on its
//! file, so one OS process owns a store; every jobgrid process coordinating
//! through it must be hosted there and use a clone of the same handle.

pub mod catalog;
pub mod error;
pub mod id;
pub mod jobs;
mod lease;
pub mod processes;
pub mod query;
pub mod store;
pub mod tables;
pub mod tasks;
pub mod types;

#[cfg(test)]
mod testutil;

pub use error::{StateError, StateResult};
pub use jobs::{JobFilter, JobSort, JobUpdate, ModelFanOut, NewJob};
pub use processes::{NewProcess, ProcessFilter, ProcessSort};
pub use query::{ListQuery, Page, SortOrder};
pub use store::{Document, Leasable, StateStore};
pub use tasks::{NewTask, TaskFilter, TaskSort, TaskUpdate};
pub use types::*;
