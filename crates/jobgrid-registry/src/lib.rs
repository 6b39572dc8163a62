//! jobgrid-registry — process registration and liveness.
//!
//! Processes coordinate only through the shared store, so membership is a
//! set of process documents:
//!
//! ```text
//! ProcessRegistry
//!   ├── register      insert + settle a unique running ordinal
//!   ├── keepalive     periodic last-keepalive stamp (one loop per process)
//!   └── deregister    terminate + release leases
//!
//! LivenessReaper
//!   └── reap_once     terminate stale processes, release their leases
//! ```

pub mod error;
pub mod host;
pub mod leases;
pub mod reaper;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use host::HostIdentity;
pub use leases::{ReleasedLeases, release_all_leases};
pub use reaper::LivenessReaper;
pub use registry::ProcessRegistry;
