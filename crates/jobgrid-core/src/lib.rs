pub mod backoff;
pub mod config;
pub mod time;

pub use backoff::{Backoff, Transient, retry_sync, retry_until_success};
pub use config::JobgridConfig;
pub use time::epoch_millis;
