//! jobgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};

const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_LISTENER_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Number of keepalive periods a process may miss before it is reaped.
pub const KEEPALIVE_TIMEOUT_FACTOR: u32 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobgridConfig {
    pub store: Option<StoreConfig>,
    pub process: Option<ProcessConfig>,
    pub workers: Option<WorkersConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    pub keepalive_period: Option<String>,
    pub keepalive_timeout: Option<String>,
    pub reaper_period: Option<String>,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkersConfig {
    pub listener_period: Option<String>,
    pub retry_initial_backoff: Option<String>,
}

impl JobgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: JobgridConfig = toml::from_str(content)?;
        // Surface malformed durations at load time rather than on first use.
        config.keepalive_period()?;
        config.keepalive_timeout()?;
        config.reaper_period()?;
        config.listener_period()?;
        config.retry_initial_backoff()?;
        Ok(config)
    }

    /// Store file location; falls back to `<data_dir>/jobgrid.redb`.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| data_dir.join("jobgrid.redb"))
    }

    pub fn keepalive_period(&self) -> anyhow::Result<Duration> {
        let raw = self.process.as_ref().and_then(|p| p.keepalive_period.as_deref());
        duration_or(raw, DEFAULT_KEEPALIVE_PERIOD)
    }

    /// Staleness threshold used by the reaper. Defaults to five keepalive periods.
    pub fn keepalive_timeout(&self) -> anyhow::Result<Duration> {
        let period = self.keepalive_period()?;
        let Some(default) = period.checked_mul(KEEPALIVE_TIMEOUT_FACTOR) else {
            bail!("keepalive period {period:?} is too large");
        };
        let raw = self.process.as_ref().and_then(|p| p.keepalive_timeout.as_deref());
        duration_or(raw, default)
    }

    pub fn reaper_period(&self) -> anyhow::Result<Duration> {
        let default = self.keepalive_period()?;
        let raw = self.process.as_ref().and_then(|p| p.reaper_period.as_deref());
        duration_or(raw, default)
    }

    pub fn resource(&self) -> String {
        self.process
            .as_ref()
            .and_then(|p| p.resource.clone())
            .unwrap_or_else(|| "cpu".to_string())
    }

    pub fn listener_period(&self) -> anyhow::Result<Duration> {
        let raw = self.workers.as_ref().and_then(|w| w.listener_period.as_deref());
        duration_or(raw, DEFAULT_LISTENER_PERIOD)
    }

    pub fn retry_initial_backoff(&self) -> anyhow::Result<Duration> {
        let raw = self
            .workers
            .as_ref()
            .and_then(|w| w.retry_initial_backoff.as_deref());
        duration_or(raw, DEFAULT_RETRY_BACKOFF)
    }
}

fn duration_or(raw: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
    match raw {
        Some(s) => match parse_duration(s) {
            Some(d) => Ok(d),
            None => bail!("invalid duration {s:?} (expected e.g. 500ms, 5s, 2m)"),
        },
        None => Ok(default),
    }
}

/// Parse a duration string with an `ms`, `s` or `m` suffix.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else {
        None
    }
}
