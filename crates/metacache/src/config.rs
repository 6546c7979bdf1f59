//! Cache configuration.
//!
//! Loaded from TOML; every field is optional. Durations are written as
//! humane strings ("200ms", "5s", "2m") and parsed on access, falling back
//! to the default when a value does not parse.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use metacache_health::parse_duration;
use metacache_state::DEFAULT_RESOURCE_NAME;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Resource-affinity tag of this process. Records tagged otherwise are
    /// never cached.
    pub resource_name: String,
    /// Invoke the recovery trigger when an empty node registers.
    pub auto_recover: bool,
    /// Store polls after a miss before giving up.
    pub retry_count: u32,
    pub retry_interval: String,
    /// Upper bound on one gateway reload.
    pub reload_timeout: String,
    /// Pause before re-subscribing a failed watch stream.
    pub watch_backoff: String,
    /// Lease of the fail-server mutex. Must exceed the worst-case
    /// fail-server workflow.
    pub lock_ttl: String,
    pub probe_timeout: String,
    pub probe_path: String,
    /// Attempts at resolving a space's database name inside a watch event.
    pub resolve_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            auto_recover: false,
            retry_count: 3,
            retry_interval: "200ms".to_string(),
            reload_timeout: "10s".to_string(),
            watch_backoff: "1s".to_string(),
            lock_ttl: "188s".to_string(),
            probe_timeout: "5s".to_string(),
            probe_path: "/".to_string(),
            resolve_retries: 3,
        }
    }
}

impl CacheConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: CacheConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn retry_interval(&self) -> Duration {
        duration_or(&self.retry_interval, Duration::from_millis(200))
    }

    pub fn reload_timeout(&self) -> Duration {
        duration_or(&self.reload_timeout, Duration::from_secs(10))
    }

    pub fn watch_backoff(&self) -> Duration {
        duration_or(&self.watch_backoff, Duration::from_secs(1))
    }

    pub fn lock_ttl(&self) -> Duration {
        duration_or(&self.lock_ttl, Duration::from_secs(188))
    }

    pub fn probe_timeout(&self) -> Duration {
        duration_or(&self.probe_timeout, Duration::from_secs(5))
    }
}

fn duration_or(value: &str, fallback: Duration) -> Duration {
    match parse_duration(value) {
        Some(d) => d,
        None => {
            tracing::warn!(%value, ?fallback, "unparseable duration, using default");
            fallback
        }
    }
}
