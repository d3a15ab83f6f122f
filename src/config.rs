use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LEASE_TTL_SECS: u64 = 300;
const DEFAULT_REGISTRY_TIMEOUT_MS: u64 = 2000;
const DEFAULT_INSTANCE_MAX_AGE_SECS: u64 = 86_400;
/// Ceiling for lease and instance-age settings: one year.
const MAX_DURATION_SECS: u64 = 365 * 86_400;

fn default_lease_ttl_secs() -> u64 {
    DEFAULT_LEASE_TTL_SECS
}

fn default_registry_timeout_ms() -> u64 {
    DEFAULT_REGISTRY_TIMEOUT_MS
}

fn default_instance_max_age_secs() -> u64 {
    DEFAULT_INSTANCE_MAX_AGE_SECS
}

fn default_mutating_tools() -> Vec<String> {
    ["Write", "Edit", "MultiEdit", "NotebookEdit"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Tunables read from `.latch/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Lease length. Must outlast the gap between two tool calls in one
    /// editing session.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    /// Upper bound on waiting for the registry mutex.
    #[serde(default = "default_registry_timeout_ms")]
    pub registry_timeout_ms: u64,
    /// Instances silent for longer than this are pruned (if they hold nothing).
    #[serde(default = "default_instance_max_age_secs")]
    pub instance_max_age_secs: u64,
    /// Host tool names that mutate files.
    #[serde(default = "default_mutating_tools")]
    pub mutating_tools: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            registry_timeout_ms: DEFAULT_REGISTRY_TIMEOUT_MS,
            instance_max_age_secs: DEFAULT_INSTANCE_MAX_AGE_SECS,
            mutating_tools: default_mutating_tools(),
        }
    }
}

impl Config {
    /// Load config from the `.latch` directory, then apply env overrides.
    ///
    /// A missing file yields defaults. A malformed file is logged and also
    /// yields defaults; a bad config must never stop coordination.
    pub fn load(latch_dir: &Path) -> Self {
        let path = latch_dir.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<Config>(&content) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring malformed config");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        config.apply_env();
        config.sanitize();
        config
    }

    /// Write the default config (used by `latch init`).
    pub fn write_default(latch_dir: &Path) -> Result<()> {
        let path = latch_dir.join(CONFIG_FILE);
        if !path.exists() {
            fs::write(&path, serde_yaml::to_string(&Config::default())?)?;
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        clamped_secs(self.lease_ttl_secs)
    }

    pub fn instance_max_age(&self) -> chrono::Duration {
        clamped_secs(self.instance_max_age_secs)
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry_timeout_ms)
    }

    pub fn is_mutating_tool(&self, tool_name: &str) -> bool {
        self.mutating_tools.iter().any(|t| t == tool_name)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_u64("LATCH_LEASE_TTL_SECS") {
            self.lease_ttl_secs = v;
        }
        if let Some(v) = env_u64("LATCH_REGISTRY_TIMEOUT_MS") {
            self.registry_timeout_ms = v;
        }
    }

    fn sanitize(&mut self) {
        if self.lease_ttl_secs == 0 {
            warn!("lease_ttl_secs must be positive; using default");
            self.lease_ttl_secs = DEFAULT_LEASE_TTL_SECS;
        }
        if self.registry_timeout_ms == 0 {
            self.registry_timeout_ms = DEFAULT_REGISTRY_TIMEOUT_MS;
        }
        if self.lease_ttl_secs > MAX_DURATION_SECS {
            warn!(lease_ttl_secs = self.lease_ttl_secs, "lease_ttl_secs too large; clamping");
            self.lease_ttl_secs = MAX_DURATION_SECS;
        }
        if self.instance_max_age_secs > MAX_DURATION_SECS {
            warn!(
                instance_max_age_secs = self.instance_max_age_secs,
                "instance_max_age_secs too large; clamping"
            );
            self.instance_max_age_secs = MAX_DURATION_SECS;
        }
    }
}

/// Seconds as a chrono duration, never beyond `MAX_DURATION_SECS`, so that
/// `now + d` and `now - d` stay in range.
fn clamped_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(0))
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric env override");
            None
        }
    }
}
