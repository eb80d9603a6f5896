//! YAML configuration for cuo.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from `cuo.yaml`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Path to the docker-compose deployment descriptor.
    pub compose_file: PathBuf,

    /// Services eligible for staged upgrades, keyed by compose service name.
    pub services: BTreeMap<String, ServiceConfig>,

    /// Registry access settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Step execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Per-service upgrade settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Registry repository the service's image is published under
    /// (e.g. `library/nextcloud`).
    pub repository: String,

    /// Packaging variant suffix required on tags (e.g. `fpm`).
    #[serde(default)]
    pub flavor: Option<String>,

    /// Tag substrings excluded from the listing.
    #[serde(default = "default_excluded_tags")]
    pub excluded_tags: Vec<String>,

    /// Post-upgrade maintenance commands, run inside the container once per
    /// step in order. Never retried automatically.
    #[serde(default)]
    pub maintenance: Vec<Vec<String>>,

    /// Services that must reach a completed session before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Sidecar services pinned to the same image (e.g. a cron container);
    /// their image reference is rewritten in the same step.
    #[serde(default)]
    pub linked_services: Vec<String>,
}

/// Registry access settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Base URL of the tag listing API.
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Number of attempts before surfacing `RegistryUnavailable`.
    #[serde(default = "default_registry_attempts")]
    pub attempts: u32,

    /// Initial backoff in seconds; doubles per attempt.
    #[serde(default = "default_registry_backoff")]
    pub backoff_secs: u64,

    /// Maximum number of tag pages fetched per listing.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

/// Step execution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Readiness polling ceiling in seconds.
    #[serde(default = "default_readiness_ceiling")]
    pub readiness_ceiling_secs: u64,

    /// Readiness polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Settle delay between steps in seconds.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// What to do when a step fails or times out.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Failure policy applied between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the session on the first failed or timed-out step.
    #[default]
    Halt,
    /// Record the failure and attempt the remaining steps.
    Continue,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML from {}", path.display()))?;

        if config.services.is_empty() {
            anyhow::bail!("No services configured in {}", path.display());
        }

        Ok(config)
    }

    /// Look up a configured service by compose service name.
    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Service {name} is not configured"))
    }
}

impl RegistryConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

impl ExecutionConfig {
    pub const fn readiness_ceiling(&self) -> Duration {
        Duration::from_secs(self.readiness_ceiling_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub const fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
            timeout_secs: default_registry_timeout(),
            attempts: default_registry_attempts(),
            backoff_secs: default_registry_backoff(),
            max_pages: default_max_pages(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            readiness_ceiling_secs: default_readiness_ceiling(),
            poll_interval_secs: default_poll_interval(),
            settle_delay_secs: default_settle_delay(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_registry_base_url() -> String {
    "https://hub.docker.com/v2".to_string()
}
const fn default_registry_timeout() -> u64 {
    10
}
const fn default_registry_attempts() -> u32 {
    3
}
const fn default_registry_backoff() -> u64 {
    1
}
const fn default_max_pages() -> u32 {
    100
}
const fn default_readiness_ceiling() -> u64 {
    180
}
const fn default_poll_interval() -> u64 {
    5
}
const fn default_settle_delay() -> u64 {
    10
}
fn default_excluded_tags() -> Vec<String> {
    ["apache", "windows", "rc", "beta"]
        .into_iter()
        .map(String::from)
        .collect()
}
