//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the hub runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use r_ems_msg::{is_reserved_name, NODE_NAME_LEN};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_state_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_min_group_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_bus_capacity() -> usize {
    128
}

fn default_send_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_persistence_directory() -> PathBuf {
    PathBuf::from("target/hub-state")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the hub daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Nodes created at start, in declaration order.
    #[serde(default)]
    pub nodes: IndexMap<String, NodeConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Metadata describing where a [`HubConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHubConfig {
    pub config: HubConfig,
    pub source: PathBuf,
}

impl HubConfig {
    pub const ENV_CONFIG_PATH: &'static str = "R_EMS_HUB_CONFIG";

    /// Load configuration from disk, respecting the `R_EMS_HUB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHubConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHubConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHubConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        for (name, node) in &self.nodes {
            validate_node_name(name)?;
            if node.plugin.trim().is_empty() {
                return Err(anyhow!("node '{}' must name a plugin", name));
            }
        }
        for sub in &self.subscriptions {
            if sub.app.is_empty() || sub.driver.is_empty() || sub.group.is_empty() {
                return Err(anyhow!(
                    "subscription entries need app, driver and group (got {:?})",
                    sub
                ));
            }
        }
        self.adapter.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for HubConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HubConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_node_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("node names must not be empty"));
    }
    if name.len() >= NODE_NAME_LEN {
        return Err(anyhow!(
            "node name '{}' exceeds {} bytes",
            name,
            NODE_NAME_LEN - 1
        ));
    }
    if is_reserved_name(name) {
        return Err(anyhow!("node name '{}' is reserved", name));
    }
    Ok(())
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Deadline for requests issued through the manager handle.
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout_ms: Duration,
    /// Period of the nodes-state broadcast to app nodes.
    #[serde(default = "default_state_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub state_interval_ms: Duration,
    /// Create the hidden monitor node.
    #[serde(default = "default_true")]
    pub monitor: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            state_interval_ms: default_state_interval(),
            monitor: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Smallest poll interval a group may be configured with.
    #[serde(default = "default_min_group_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_group_interval_ms: Duration,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default = "default_send_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub send_timeout_ms: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            min_group_interval_ms: default_min_group_interval(),
            bus_capacity: default_bus_capacity(),
            send_timeout_ms: default_send_timeout(),
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_group_interval_ms < Duration::from_millis(1) {
            return Err(anyhow!("adapter.min_group_interval_ms must be at least 1"));
        }
        if self.bus_capacity == 0 {
            return Err(anyhow!("adapter.bus_capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_persistence_directory")]
    pub directory: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_persistence_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

/// Declaration of one node created at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Catalog module name.
    pub plugin: String,
    /// Plugin setting, forwarded as JSON text.
    #[serde(default)]
    pub setting: Option<serde_json::Value>,
    #[serde(default)]
    pub auto_start: bool,
}

impl NodeConfig {
    /// Setting rendered as the JSON text plugins receive.
    pub fn setting_json(&self) -> Option<String> {
        self.setting.as_ref().map(|value| value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub app: String,
    pub driver: String,
    pub group: String,
}
