//! Node configuration loaded from TOML.
//!
//! Every section is optional; missing keys take the library defaults.
//!
//! ```toml
//! [agent]
//! id = "coordinator"
//! capabilities = ["planning"]
//!
//! [protocol]
//! negotiation_ttl_secs = 60
//!
//! [[swarm.agents]]
//! id = "writer"
//! capabilities = ["writing"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use hive_agent::EndpointConfig;
use hive_consensus::ContractNetConfig;
use hive_protocol::constants::*;
use hive_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "hive.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub agent: AgentSection,
    pub protocol: ProtocolSection,
    pub scheduler: SchedulerSection,
    pub consensus: ConsensusSection,
    pub logging: LoggingSection,
    pub swarm: SwarmSection,
}

/// Identity of the local (coordinator) agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Plain agent id. When absent the id is derived from the signing key.
    pub id: Option<String>,
    pub capabilities: Vec<String>,
    /// Ed25519 key file; created on first use.
    pub key_file: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: Some("coordinator".into()),
            capabilities: Vec::new(),
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolSection {
    pub default_ttl_secs: u64,
    pub capability_request_ttl_secs: u64,
    pub negotiation_ttl_secs: u64,
    pub collaboration_ttl_secs: u64,
    pub help_request_ttl_secs: u64,
    pub max_acceptable_workload: f64,
    pub min_deadline_lead_secs: u64,
    pub workload_capacity: usize,
    pub require_signatures: bool,
    pub dedup_window_secs: u64,
    /// Serialize every message through the wire codec on the in-process bus.
    pub wire_encoding: bool,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            capability_request_ttl_secs: CAPABILITY_REQUEST_TTL_SECS,
            negotiation_ttl_secs: NEGOTIATION_TTL_SECS,
            collaboration_ttl_secs: COLLABORATION_TTL_SECS,
            help_request_ttl_secs: HELP_REQUEST_TTL_SECS,
            max_acceptable_workload: MAX_ACCEPTABLE_WORKLOAD,
            min_deadline_lead_secs: MIN_DEADLINE_LEAD_SECS,
            workload_capacity: DEFAULT_WORKLOAD_CAPACITY,
            require_signatures: false,
            dedup_window_secs: DEDUP_WINDOW_SECS,
            wire_encoding: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub delegation_timeout_secs: u64,
    pub workload_step: f64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            delegation_timeout_secs: defaults.delegation_timeout.as_secs(),
            workload_step: defaults.workload_step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    pub reap_grace_secs: u64,
    pub reap_interval_secs: u64,
    pub bid_validity_secs: u64,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        let defaults = ContractNetConfig::default();
        Self {
            reap_grace_secs: defaults.reap_grace.as_secs(),
            reap_interval_secs: defaults.reap_interval.as_secs(),
            bid_validity_secs: defaults.bid_validity.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Include the module path of each event.
    pub with_target: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    pub agents: Vec<SwarmAgent>,
}

/// A worker started in-process by `LocalSwarm`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmAgent {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Workload advertised to the coordinator's registry.
    #[serde(default)]
    pub workload: f64,
    /// Fixed generator answer; the mock generator echoes the task otherwise.
    #[serde(default)]
    pub response: Option<String>,
    /// Artificial generator latency.
    #[serde(default)]
    pub delay_ms: u64,
}

impl ConnectorConfig {
    /// `<config dir>/hive/hive.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hive").join(CONFIG_FILE_NAME))
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Load `path`, or the default path when it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let workload = self.protocol.max_acceptable_workload;
        if !(0.0..=1.0).contains(&workload) {
            return Err(ConfigError::InvalidValue {
                field: "protocol.max_acceptable_workload",
                reason: format!("{workload} is outside [0, 1]"),
            });
        }
        if self.protocol.workload_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "protocol.workload_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.scheduler.delegation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.delegation_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.swarm.agents {
            if agent.id.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "swarm.agents.id",
                    reason: "must not be empty".into(),
                });
            }
            if !seen.insert(agent.id.as_str()) || Some(&agent.id) == self.agent.id.as_ref() {
                return Err(ConfigError::InvalidValue {
                    field: "swarm.agents.id",
                    reason: format!("duplicate agent id {}", agent.id),
                });
            }
        }
        Ok(())
    }

    /// Endpoint settings for the local agent.
    pub fn endpoint_config(&self) -> EndpointConfig {
        self.endpoint_config_with(self.agent.capabilities.iter().cloned())
    }

    /// Endpoint settings with a different capability set, for swarm workers.
    pub fn endpoint_config_with<I>(&self, capabilities: I) -> EndpointConfig
    where
        I: IntoIterator<Item = String>,
    {
        let p = &self.protocol;
        EndpointConfig {
            workload_capacity: p.workload_capacity,
            max_acceptable_workload: p.max_acceptable_workload,
            min_deadline_lead: Duration::from_secs(p.min_deadline_lead_secs),
            require_signatures: p.require_signatures,
            dedup_window: Duration::from_secs(p.dedup_window_secs),
            default_ttl: Duration::from_secs(p.default_ttl_secs),
            capability_request_ttl: Duration::from_secs(p.capability_request_ttl_secs),
            negotiation_ttl: Duration::from_secs(p.negotiation_ttl_secs),
            collaboration_ttl: Duration::from_secs(p.collaboration_ttl_secs),
            help_request_ttl: Duration::from_secs(p.help_request_ttl_secs),
            ..EndpointConfig::default()
        }
        .with_capabilities(capabilities)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            delegation_timeout: Duration::from_secs(self.scheduler.delegation_timeout_secs),
            workload_step: self.scheduler.workload_step,
        }
    }

    pub fn contract_net_config(&self) -> ContractNetConfig {
        ContractNetConfig {
            reap_grace: Duration::from_secs(self.consensus.reap_grace_secs),
            reap_interval: Duration::from_secs(self.consensus.reap_interval_secs.max(1)),
            bid_validity: Duration::from_secs(self.consensus.bid_validity_secs),
        }
    }
}
