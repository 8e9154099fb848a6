//! Agent settings with layered sources and validation.
//!
//! Sources, lowest precedence first: the embedded `config.toml` defaults, the
//! agent configuration file, then `EDGE_AGENT__<SECTION>__<KEY>` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/edge-agent/agent.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub asset_id: String,
    pub token: String,
    pub interval_ms: u64,
    pub opqueue_len: usize,
    pub shutdown_timeout_ms: u64,
    pub op_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            asset_id: String::new(),
            token: String::new(),
            interval_ms: 30_000,
            opqueue_len: 32,
            shutdown_timeout_ms: 10_000,
            op_timeout_ms: 60_000,
        }
    }
}

impl AgentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub address: String,
    pub timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_ms: 10_000,
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    pub controller: ControllerConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings, reading `file` if it exists.
    pub fn load(file: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml))
            .add_source(File::from(file).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("EDGE_AGENT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks that hold for every command, joined or not.
    pub fn validate(&self) -> Result<()> {
        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => return Err(anyhow!("Unknown logging format '{}', expected json or text", other)),
        }
        if self.controller.timeout_ms == 0 {
            return Err(anyhow!("Controller timeout cannot be 0"));
        }
        if self.agent.shutdown_timeout_ms == 0 {
            return Err(anyhow!("Shutdown timeout cannot be 0"));
        }
        Ok(())
    }

    /// Checks that must pass before the agent talks to a controller.
    pub fn validate_joined(&self) -> crate::error::Result<()> {
        if self.agent.token.is_empty() {
            return Err(AgentError::FailedPrecondition(
                "no token found - agent not joined to controller".to_string(),
            ));
        }
        if self.agent.asset_id.is_empty() {
            return Err(AgentError::FailedPrecondition(
                "no asset id found - agent not joined to controller".to_string(),
            ));
        }
        if self.controller.address.is_empty() {
            return Err(AgentError::InvalidArgument("address must be specified".to_string()));
        }
        if self.agent.interval_ms == 0 {
            return Err(AgentError::InvalidArgument(
                "valid interval (> 0) must be specified".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings ready to run against `address`.
    pub fn joined(asset_id: &str, token: &str, address: &str) -> Self {
        let mut settings = Settings::default();
        settings.agent.asset_id = asset_id.to_string();
        settings.agent.token = token.to_string();
        settings.controller.address = address.to_string();
        settings
    }
}
