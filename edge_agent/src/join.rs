//! Enrollment with the controller.
//!
//! A join exchanges a one-time join token for the agent token and asset id
//! that `run` needs, and stores them in the agent configuration file.

use std::collections::HashMap;
use std::fs;

use tracing::{info, instrument};

use crate::client::JoinClient;
use crate::config_store::ConfigStore;
use crate::error::{AgentError, Result};
use crate::protocol::{AgentJoinRequest, AgentJoinResponse};

const MACHINE_ID_FILE: &str = "/etc/machine-id";

pub struct Joiner {
    config: ConfigStore,
    address: String,
    token: String,
    labels: HashMap<String, String>,
}

impl Joiner {
    pub fn new(config: ConfigStore, address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            config,
            address: address.into(),
            token: token.into(),
            labels: HashMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels.extend(labels);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(AgentError::InvalidArgument("address must be specified".to_string()));
        }
        if self.token.is_empty() {
            return Err(AgentError::InvalidArgument("token must be specified".to_string()));
        }
        Ok(())
    }

    /// Enroll through `client` and persist the returned credentials together
    /// with the controller address.
    #[instrument(skip_all, fields(address = %self.address))]
    pub async fn run(&self, client: &dyn JoinClient) -> Result<AgentJoinResponse> {
        self.validate()?;

        let request = AgentJoinRequest {
            agent_id: agent_id(),
            labels: self.labels.clone(),
        };
        info!(agent_id = %request.agent_id, labels = ?request.labels, "joining controller");

        let response = client.agent_join(request).await?;

        self.config.set("agent.token", response.token.as_str());
        self.config.set("agent.asset_id", response.asset_id.as_str());
        self.config.set("controller.address", self.address.as_str());

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || config.write())
            .await
            .map_err(|e| AgentError::Internal(format!("configuration writer did not finish: {}", e)))??;

        info!(asset_id = %response.asset_id, file = %self.config.path().display(), "agent joined");
        Ok(response)
    }
}

/// Stable identifier of this machine, falling back to its host name.
pub fn agent_id() -> String {
    fs::read_to_string(MACHINE_ID_FILE)
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parse a `key=value` label from the command line.
pub fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("label must be key=value, got '{}'", s)),
    }
}
