//! Executes one operation at a time against the plugin registry.
//!
//! `start` and `stop` are handled here instead of by the plugin so that a
//! started plugin's configuration is persisted and replayed on restart.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config_store::ConfigStore;
use crate::error::{AgentError, Result};
use crate::plugin::{config_from_params, Params, PluginConfig, START_COMMAND, STOP_COMMAND};
use crate::registry::PluginRegistry;

pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Worker {
    registry: Arc<PluginRegistry>,
    plugin_config: ConfigStore,
    op_timeout: Duration,
}

impl Worker {
    /// `plugin_config` is the `plugins` scope of the agent configuration.
    pub fn new(registry: Arc<PluginRegistry>, plugin_config: ConfigStore, op_timeout: Duration) -> Self {
        Self {
            registry,
            plugin_config,
            op_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    #[instrument(skip(self, cancel, params))]
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        plugin: &str,
        command: &str,
        params: Params,
    ) -> Result<String> {
        match command {
            START_COMMAND => {
                let config = config_from_params(&params);
                self.registry.start_plugin(plugin, &config).await?;
                self.persist(plugin, Some(config)).await;
                Ok(String::new())
            }
            STOP_COMMAND => {
                self.registry.stop_plugin(plugin).await?;
                self.persist(plugin, None).await;
                Ok(String::new())
            }
            _ => {
                let token = cancel.child_token();
                let call = self
                    .registry
                    .execute_command(token.clone(), plugin, command, params);
                match tokio::time::timeout(self.op_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(AgentError::DeadlineExceeded(format!(
                            "operation {} {} timed out after {:?}",
                            plugin, command, self.op_timeout
                        )))
                    }
                }
            }
        }
    }

    async fn persist(&self, plugin: &str, config: Option<PluginConfig>) {
        debug!(plugin, "writing plugin configuration");
        match config {
            Some(config) => {
                self.plugin_config.replace_subtree(plugin, config);
                // Always present so the entry exists even without params.
                self.plugin_config.set(&format!("{}.enabled", plugin), true);
            }
            None => self.plugin_config.unset(plugin),
        }

        let store = self.plugin_config.clone();
        match tokio::task::spawn_blocking(move || store.write()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(plugin, error = %e, "failed persisting plugin configuration"),
            Err(e) => warn!(plugin, error = %e, "plugin configuration writer did not finish"),
        }
    }
}
