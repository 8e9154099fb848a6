//! Agent self-control from the controller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config_store::ConfigStore;
use crate::error::Result;
use crate::plugin::{CommandDescriptor, CommandHandler, Params, Plugin, PluginConfig, PluginDescriptor};
use crate::service::ServiceHandle;

pub const NAME: &str = "core";
pub const DESCRIPTION: &str = "Core agent control";

/// The core plugin acts on the given service and configuration file, so it
/// is registered once those exist.
pub fn descriptor(service: ServiceHandle, config: ConfigStore) -> PluginDescriptor {
    PluginDescriptor::new(NAME, DESCRIPTION, move |_: &PluginConfig| -> Result<Arc<dyn Plugin>> {
        Ok(Arc::new(Core {
            service: service.clone(),
            config: config.clone(),
        }))
    })
    .with_command(CommandDescriptor::new("uninstall", "stop and disable agent"))
}

struct Core {
    service: ServiceHandle,
    config: ConfigStore,
}

/// Disable the agent, remove its configuration and stop it.
async fn uninstall(service: ServiceHandle, config: ConfigStore) -> Result<String> {
    info!("Received uninstall command. Stopping and disabling agent.");

    // No heartbeats or new operations from here on.
    service.disable();
    config.delete_file()?;
    service.stop();

    Ok("agent uninstalled".to_string())
}

#[async_trait]
impl Plugin for Core {
    fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        match name {
            "uninstall" => {
                let service = self.service.clone();
                let config = self.config.clone();
                Some(Arc::new(move |_cancel: CancellationToken, _params: Params| {
                    uninstall(service.clone(), config.clone())
                }))
            }
            _ => None,
        }
    }
}
