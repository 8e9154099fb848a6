//! Plugins shipped with the agent.

pub mod core;
pub mod metrics;
pub mod ping;

use crate::error::Result;
use crate::registry::PluginRegistry;

/// Register the plugins that need nothing from the running service.
pub fn register_builtin(registry: &PluginRegistry) -> Result<()> {
    registry.register(metrics::descriptor())?;
    registry.register(ping::descriptor())?;
    Ok(())
}
