//! Plugin capability set and descriptors.
//!
//! A plugin is described once at startup by a [`PluginDescriptor`] and
//! instantiated by its [`PluginFactory`] when started. Instances expose their
//! commands through [`Plugin::command`]; plugins that contribute heartbeat
//! data additionally return a [`HeartbeatSource`] from [`Plugin::heartbeat`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::protocol::PluginData;

/// Command parameters as received from the controller.
pub type Params = HashMap<String, String>;

/// Configuration handed to a plugin factory.
pub type PluginConfig = toml::Table;

/// Commands handled by the worker instead of the plugin.
pub const START_COMMAND: &str = "start";
pub const STOP_COMMAND: &str = "stop";

#[async_trait]
pub trait Plugin: Send + Sync {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Handler for `name`, or `None` if the plugin has no such command.
    fn command(&self, _name: &str) -> Option<Arc<dyn CommandHandler>> {
        None
    }

    fn heartbeat(&self) -> Option<&dyn HeartbeatSource> {
        None
    }
}

#[async_trait]
pub trait HeartbeatSource: Send + Sync {
    /// Produce this round's payload. `Ok(None)` means nothing to report.
    async fn beat(&self, cancel: CancellationToken) -> Result<Option<Box<dyn HeartbeatPayload>>>;
}

pub trait HeartbeatPayload: Send + Sync + fmt::Debug {
    fn to_wire(&self) -> PluginData;
}

/// Payloads from one collection round, in completion order.
#[derive(Debug, Default)]
pub struct HeartbeatData(pub Vec<Box<dyn HeartbeatPayload>>);

impl HeartbeatData {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_wire(&self) -> Vec<PluginData> {
        self.0.iter().map(|d| d.to_wire()).collect()
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, cancel: CancellationToken, params: Params) -> Result<String>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CancellationToken, Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send,
{
    async fn call(&self, cancel: CancellationToken, params: Params) -> Result<String> {
        (self)(cancel, params).await
    }
}

pub trait PluginFactory: Send + Sync {
    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn Plugin>>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginConfig) -> Result<Arc<dyn Plugin>> + Send + Sync,
{
    fn create(&self, config: &PluginConfig) -> Result<Arc<dyn Plugin>> {
        (self)(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default: Option<String>,
}

impl ParamDescriptor {
    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            default: None,
        }
    }

    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::optional(name, description)
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    pub description: String,
    pub params: BTreeMap<String, ParamDescriptor>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, param: ParamDescriptor) -> Self {
        self.params.insert(param.name.clone(), param);
        self
    }

    /// Fill in defaults and reject missing required parameters.
    pub fn resolve_params(&self, mut params: Params) -> Result<Params> {
        for param in self.params.values() {
            if params.contains_key(&param.name) {
                continue;
            }
            match (&param.default, param.required) {
                (Some(default), _) => {
                    params.insert(param.name.clone(), default.clone());
                }
                (None, true) => {
                    return Err(AgentError::InvalidArgument(format!(
                        "missing required parameter '{}' for command '{}'",
                        param.name, self.name
                    )));
                }
                (None, false) => {}
            }
        }
        Ok(params)
    }
}

pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub factory: Arc<dyn PluginFactory>,
    pub commands: BTreeMap<String, CommandDescriptor>,
}

impl PluginDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        factory: impl PluginFactory + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            factory: Arc::new(factory),
            commands: BTreeMap::new(),
        }
    }

    pub fn with_command(mut self, command: CommandDescriptor) -> Self {
        self.commands.insert(command.name.clone(), command);
        self
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build a plugin configuration from string parameters.
pub fn config_from_params(params: &Params) -> PluginConfig {
    params
        .iter()
        .map(|(k, v)| (k.clone(), toml::Value::String(v.clone())))
        .collect()
}
