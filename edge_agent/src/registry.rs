//! Plugin registry: known descriptors, running instances and heartbeat
//! collection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{AgentError, Result};
use crate::plugin::{HeartbeatData, HeartbeatPayload, Params, Plugin, PluginConfig, PluginDescriptor};

static GLOBAL: Lazy<Arc<PluginRegistry>> = Lazy::new(|| Arc::new(PluginRegistry::new()));

/// Snapshot of one registry entry.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub descriptor: Arc<PluginDescriptor>,
    pub running: bool,
}

pub struct PluginRegistry {
    available: RwLock<HashMap<String, Arc<PluginDescriptor>>>,
    running: Mutex<HashMap<String, Arc<dyn Plugin>>>,
    // Serializes start/stop across their hooks.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            available: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Process-wide registry used by the binary.
    pub fn global() -> Arc<PluginRegistry> {
        GLOBAL.clone()
    }

    pub fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        let mut available = self.available.write();
        if available.contains_key(&descriptor.name) {
            return Err(AgentError::InvalidArgument(format!(
                "plugin already registered: {}",
                descriptor.name
            )));
        }
        debug!(plugin = %descriptor.name, "registered plugin");
        available.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn list_plugins(&self) -> BTreeMap<String, RegistryEntry> {
        let available = self.available.read();
        let running = self.running.lock();
        available
            .iter()
            .map(|(name, descriptor)| {
                (
                    name.clone(),
                    RegistryEntry {
                        descriptor: descriptor.clone(),
                        running: running.contains_key(name),
                    },
                )
            })
            .collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.lock().contains_key(name)
    }

    #[instrument(skip(self, config))]
    pub async fn start_plugin(&self, name: &str, config: &PluginConfig) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let descriptor = self
            .available
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("plugin not available: {}", name)))?;

        if self.is_running(name) {
            return Err(AgentError::FailedPrecondition(format!(
                "plugin already running: {}",
                name
            )));
        }

        debug!(plugin = name, config = ?config, "starting plugin");
        let instance = descriptor.factory.create(config)?;
        instance.start().await?;

        self.running.lock().insert(name.to_string(), instance);
        info!(plugin = name, "plugin started");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop_plugin(&self, name: &str) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let instance = self
            .running
            .lock()
            .remove(name)
            .ok_or_else(|| AgentError::FailedPrecondition(format!("plugin not running: {}", name)))?;

        instance.stop().await;
        info!(plugin = name, "plugin stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_plugin(&name).await {
                debug!(plugin = %name, error = %e, "plugin already gone during stop_all");
            }
        }
    }

    pub async fn execute_command(
        &self,
        cancel: CancellationToken,
        name: &str,
        command: &str,
        params: Params,
    ) -> Result<String> {
        let instance = self.running.lock().get(name).cloned();
        let Some(instance) = instance else {
            let known = self.available.read().contains_key(name);
            return Err(if known {
                AgentError::FailedPrecondition(format!("plugin not running: {}", name))
            } else {
                AgentError::NotFound(format!("plugin not available: {}", name))
            });
        };

        let handler = instance.command(command).ok_or_else(|| {
            AgentError::InvalidArgument(format!("command not available: {} {}", name, command))
        })?;

        let declared = self
            .available
            .read()
            .get(name)
            .and_then(|d| d.commands.get(command).cloned());
        let params = match declared {
            Some(descriptor) => descriptor.resolve_params(params)?,
            None => params,
        };

        handler.call(cancel, params).await
    }

    /// Run every running plugin's heartbeat concurrently until all report or
    /// `deadline` passes. Plugins that did not report in time get a
    /// `DeadlineExceeded` entry; their late results are discarded.
    pub async fn collect_heartbeat_data(
        &self,
        deadline: Instant,
    ) -> (HeartbeatData, HashMap<String, AgentError>) {
        let sources: Vec<(String, Arc<dyn Plugin>)> = self
            .running
            .lock()
            .iter()
            .filter(|(_, p)| p.heartbeat().is_some())
            .map(|(n, p)| (n.clone(), p.clone()))
            .collect();

        let accumulator = Arc::new(Mutex::new(BeatAccumulator::default()));
        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(sources.len());

        for (name, plugin) in &sources {
            let name = name.clone();
            let plugin = plugin.clone();
            let accumulator = accumulator.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move {
                let result = match plugin.heartbeat() {
                    Some(source) => source.beat(token).await,
                    None => Ok(None),
                };
                accumulator.lock().record(name, result);
            }));
        }

        let names: Vec<&str> = sources.iter().map(|(n, _)| n.as_str()).collect();
        let all_done = futures::future::join_all(tasks);
        let panicked = match tokio::time::timeout_at(deadline, all_done).await {
            Ok(joined) => joined.iter().any(|r| r.is_err()),
            Err(_) => {
                warn!("timeout collecting plugin heartbeat data");
                token.cancel();
                false
            }
        };

        let mut acc = accumulator.lock();
        acc.closed = true;
        for name in names {
            if acc.reported.contains(name) {
                continue;
            }
            let err = if panicked {
                AgentError::Internal(format!("plugin beat did not complete: {}", name))
            } else {
                AgentError::DeadlineExceeded(format!("plugin beat timed out: {}", name))
            };
            warn!(plugin = name, error = %err, "plugin heartbeat missing");
            acc.errors.insert(name.to_string(), err);
        }

        (
            HeartbeatData(std::mem::take(&mut acc.data)),
            std::mem::take(&mut acc.errors),
        )
    }
}

#[derive(Default)]
struct BeatAccumulator {
    closed: bool,
    reported: HashSet<String>,
    data: Vec<Box<dyn HeartbeatPayload>>,
    errors: HashMap<String, AgentError>,
}

impl BeatAccumulator {
    fn record(&mut self, name: String, result: Result<Option<Box<dyn HeartbeatPayload>>>) {
        if self.closed {
            return;
        }
        match result {
            Ok(Some(payload)) => self.data.push(payload),
            Ok(None) => {}
            Err(e) => {
                self.errors.insert(name.clone(), e);
            }
        }
        self.reported.insert(name);
    }
}
