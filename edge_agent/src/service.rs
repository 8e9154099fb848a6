//! The agent's main loop.
//!
//! [`Service::run`] beats once right away and then once per interval until
//! stopped through a [`ServiceHandle`]. A handle can also disable the service,
//! which keeps the process up but stops all controller traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use toml::Value;
use tracing::{debug, error, info, warn};

use crate::beater::Beater;
use crate::client::AgentClient;
use crate::config_store::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::error::{AgentError, Result};
use crate::registry::PluginRegistry;
use crate::settings::Settings;
use crate::worker::Worker;

pub const PLUGINS_PREFIX: &str = "plugins";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Disabled,
    Stopped,
}

struct Shared {
    state: Mutex<ServiceState>,
    stop: CancellationToken,
    disabled: AtomicBool,
    last_beat: Mutex<Option<Instant>>,
    interval: Duration,
}

#[derive(Clone)]
pub struct ServiceHandle {
    shared: Arc<Shared>,
}

impl ServiceHandle {
    /// Ask the loop to exit after the tick in progress.
    pub fn stop(&self) {
        debug!("service stop requested");
        self.shared.stop.cancel();
    }

    /// Stop heartbeats and new operations without exiting.
    pub fn disable(&self) {
        info!("disabling agent");
        self.shared.disabled.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if *state == ServiceState::Running {
            *state = ServiceState::Disabled;
        }
    }

    /// Whether the last successful beat is less than two intervals old.
    /// A disabled agent counts as alive.
    pub fn alive(&self) -> bool {
        if self.shared.disabled.load(Ordering::SeqCst) {
            return true;
        }
        match *self.shared.last_beat.lock() {
            Some(at) => at.elapsed() < 2 * self.shared.interval,
            None => false,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.shared.state.lock()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle").field("state", &self.state()).finish()
    }
}

pub struct Service {
    settings: Settings,
    client: Arc<dyn AgentClient>,
    registry: Arc<PluginRegistry>,
    config: ConfigStore,
    shared: Arc<Shared>,
}

impl Service {
    pub fn new(
        settings: Settings,
        client: Arc<dyn AgentClient>,
        registry: Arc<PluginRegistry>,
        config: ConfigStore,
    ) -> Self {
        let interval = settings.agent.interval();
        Self {
            settings,
            client,
            registry,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ServiceState::Idle),
                stop: CancellationToken::new(),
                disabled: AtomicBool::new(false),
                last_beat: Mutex::new(None),
                interval,
            }),
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shared: self.shared.clone(),
        }
    }

    /// Start every plugin marked `enabled` in the persisted configuration.
    /// Failures are logged and do not prevent the others from starting.
    pub async fn restart_plugins(&self) {
        let plugins = match self.config.get(PLUGINS_PREFIX) {
            Some(Value::Table(plugins)) => plugins,
            _ => return,
        };

        for (name, entry) in plugins {
            let Value::Table(config) = entry else {
                continue;
            };
            if config.get("enabled").and_then(Value::as_bool) != Some(true) {
                continue;
            }
            match self.registry.start_plugin(&name, &config).await {
                Ok(()) => info!(plugin = %name, "restarted plugin"),
                Err(e) => error!(plugin = %name, error = %e, "failed restarting plugin"),
            }
        }
    }

    fn log_plugins(&self) {
        for (name, entry) in self.registry.list_plugins() {
            info!(
                %name,
                description = %entry.descriptor.description,
                running = entry.running,
                "plugin loaded"
            );
        }
    }

    pub async fn run(&self) -> Result<()> {
        self.settings.validate_joined()?;
        {
            let mut state = self.shared.state.lock();
            if *state != ServiceState::Idle {
                return Err(AgentError::FailedPrecondition(format!(
                    "service cannot run from state {:?}",
                    *state
                )));
            }
            *state = if self.shared.disabled.load(Ordering::SeqCst) {
                ServiceState::Disabled
            } else {
                ServiceState::Running
            };
        }

        let agent = &self.settings.agent;
        info!(
            asset_id = %agent.asset_id,
            controller = %self.settings.controller.address,
            interval_ms = agent.interval_ms,
            opqueue_len = agent.opqueue_len,
            "starting agent"
        );

        self.log_plugins();
        self.restart_plugins().await;

        let worker = Worker::new(
            self.registry.clone(),
            self.config.sub_config(PLUGINS_PREFIX),
            agent.op_timeout(),
        );
        let dispatcher = Arc::new(Dispatcher::new(self.client.clone(), worker, agent.opqueue_len));
        let beater = Beater::new(
            self.client.clone(),
            dispatcher.clone(),
            self.registry.clone(),
            agent.asset_id.clone(),
        );

        let beat_timeout = self.shared.interval / 2;
        let mut ticker = tokio::time::interval(self.shared.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shared.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if self.shared.disabled.load(Ordering::SeqCst) {
                        continue;
                    }
                    if beater.beat(beat_timeout).await {
                        *self.shared.last_beat.lock() = Some(Instant::now());
                    }
                }
            }
        }

        info!("stopping agent");
        let stopped = dispatcher.stop(agent.shutdown_timeout()).await;
        if let Err(e) = &stopped {
            warn!(error = %e, "dispatcher did not stop cleanly");
        }
        self.registry.stop_all().await;

        *self.shared.state.lock() = ServiceState::Stopped;
        info!("agent stopped");
        stopped
    }
}
