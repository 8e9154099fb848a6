//! Example plugin: echoes a message and reports how often it did so.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::plugin::{
    CommandDescriptor, CommandHandler, HeartbeatPayload, HeartbeatSource, ParamDescriptor, Params,
    Plugin, PluginConfig, PluginDescriptor,
};
use crate::protocol::PluginData;

pub const NAME: &str = "ping";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, "example ping plugin", new_ping).with_command(
        CommandDescriptor::new("ping", "echo command")
            .with_param(ParamDescriptor::optional("msg", "message to be echoed"))
            .with_param(
                ParamDescriptor::optional("sleep", "time in seconds to wait before echoing message")
                    .with_default("0"),
            ),
    )
}

fn new_ping(_config: &PluginConfig) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(Ping {
        pongs: Arc::new(AtomicU64::new(0)),
    }))
}

struct Ping {
    pongs: Arc<AtomicU64>,
}

#[derive(Debug)]
struct PingData {
    pongs: u64,
}

impl HeartbeatPayload for PingData {
    fn to_wire(&self) -> PluginData {
        PluginData {
            plugin: NAME.to_string(),
            data: json!({ "pongs": self.pongs }),
        }
    }
}

async fn ping(pongs: Arc<AtomicU64>, cancel: CancellationToken, params: Params) -> Result<String> {
    let sleep = match params.get("sleep") {
        Some(s) => s
            .parse::<u64>()
            .map_err(|_| AgentError::InvalidArgument(format!("sleep must be whole seconds, got '{}'", s)))?,
        None => 0,
    };

    if sleep > 0 {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AgentError::DeadlineExceeded("ping interrupted".to_string()));
            }
            _ = tokio::time::sleep(Duration::from_secs(sleep)) => {}
        }
    }

    pongs.fetch_add(1, Ordering::Relaxed);
    Ok(match params.get("msg") {
        Some(msg) => format!("pong {}", msg),
        None => "pong".to_string(),
    })
}

#[async_trait]
impl Plugin for Ping {
    fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        match name {
            "ping" => {
                let pongs = self.pongs.clone();
                Some(Arc::new(move |cancel: CancellationToken, params: Params| {
                    ping(pongs.clone(), cancel, params)
                }))
            }
            _ => None,
        }
    }

    fn heartbeat(&self) -> Option<&dyn HeartbeatSource> {
        Some(self)
    }
}

#[async_trait]
impl HeartbeatSource for Ping {
    async fn beat(&self, _cancel: CancellationToken) -> Result<Option<Box<dyn HeartbeatPayload>>> {
        Ok(Some(Box::new(PingData {
            pongs: self.pongs.load(Ordering::Relaxed),
        })))
    }
}
