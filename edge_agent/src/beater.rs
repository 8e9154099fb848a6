//! One heartbeat exchange with the controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::AgentClient;
use crate::dispatcher::Dispatcher;
use crate::protocol::AgentCheckRequest;
use crate::registry::PluginRegistry;

pub struct Beater {
    client: Arc<dyn AgentClient>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<PluginRegistry>,
    asset_id: String,
}

impl Beater {
    pub fn new(
        client: Arc<dyn AgentClient>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<PluginRegistry>,
        asset_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            registry,
            asset_id: asset_id.into(),
        }
    }

    /// Collect plugin data for at most `timeout`, send it, and dispatch the
    /// operations that come back. Returns whether the controller answered.
    pub async fn beat(&self, timeout: Duration) -> bool {
        debug!("sending heartbeat to controller");

        let (data, errors) = self
            .registry
            .collect_heartbeat_data(Instant::now() + timeout)
            .await;
        for (plugin, err) in &errors {
            warn!(%plugin, error = %err, "plugin error");
        }

        let request = AgentCheckRequest {
            asset_id: self.asset_id.clone(),
            timestamp: Utc::now().timestamp(),
            plugin_data: data.to_wire(),
        };

        let result = match self.client.agent_check(request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "failed sending heartbeat");
                return false;
            }
        };

        for op in result.pending_requests {
            if op.asset_id != self.asset_id {
                warn!(
                    operation_id = %op.operation_id,
                    asset_id = %op.asset_id,
                    "received operation with non-matching asset id"
                );
                continue;
            }
            self.dispatcher.dispatch(op);
        }

        true
    }
}
