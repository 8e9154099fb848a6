//! Messages exchanged with the controller.
//!
//! These types are the wire contract: field names and the status spelling are
//! what the controller sees, so they are serialized as-is.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Status reported for an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    Scheduled,
    Success,
    Fail,
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpStatus::Scheduled => "SCHEDULED",
            OpStatus::Success => "SUCCESS",
            OpStatus::Fail => "FAIL",
        };
        f.write_str(s)
    }
}

/// A remotely requested action naming a plugin and one of its commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRequest {
    pub operation_id: String,
    pub asset_id: String,
    pub plugin: String,
    pub operation: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl OperationRequest {
    pub fn new(
        operation_id: impl Into<String>,
        asset_id: impl Into<String>,
        plugin: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            asset_id: asset_id.into(),
            plugin: plugin.into(),
            operation: operation.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Status update for an operation. Several may be sent for the same
/// operation id; they are told apart only by arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationResponse {
    pub operation_id: String,
    pub asset_id: String,
    pub timestamp: i64,
    pub status: OpStatus,
    #[serde(default)]
    pub info: String,
}

impl OperationResponse {
    pub fn for_request(op: &OperationRequest, status: OpStatus, info: impl Into<String>) -> Self {
        Self {
            operation_id: op.operation_id.clone(),
            asset_id: op.asset_id.clone(),
            timestamp: Utc::now().timestamp(),
            status,
            info: info.into(),
        }
    }
}

/// Opaque per-plugin heartbeat payload as sent to the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginData {
    pub plugin: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCheckRequest {
    pub asset_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub plugin_data: Vec<PluginData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    #[serde(default)]
    pub pending_requests: Vec<OperationRequest>,
}

/// Enrollment request sent with a one-time join token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentJoinRequest {
    pub agent_id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Credentials the agent keeps after joining.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentJoinResponse {
    pub token: String,
    pub asset_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_wire_spelling() {
        assert_eq!(serde_json::to_value(OpStatus::Scheduled).unwrap(), json!("SCHEDULED"));
        assert_eq!(serde_json::to_value(OpStatus::Fail).unwrap(), json!("FAIL"));
        let parsed: OpStatus = serde_json::from_value(json!("SUCCESS")).unwrap();
        assert_eq!(parsed, OpStatus::Success);
    }

    #[test]
    fn request_params_default_to_empty() {
        let op: OperationRequest = serde_json::from_value(json!({
            "operation_id": "op-1",
            "asset_id": "asset",
            "plugin": "ping",
            "operation": "ping"
        }))
        .unwrap();
        assert!(op.params.is_empty());
    }

    #[test]
    fn response_echoes_request_ids() {
        let op = OperationRequest::new("op-7", "asset-1", "ping", "ping");
        let res = OperationResponse::for_request(&op, OpStatus::Scheduled, "");
        assert_eq!(res.operation_id, "op-7");
        assert_eq!(res.asset_id, "asset-1");
        assert!((res.timestamp - Utc::now().timestamp()).abs() <= 1);
    }
}
