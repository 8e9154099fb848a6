//! In-memory controller used by tests and by `edge-agent stub`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::client::{AgentClient, JoinClient};
use crate::error::{AgentError, Result};
use crate::plugin::Params;
use crate::protocol::{
    AgentCheckRequest, AgentJoinRequest, AgentJoinResponse, CheckResult, OperationRequest, OperationResponse,
};

/// Agent token handed out by [`StubController`] on join.
pub const STUB_AGENT_TOKEN: &str = "stub-agent-token";

pub struct StubController {
    asset_id: String,
    next_op_id: AtomicU64,
    checks: AtomicU64,
    callbacks: AtomicU64,
    failing: AtomicBool,
    pending: Mutex<VecDeque<OperationRequest>>,
    check_requests: Mutex<Vec<AgentCheckRequest>>,
    responses: Mutex<Vec<OperationResponse>>,
    joins: Mutex<Vec<AgentJoinRequest>>,
}

impl StubController {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            next_op_id: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            check_requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// Queue an operation for the next check and return its id.
    pub fn queue_operation(&self, plugin: &str, operation: &str, params: Params) -> String {
        let id = (self.next_op_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let mut op = OperationRequest::new(id.clone(), self.asset_id.clone(), plugin, operation);
        op.params = params;
        self.pending.lock().push_back(op);
        id
    }

    /// Queue a fully formed request, e.g. one addressed to another asset.
    pub fn queue_request(&self, op: OperationRequest) {
        self.pending.lock().push_back(op);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn num_checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn num_callbacks(&self) -> u64 {
        self.callbacks.load(Ordering::SeqCst)
    }

    pub fn responses(&self) -> Vec<OperationResponse> {
        self.responses.lock().clone()
    }

    pub fn responses_for(&self, operation_id: &str) -> Vec<OperationResponse> {
        self.responses
            .lock()
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect()
    }

    pub fn joins(&self) -> Vec<AgentJoinRequest> {
        self.joins.lock().clone()
    }

    pub fn last_check(&self) -> Option<AgentCheckRequest> {
        self.check_requests.lock().last().cloned()
    }

    fn fail_if_asked(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AgentError::Unavailable("controller stub failing".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentClient for StubController {
    async fn agent_check(&self, request: AgentCheckRequest) -> Result<CheckResult> {
        self.fail_if_asked()?;
        info!(asset_id = %request.asset_id, plugins = request.plugin_data.len(), "heartbeat received");
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.check_requests.lock().push(request);

        let pending_requests = self.pending.lock().drain(..).collect();
        Ok(CheckResult { pending_requests })
    }

    async fn callback_agent_operation(&self, response: OperationResponse) -> Result<()> {
        self.fail_if_asked()?;
        info!(
            operation_id = %response.operation_id,
            status = %response.status,
            info = %response.info,
            "operation callback received"
        );
        self.callbacks.fetch_add(1, Ordering::SeqCst);
        self.responses.lock().push(response);
        Ok(())
    }
}

#[async_trait]
impl JoinClient for StubController {
    async fn agent_join(&self, request: AgentJoinRequest) -> Result<AgentJoinResponse> {
        self.fail_if_asked()?;
        info!(agent_id = %request.agent_id, labels = ?request.labels, "join request received");
        self.joins.lock().push(request);
        Ok(AgentJoinResponse {
            token: STUB_AGENT_TOKEN.to_string(),
            asset_id: self.asset_id.clone(),
        })
    }
}
