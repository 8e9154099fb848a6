//! Controller client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::protocol::{AgentCheckRequest, AgentJoinRequest, AgentJoinResponse, CheckResult, OperationResponse};

pub const CHECK_PATH: &str = "/agent/check";
pub const CALLBACK_PATH: &str = "/agent/callback";
pub const JOIN_PATH: &str = "/agent/join";

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Report liveness and plugin data; returns operations waiting for us.
    async fn agent_check(&self, request: AgentCheckRequest) -> Result<CheckResult>;

    async fn callback_agent_operation(&self, response: OperationResponse) -> Result<()>;
}

/// Enrollment, authenticated with a join token instead of the agent token.
#[async_trait]
pub trait JoinClient: Send + Sync {
    async fn agent_join(&self, request: AgentJoinRequest) -> Result<AgentJoinResponse>;
}

/// JSON-over-HTTP client authenticated with a bearer token.
pub struct HttpAgentClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpAgentClient {
    pub fn new(address: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Internal(format!("failed creating controller client: {}", e)))?;

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "controller request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, text));
        }

        Ok(response.json().await?)
    }
}

fn status_error(status: StatusCode, body: String) -> AgentError {
    let msg = format!("controller returned {}: {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::FailedPrecondition(msg),
        StatusCode::NOT_FOUND => AgentError::NotFound(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AgentError::DeadlineExceeded(msg),
        s if s.is_client_error() => AgentError::InvalidArgument(msg),
        _ => AgentError::Unavailable(msg),
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn agent_check(&self, request: AgentCheckRequest) -> Result<CheckResult> {
        self.post(CHECK_PATH, &request).await
    }

    async fn callback_agent_operation(&self, response: OperationResponse) -> Result<()> {
        let _: serde_json::Value = self.post(CALLBACK_PATH, &response).await?;
        Ok(())
    }
}

#[async_trait]
impl JoinClient for HttpAgentClient {
    async fn agent_join(&self, request: AgentJoinRequest) -> Result<AgentJoinResponse> {
        self.post(JOIN_PATH, &request).await
    }
}
