use thiserror::Error;

/// Failure taxonomy shared by the registry, worker, dispatcher and service.
///
/// Variants carry a human-readable message only; the message is what ends up
/// in a FAIL operation response, so keep it short and controller-friendly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, AgentError::DeadlineExceeded(_))
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::DeadlineExceeded(err.to_string())
        } else if err.is_connect() || err.is_request() {
            AgentError::Unavailable(err.to_string())
        } else {
            AgentError::Internal(err.to_string())
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AgentError::NotFound(err.to_string()),
            _ => AgentError::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
