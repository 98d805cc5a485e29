use serde::{Deserialize, Serialize};

/// Engine error taxonomy, transportable over RPC later.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum DriftError {
    #[error("policy: {0}")]
    PolicyViolation(String),
    #[error("render: {0}")]
    Render(String),
    #[error("apply: {0}")]
    Apply(String),
    #[error("hook: {0}")]
    HookFailure(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("another operation is already in progress")]
    AlreadyRunning,
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type DriftResult<T> = Result<T, DriftError>;

impl From<anyhow::Error> for DriftError {
    fn from(e: anyhow::Error) -> Self { DriftError::Internal(format!("{:#}", e)) }
}
