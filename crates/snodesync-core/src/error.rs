use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("directory unavailable {0}")]
    DirectoryUnavailable(String),
    #[error("swarm lookup failed {0}")]
    SwarmLookupFailed(String),
    #[error("merge primitive {0}")]
    MergePrimitive(String),
    #[error("reconciliation field {0}")]
    ReconciliationField(String),
    #[error("group protocol violation {0}")]
    GroupProtocolViolation(String),
    #[error("key rotation {0}")]
    KeyRotation(String),
    #[error("storage")]
    Storage,
    #[error("transport {0}")]
    Transport(String),
    #[error("validation {0}")]
    Validation(String),
    #[error("crypto")]
    Crypto,
    #[error("not found")]
    NotFound,
}
