use std::io;
use thiserror::Error;

/// The engine's complete error taxonomy (spec.md §7).
///
/// Storage and crypto failures propagate unchanged through every layer;
/// callers map these to HTTP status codes at the boundary, not here.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("decrypt failed")]
    DecryptFailed,

    #[error("encrypt failed: {0}")]
    EncryptFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("outdated")]
    Outdated,

    #[error("update timestamp too old")]
    UpdateTimestampTooOld,

    #[error("validation failed")]
    ValidationFailed,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type VaultResult<T> = Result<T, VaultError>;

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Internal(format!("json: {e}"))
    }
}

impl From<bincode::Error> for VaultError {
    fn from(e: bincode::Error) -> Self {
        VaultError::Internal(format!("bincode: {e}"))
    }
}
