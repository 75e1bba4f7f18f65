use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain adapter error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by the ledger adapters.
///
/// `get_status` never returns these: transient faults are mapped to a
/// `Pending` observation inside the adapter. They appear only on the
/// resend/replace/block-time paths, where the caller decides whether to
/// log and carry on.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Parse(String),

    #[error("Replacement transactions are not supported on {0}")]
    ReplacementUnsupported(&'static str),

    #[error("No replacer key configured")]
    NoReplacer,

    #[error("Record has no nonce, cannot build a replacement")]
    MissingNonce,

    #[error("Replacer address {replacer} cannot replace a transaction from {sender}")]
    ReplacerMismatch { replacer: String, sender: String },

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Errors from the transaction record store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No transaction record with id {0}")]
    NotFound(String),

    #[error("Status {0} is not persistable")]
    NotPersistable(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("{error:?}"))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(error: serde_json::Error) -> Self {
        ChainError::Parse(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
