//! Domain-level error taxonomy for Apex.

/// Apex domain errors.
#[derive(Debug, thiserror::Error)]
pub enum ApexError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("audit chain error: {0}")]
    Audit(String),

    #[error("git error: {0}")]
    GitError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] apex_store::StoreError),
}

/// Result type for Apex domain operations.
pub type Result<T> = std::result::Result<T, ApexError>;
