//! Error taxonomy shared by the store, the orchestrator and the reducer.
//!
//! Tool crashes and timeouts are deliberately absent: they are outcomes of a
//! run, recorded in a `RunResult`, never errors.

use thiserror::Error;

use crate::domain::JobState;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact already exists: {0}")]
    NameCollision(String),

    #[error("Invalid artifact name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Schema error in {artifact}: {reason}")]
    Schema { artifact: String, reason: String },

    #[error("Infrastructure error: {0}")]
    Infra(String),

    #[error("Invalid job transition: {from:?} → {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Artifact {0} does not reproduce a failure and cannot be reduced")]
    NotReducible(String),

    #[error("Reduction chain {chain} belongs to a different finding: {reason}")]
    ChainMismatch { chain: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Journal error: {0}")]
    Journal(String),
}

impl Error {
    pub(crate) fn schema(artifact: impl ToString, reason: impl ToString) -> Self {
        Self::Schema {
            artifact: artifact.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is confined to one artifact and can be skipped
    pub fn is_artifact_local(&self) -> bool {
        matches!(self, Self::Schema { .. } | Self::NotFound(_))
    }
}
