//! Error taxonomy for the trim/undo core.
//!
//! Partial actuation failures are deliberately *not* represented here: they
//! travel inside [`crate::backends::AppliedResult`] and are reported on the
//! status channel, while the transition they belong to still completes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrimError {
    /// Remote data channel unreachable, or it returned malformed data
    /// (missing fields, mismatched column lengths, unknown devices).
    #[error("data unavailable: {0}")]
    Unavailable(String),

    /// The audit record could not be persisted before a trim.
    #[error("audit failure: {0}")]
    Audit(String),

    /// Invalid request for the current state, e.g. undo with no backup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The reference profile could not be pushed to the pub/sub channel.
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("IO error. cause: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error. cause: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error. cause: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrimError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        TrimError::Unavailable(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        TrimError::Configuration(msg.into())
    }
}

pub type Result<T, E = TrimError> = std::result::Result<T, E>;
