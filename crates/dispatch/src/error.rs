//! Dispatch error types.

use cnc_agent_control_plane::ApiError;
use cnc_agent_file_ops::FileOpsError;
use cnc_agent_share_auth::AuthError;

/// Errors produced while carrying out a transfer.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("control plane error: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Files(#[from] FileOpsError),

    #[error("share authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("unknown transfer direction {0:?}")]
    UnknownDirection(String),

    #[error("no upload destination returned for {}", .0.join(", "))]
    MissingDestinations(Vec<String>),
}

impl DispatchError {
    /// Whether the error is the result of shutdown rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Files(FileOpsError::Cancelled))
    }
}
