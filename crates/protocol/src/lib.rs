//! Wire types shared by every part of the CNC transfer agent.
//!
//! Transfer requests arrive as PascalCase JSON in queue message bodies;
//! everything exchanged with the control-plane API is camelCase JSON.

pub mod messages;
pub mod retry;
pub mod types;
pub mod validation;

// Re-export primary types for convenience.
pub use messages::{
    AgentConfig, MAX_STATUS_MESSAGE_CHARS, TransferStatus, TransferStatusReport,
    UploadDestination, UploadDestinationsRequest, truncate_status_message,
};
pub use retry::Backoff;
pub use types::{Credentials, RemoteFile, TransferDirection, TransferRequest};
pub use validation::{ValidationError, validate_file_name};

/// Errors produced while decoding wire payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),
}
