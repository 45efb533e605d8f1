//! Control-plane payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest status message accepted by the control plane, in characters.
pub const MAX_STATUS_MESSAGE_CHARS: usize = 500;

/// Terminal status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Success,
    Failed,
}

/// Body of `POST .../transfers/{id}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatusReport {
    pub status: TransferStatus,
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl TransferStatusReport {
    pub fn success(files: Vec<String>) -> Self {
        Self {
            status: TransferStatus::Success,
            files,
            status_message: None,
        }
    }

    /// A failure report; the message is truncated to fit the API limit.
    pub fn failed(files: Vec<String>, message: &str) -> Self {
        Self {
            status: TransferStatus::Failed,
            files,
            status_message: Some(truncate_status_message(message)),
        }
    }
}

/// Cuts `message` to [`MAX_STATUS_MESSAGE_CHARS`] characters.
pub fn truncate_status_message(message: &str) -> String {
    match message.char_indices().nth(MAX_STATUS_MESSAGE_CHARS) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

/// Queue connection settings handed out by the control plane.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Fully qualified namespace host, e.g. `plant.servicebus.windows.net`.
    pub service_bus_namespace: String,
    pub queue_name: String,
    /// Short-lived signed access token for the queue.
    pub shared_access_signature: String,
    /// Point in time after which the token must be refreshed.
    pub configuration_refresh_time: DateTime<Utc>,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("service_bus_namespace", &self.service_bus_namespace)
            .field("queue_name", &self.queue_name)
            .field("shared_access_signature", &"<redacted>")
            .field(
                "configuration_refresh_time",
                &self.configuration_refresh_time,
            )
            .finish()
    }
}

/// Body of `POST .../operations/{id}/uploadprograms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDestinationsRequest {
    pub filenames: Vec<String>,
}

/// Where one local file should be uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDestination {
    pub filename: String,
    pub url: String,
}
