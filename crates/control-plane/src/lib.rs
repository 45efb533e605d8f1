//! Client side of the control-plane API.
//!
//! The agent only needs three calls: fetch the queue connection settings,
//! report the outcome of a transfer, and obtain upload destinations for a
//! machine operation. [`ControlPlane`] is the seam the rest of the agent is
//! written against; [`ApiClient`] is the HTTP implementation.

mod client;

use std::future::Future;
use std::pin::Pin;

use cnc_agent_protocol::{
    AgentConfig, TransferStatusReport, UploadDestination, UploadDestinationsRequest,
};
use uuid::Uuid;

pub use client::ApiClient;

/// A boxed future returned by [`ControlPlane`] methods.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Errors from the control-plane API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid API token")]
    InvalidToken,

    #[error("invalid base URL {0:?}")]
    InvalidBaseUrl(String),
}

impl ApiError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Api { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

/// Operations the agent performs against the control plane.
pub trait ControlPlane: Send + Sync {
    /// Fetches the queue connection settings for this agent.
    fn get_queue_config<'a>(
        &'a self,
        agent_id: &'a str,
        agent_version: &'a str,
    ) -> ApiFuture<'a, AgentConfig>;

    /// Reports the terminal outcome of a transfer.
    fn set_transfer_status<'a>(
        &'a self,
        transfer_id: Uuid,
        report: &'a TransferStatusReport,
    ) -> ApiFuture<'a, ()>;

    /// Requests one upload destination per file name.
    fn create_upload_destinations<'a>(
        &'a self,
        machine_operation_id: &'a str,
        request: &'a UploadDestinationsRequest,
    ) -> ApiFuture<'a, Vec<UploadDestination>>;
}
