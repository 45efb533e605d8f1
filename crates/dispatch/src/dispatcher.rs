//! Per-message transfer pipeline.
//!
//! Parses the message, validates it, runs the directional transfer under
//! the share authenticator and reports the result. Every message ends in
//! exactly one [`Outcome`], which the listener turns into a settlement.

use std::path::Path;
use std::sync::Arc;

use cnc_agent_blob_store::ObjectStore;
use cnc_agent_control_plane::ControlPlane;
use cnc_agent_file_ops::{
    DEFAULT_DELETE_PARALLELISM, delete_all, download_all, list_files, upload_all,
};
use cnc_agent_protocol::{
    TransferDirection, TransferRequest, TransferStatusReport, UploadDestinationsRequest,
};
use cnc_agent_queue::{Disposition, HandlerFuture, MessageHandler, ReceivedMessage};
use cnc_agent_share_auth::ShareAuthenticator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

/// Dead-letter reason for bodies that are not transfer requests.
pub const REASON_MALFORMED: &str = "Failed to deserialize";
/// Dead-letter reason for requests that fail validation.
pub const REASON_INVALID: &str = "Invalid";

/// Terminal state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Files moved and `Success` reported.
    Completed { files: Vec<String> },
    /// The message can never succeed.
    DeadLettered { reason: String, description: String },
    /// The transfer failed; the queue will redeliver.
    Failed { error: String },
    /// Shutdown interrupted the transfer. Nothing is reported.
    Interrupted,
}

impl From<Outcome> for Disposition {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed { .. } => Disposition::Complete,
            Outcome::DeadLettered {
                reason,
                description,
            } => Disposition::dead_letter(reason, description),
            Outcome::Failed { .. } | Outcome::Interrupted => Disposition::Abandon,
        }
    }
}

/// Carries out transfer requests received from the queue.
pub struct TransferDispatcher {
    api: Arc<dyn ControlPlane>,
    store: Arc<dyn ObjectStore>,
    auth: ShareAuthenticator,
    delete_parallelism: usize,
}

impl TransferDispatcher {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        store: Arc<dyn ObjectStore>,
        auth: ShareAuthenticator,
    ) -> Self {
        Self {
            api,
            store,
            auth,
            delete_parallelism: DEFAULT_DELETE_PARALLELISM,
        }
    }

    /// Sets how many deletions run at once when purging a share.
    pub fn with_delete_parallelism(mut self, parallelism: usize) -> Self {
        self.delete_parallelism = parallelism.max(1);
        self
    }

    /// Processes one message body through to its terminal state.
    pub async fn process(&self, body: &[u8], cancel: &CancellationToken) -> Outcome {
        let request = match TransferRequest::parse(body) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "failed to deserialize transfer request");
                return Outcome::DeadLettered {
                    reason: REASON_MALFORMED.into(),
                    description: e.to_string(),
                };
            }
        };

        if let Err(e) = request.validate() {
            error!(
                transfer_id = %request.transfer_id,
                direction = %request.direction,
                error = %e,
                "invalid transfer request"
            );
            let report = TransferStatusReport::failed(failure_files(&request), &e.to_string());
            self.report_failure(&request, &report).await;
            return Outcome::DeadLettered {
                reason: REASON_INVALID.into(),
                description: format!("Invalid message: {e}"),
            };
        }

        debug!(
            transfer_id = %request.transfer_id,
            direction = %request.direction,
            path = %request.machine_share,
            "transfer request received"
        );

        let result = self
            .auth
            .run(&request, || self.transfer(&request, cancel))
            .await;

        match result {
            Ok(files) => {
                info!(
                    transfer_id = %request.transfer_id,
                    direction = %request.direction,
                    files = files.len(),
                    "transfer completed"
                );
                Outcome::Completed { files }
            }
            Err(e) if e.is_cancelled() => {
                warn!(
                    transfer_id = %request.transfer_id,
                    direction = %request.direction,
                    "transfer interrupted by shutdown"
                );
                Outcome::Interrupted
            }
            Err(e) => {
                let message = e.to_string();
                error!(
                    transfer_id = %request.transfer_id,
                    direction = %request.direction,
                    error = %message,
                    "transfer failed"
                );
                let report = TransferStatusReport::failed(failure_files(&request), &message);
                self.report_failure(&request, &report).await;
                Outcome::Failed { error: message }
            }
        }
    }

    /// The unit of work run under the authenticator. Returns the names of
    /// the files moved once `Success` has been reported.
    async fn transfer(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DispatchError> {
        let path = Path::new(&request.machine_share);
        let files = match &request.direction {
            TransferDirection::FromCloud => self.from_cloud(request, path, cancel).await?,
            TransferDirection::ToCloud => self.to_cloud(request, path, cancel).await?,
            TransferDirection::Unknown(raw) => {
                return Err(DispatchError::UnknownDirection(raw.clone()));
            }
        };

        let report = TransferStatusReport::success(files.clone());
        self.api
            .set_transfer_status(request.transfer_id, &report)
            .await?;
        Ok(files)
    }

    async fn from_cloud(
        &self,
        request: &TransferRequest,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DispatchError> {
        if request.delete_local_files {
            delete_all(path, self.delete_parallelism, cancel).await?;
        }

        download_all(
            Arc::clone(&self.store),
            &request.files_to_download,
            path,
            cancel,
        )
        .await?;

        Ok(request.download_names())
    }

    async fn to_cloud(
        &self,
        request: &TransferRequest,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, DispatchError> {
        let filenames = list_files(path).await?;

        if !filenames.is_empty() {
            let destinations = self
                .api
                .create_upload_destinations(
                    &request.cnc_machine_operation_id,
                    &UploadDestinationsRequest {
                        filenames: filenames.clone(),
                    },
                )
                .await?;

            let missing: Vec<String> = filenames
                .iter()
                .filter(|name| !destinations.iter().any(|d| &d.filename == *name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(DispatchError::MissingDestinations(missing));
            }
            if destinations.len() != filenames.len() {
                warn!(
                    transfer_id = %request.transfer_id,
                    requested = filenames.len(),
                    returned = destinations.len(),
                    "control plane returned extra upload destinations"
                );
            }

            upload_all(Arc::clone(&self.store), path, &destinations, cancel).await?;
        }

        if request.delete_local_files {
            delete_all(path, self.delete_parallelism, cancel).await?;
        }

        Ok(filenames)
    }

    async fn report_failure(&self, request: &TransferRequest, report: &TransferStatusReport) {
        if let Err(e) = self
            .api
            .set_transfer_status(request.transfer_id, report)
            .await
        {
            error!(
                transfer_id = %request.transfer_id,
                error = %e,
                "failed to report transfer failure"
            );
        }
    }
}

/// Files named in a failure report: the requested downloads, if any.
fn failure_files(request: &TransferRequest) -> Vec<String> {
    match request.direction {
        TransferDirection::ToCloud => Vec::new(),
        _ => request.download_names(),
    }
}

impl MessageHandler for TransferDispatcher {
    fn handle<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        cancel: &'a CancellationToken,
    ) -> HandlerFuture<'a> {
        Box::pin(async move { self.process(&message.body, cancel).await.into() })
    }
}
