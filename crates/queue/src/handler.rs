//! Callbacks invoked by the listener.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::QueueError;
use crate::transport::ReceivedMessage;

/// What to do with a message once its handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove it from the queue.
    Complete,
    /// Not processed; let the queue deliver it again.
    Abandon,
    /// Can never be processed; move it to the dead-letter channel.
    DeadLetter { reason: String, description: String },
}

impl Disposition {
    pub fn dead_letter(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: reason.into(),
            description: description.into(),
        }
    }
}

/// A boxed future returned by [`MessageHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Disposition> + Send + 'a>>;

/// Processes one received message.
///
/// Handlers never fail: every outcome is expressed as a [`Disposition`].
/// `cancel` fires when the listener is shutting down; a handler that
/// cannot finish should return [`Disposition::Abandon`].
pub trait MessageHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        cancel: &'a CancellationToken,
    ) -> HandlerFuture<'a>;
}

/// Stage of message processing where a transport error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Receive,
    Complete,
    Abandon,
    DeadLetter,
    RenewLock,
}

/// A transport failure reported to the [`ErrorHandler`].
#[derive(Debug)]
pub struct ProcessErrorEvent<'a> {
    pub source: ErrorSource,
    pub namespace: &'a str,
    pub entity_path: &'a str,
    pub error: &'a QueueError,
}

/// Receives transport-level failures. Must not fail or block.
pub trait ErrorHandler: Send + Sync + 'static {
    fn on_error(&self, event: &ProcessErrorEvent<'_>);
}

/// [`ErrorHandler`] that logs every event.
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, event: &ProcessErrorEvent<'_>) {
        tracing::error!(
            source = ?event.source,
            namespace = %event.namespace,
            entity = %event.entity_path,
            error = %event.error,
            "message handling error"
        );
    }
}
