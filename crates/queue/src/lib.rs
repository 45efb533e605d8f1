//! Queue listener for the transfer agent.
//!
//! A [`QueueListener`] binds one queue through a [`QueueTransport`], runs a
//! fixed number of receive loops, hands each message to a
//! [`MessageHandler`] and settles it according to the returned
//! [`Disposition`]. Transport failures go to an [`ErrorHandler`]. The
//! access credential can be swapped in place with
//! [`QueueListener::reconfigure`] while messages are in flight.

mod credential;
mod handler;
mod listener;
mod servicebus;
mod transport;

pub use credential::SasCredential;
pub use handler::{
    Disposition, ErrorHandler, ErrorSource, HandlerFuture, LoggingErrorHandler, MessageHandler,
    ProcessErrorEvent,
};
pub use listener::{
    ListenerConfig, ListenerFactory, ListenerSettings, QueueListener, ServiceBusListenerFactory,
    TransportType,
};
pub use servicebus::ServiceBusTransport;
pub use transport::{QueueTransport, ReceivedMessage, TransportFuture};

/// Errors produced by the queue transport and listener.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid access credential")]
    InvalidCredential,

    #[error("malformed broker properties: {0}")]
    BrokerProperties(#[from] serde_json::Error),

    #[error("received message has no lock location")]
    MissingLockLocation,

    #[error("message completed but not copied to the dead-letter queue: {0}")]
    DeadLetterCopy(Box<QueueError>),

    #[error("listener already started")]
    AlreadyStarted,

    #[error("listener closed")]
    Closed,
}
