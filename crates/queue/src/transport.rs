use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::QueueError;

/// A boxed future returned by [`QueueTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub sequence_number: Option<i64>,
    pub delivery_count: u32,
    pub body: Vec<u8>,
    /// Address of the lock, used to settle the message.
    pub lock_uri: String,
}

/// Peek-lock access to a single queue.
pub trait QueueTransport: Send + Sync + 'static {
    /// Waits up to `max_wait` for the next message. `None` when the wait
    /// elapsed without one.
    fn receive(&self, max_wait: Duration) -> TransportFuture<'_, Option<ReceivedMessage>>;

    /// Removes the message from the queue.
    fn complete<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()>;

    /// Releases the lock so the message is delivered again.
    fn abandon<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()>;

    /// Moves the message to the dead-letter channel.
    fn dead_letter<'a>(
        &'a self,
        message: &'a ReceivedMessage,
        reason: &'a str,
        description: &'a str,
    ) -> TransportFuture<'a, ()>;

    /// Extends the lock held on the message.
    fn renew_lock<'a>(&'a self, message: &'a ReceivedMessage) -> TransportFuture<'a, ()>;

    /// Replaces the access credential used by subsequent requests.
    fn update_credential(&self, credential: &str);

    /// Refuses any further requests.
    fn close(&self);
}
