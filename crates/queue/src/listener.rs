//! Queue listener: receive loops, settlement and credential rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cnc_agent_protocol::{AgentConfig, Backoff};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::QueueError;
use crate::handler::{Disposition, ErrorHandler, ErrorSource, MessageHandler, ProcessErrorEvent};
use crate::servicebus::ServiceBusTransport;
use crate::transport::{QueueTransport, ReceivedMessage};

const MIN_LOCK_RENEWAL: Duration = Duration::from_millis(100);

/// Transport used to reach the queue service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Https,
    /// Plain HTTP, for local emulators.
    Http,
}

impl TransportType {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Https => "https",
            Self::Http => "http",
        }
    }
}

/// Process-side listener settings, fixed for the lifetime of the agent.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub transport: TransportType,
    /// Messages processed concurrently.
    pub max_concurrent_calls: usize,
    /// Server-side wait of one receive call.
    pub receive_wait: Duration,
    /// Dead-letter entity; `<queue>-deadletter` when unset.
    pub dead_letter_queue: Option<String>,
    /// How often the lock on a message being handled is renewed. Must be
    /// shorter than the queue's lock duration.
    pub lock_renewal: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            transport: TransportType::default(),
            max_concurrent_calls: 1,
            receive_wait: Duration::from_secs(30),
            dead_letter_queue: None,
            lock_renewal: Duration::from_secs(20),
        }
    }
}

/// Everything needed to bind a listener to its queue.
#[derive(Clone)]
pub struct ListenerConfig {
    pub namespace: String,
    pub queue_name: String,
    /// Signed access token.
    pub credential: String,
    pub transport: TransportType,
    pub max_concurrent_calls: usize,
    pub receive_wait: Duration,
    pub dead_letter_queue: Option<String>,
    pub lock_renewal: Duration,
    /// When the credential should be refreshed.
    pub refresh_at: DateTime<Utc>,
}

impl std::fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("namespace", &self.namespace)
            .field("queue_name", &self.queue_name)
            .field("credential", &"<redacted>")
            .field("transport", &self.transport)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .field("receive_wait", &self.receive_wait)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("lock_renewal", &self.lock_renewal)
            .field("refresh_at", &self.refresh_at)
            .finish()
    }
}

impl ListenerConfig {
    /// Combines control-plane settings with the local ones.
    pub fn from_agent_config(config: &AgentConfig, settings: &ListenerSettings) -> Self {
        Self {
            namespace: config.service_bus_namespace.clone(),
            queue_name: config.queue_name.clone(),
            credential: config.shared_access_signature.clone(),
            transport: settings.transport,
            max_concurrent_calls: settings.max_concurrent_calls.max(1),
            receive_wait: settings.receive_wait,
            dead_letter_queue: settings.dead_letter_queue.clone(),
            lock_renewal: settings.lock_renewal,
            refresh_at: config.configuration_refresh_time,
        }
    }
}

/// State shared by the receive loops.
struct Shared {
    namespace: String,
    queue_name: String,
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    errors: Arc<dyn ErrorHandler>,
    receive_wait: Duration,
    lock_renewal: Duration,
    backoff: Backoff,
}

impl Shared {
    fn report(&self, source: ErrorSource, error: &QueueError) {
        self.errors.on_error(&ProcessErrorEvent {
            source,
            namespace: &self.namespace,
            entity_path: &self.queue_name,
            error,
        });
    }
}

#[derive(Default)]
struct Running {
    cancel: Option<CancellationToken>,
    tasks: Option<JoinSet<()>>,
}

/// Listener bound to one queue.
pub struct QueueListener {
    identifier: String,
    shared: Arc<Shared>,
    max_concurrent_calls: usize,
    running: Mutex<Running>,
    disposed: AtomicBool,
}

impl QueueListener {
    /// Creates a listener backed by the Service Bus REST transport.
    pub fn create(
        config: &ListenerConfig,
        handler: Arc<dyn MessageHandler>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Result<Self, QueueError> {
        let transport = ServiceBusTransport::new(config)?;
        Ok(Self::with_transport(config, Arc::new(transport), handler, errors))
    }

    /// Creates a listener over any transport.
    pub fn with_transport(
        config: &ListenerConfig,
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        Self {
            identifier: format!("cnc-agent-{}", config.queue_name),
            shared: Arc::new(Shared {
                namespace: config.namespace.clone(),
                queue_name: config.queue_name.clone(),
                transport,
                handler,
                errors,
                receive_wait: config.receive_wait,
                lock_renewal: config.lock_renewal.max(MIN_LOCK_RENEWAL),
                backoff: Backoff::default(),
            }),
            max_concurrent_calls: config.max_concurrent_calls.max(1),
            running: Mutex::new(Running::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Overrides the delay policy used after receive failures.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.backoff = backoff;
        }
        self
    }

    /// Stable name of this subscription, kept across reconfiguration.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Starts the receive loops. They stop when `cancel` fires or the
    /// listener is disposed.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.tasks.is_some() {
            return Err(QueueError::AlreadyStarted);
        }

        let token = cancel.child_token();
        let mut tasks = JoinSet::new();
        for slot in 0..self.max_concurrent_calls {
            tasks.spawn(run_slot(Arc::clone(&self.shared), slot, token.clone()));
        }
        running.cancel = Some(token);
        running.tasks = Some(tasks);

        info!(
            listener = %self.identifier,
            namespace = %self.shared.namespace,
            queue = %self.shared.queue_name,
            slots = self.max_concurrent_calls,
            "queue listener started"
        );
        Ok(())
    }

    /// Swaps the access credential in place. Receive loops and messages in
    /// flight are not touched; the next request uses the new credential.
    pub fn reconfigure(&self, config: &ListenerConfig) -> Result<(), QueueError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if config.namespace != self.shared.namespace || config.queue_name != self.shared.queue_name
        {
            warn!(
                listener = %self.identifier,
                namespace = %config.namespace,
                queue = %config.queue_name,
                "queue address changed on refresh; only the credential is applied"
            );
        }
        self.shared.transport.update_credential(&config.credential);
        info!(
            listener = %self.identifier,
            refresh_at = %config.refresh_at,
            "queue credential rotated"
        );
        Ok(())
    }

    /// Stops the receive loops, waits for in-flight messages to settle and
    /// closes the transport. Only the first call has any effect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (cancel, tasks) = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            (running.cancel.take(), running.tasks.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(mut tasks) = tasks {
            while let Some(done) = tasks.join_next().await {
                if let Err(e) = done {
                    warn!(listener = %self.identifier, error = %e, "receive loop ended abnormally");
                }
            }
        }

        self.shared.transport.close();
        info!(listener = %self.identifier, "queue listener disposed");
    }
}

impl Drop for QueueListener {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Not disposed: stop the loops without waiting. Dropping the
        // JoinSet aborts whatever is still running.
        let running = self.running.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(cancel) = running.cancel.take() {
            cancel.cancel();
        }
        running.tasks.take();
        self.shared.transport.close();
    }
}

/// One receive loop: receive, handle, settle, repeat.
async fn run_slot(shared: Arc<Shared>, slot: usize, cancel: CancellationToken) {
    let mut failures = 0u32;

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = shared.transport.receive(shared.receive_wait) => received,
        };

        let message = match received {
            Ok(Some(message)) => {
                failures = 0;
                message
            }
            Ok(None) => {
                failures = 0;
                continue;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                shared.report(ErrorSource::Receive, &e);
                let delay = shared.backoff.delay_for_attempt(failures);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        debug!(
            slot,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "message received"
        );

        let disposition = handle_with_renewal(&shared, &message, &cancel).await;
        let (source, settled) = match &disposition {
            Disposition::Complete => (
                ErrorSource::Complete,
                shared.transport.complete(&message).await,
            ),
            Disposition::Abandon => (
                ErrorSource::Abandon,
                shared.transport.abandon(&message).await,
            ),
            Disposition::DeadLetter {
                reason,
                description,
            } => (
                ErrorSource::DeadLetter,
                shared
                    .transport
                    .dead_letter(&message, reason, description)
                    .await,
            ),
        };
        if let Err(e) = settled {
            shared.report(source, &e);
        }
    }

    debug!(slot, queue = %shared.queue_name, "receive loop stopped");
}

/// Runs the handler, renewing the message lock until it returns.
async fn handle_with_renewal(
    shared: &Shared,
    message: &ReceivedMessage,
    cancel: &CancellationToken,
) -> Disposition {
    let mut handling = shared.handler.handle(message, cancel);
    let period = shared.lock_renewal;
    let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            disposition = &mut handling => return disposition,
            _ = renewal.tick() => {
                match shared.transport.renew_lock(message).await {
                    Ok(()) => debug!(message_id = %message.message_id, "message lock renewed"),
                    Err(e) => shared.report(ErrorSource::RenewLock, &e),
                }
            }
        }
    }
}

/// Builds listeners for freshly fetched configurations.
pub trait ListenerFactory: Send + Sync {
    fn create(&self, config: &ListenerConfig) -> Result<QueueListener, QueueError>;
}

/// [`ListenerFactory`] producing Service Bus listeners with fixed callbacks.
pub struct ServiceBusListenerFactory {
    handler: Arc<dyn MessageHandler>,
    errors: Arc<dyn ErrorHandler>,
}

impl ServiceBusListenerFactory {
    pub fn new(handler: Arc<dyn MessageHandler>, errors: Arc<dyn ErrorHandler>) -> Self {
        Self { handler, errors }
    }
}

impl ListenerFactory for ServiceBusListenerFactory {
    fn create(&self, config: &ListenerConfig) -> Result<QueueListener, QueueError> {
        QueueListener::create(config, Arc::clone(&self.handler), Arc::clone(&self.errors))
    }
}
