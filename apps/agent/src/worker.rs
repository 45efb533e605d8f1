//! Worker loop: keeps one queue listener running with a fresh credential.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cnc_agent_control_plane::{ApiError, ControlPlane};
use cnc_agent_queue::{ListenerConfig, ListenerFactory, ListenerSettings, QueueError, QueueListener};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Refreshes closer than this to the deadline happen immediately.
pub const REFRESH_GUARD: Duration = Duration::from_secs(5);

/// Failures that stop the agent.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to fetch queue configuration: {0}")]
    Config(#[from] ApiError),

    #[error("queue listener error: {0}")]
    Listener(#[from] QueueError),
}

pub struct Worker {
    api: Arc<dyn ControlPlane>,
    factory: Arc<dyn ListenerFactory>,
    settings: ListenerSettings,
    agent_id: String,
    agent_version: String,
}

impl Worker {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        factory: Arc<dyn ListenerFactory>,
        settings: ListenerSettings,
        agent_id: impl Into<String>,
        agent_version: impl Into<String>,
    ) -> Self {
        Self {
            api,
            factory,
            settings,
            agent_id: agent_id.into(),
            agent_version: agent_version.into(),
        }
    }

    /// Runs until `cancel` fires (`Ok`) or something unrecoverable happens.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), WorkerError> {
        let Some(config) = self.fetch(cancel).await? else {
            return Ok(());
        };

        let listener = self.factory.create(&config)?;
        let result = self.listen(&listener, config, cancel).await;
        listener.dispose().await;
        result
    }

    async fn listen(
        &self,
        listener: &QueueListener,
        mut config: ListenerConfig,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        listener.start(cancel)?;
        info!(
            listener = %listener.identifier(),
            queue = %config.queue_name,
            next_refresh = %config.refresh_at,
            "listening for transfer requests"
        );

        loop {
            if let Some(wait) = delay_until(config.refresh_at, Utc::now()) {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let Some(next) = self.fetch(cancel).await? else {
                return Ok(());
            };
            listener.reconfigure(&next)?;
            info!(next_refresh = %next.refresh_at, "queue configuration refreshed");
            config = next;
        }
    }

    /// Fetches the current configuration; `None` when cancelled first.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<ListenerConfig>, WorkerError> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            fetched = self.api.get_queue_config(&self.agent_id, &self.agent_version) => fetched?,
        };
        Ok(Some(ListenerConfig::from_agent_config(&fetched, &self.settings)))
    }
}

/// Time to sleep before refreshing, or `None` to refresh now.
fn delay_until(refresh_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    let remaining = (refresh_at - now).to_std().ok()?;
    (remaining > REFRESH_GUARD).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeDelta;
    use cnc_agent_control_plane::ApiFuture;
    use cnc_agent_protocol::{
        AgentConfig, TransferStatusReport, UploadDestination, UploadDestinationsRequest,
    };
    use cnc_agent_queue::{
        Disposition, HandlerFuture, LoggingErrorHandler, MessageHandler, QueueTransport,
        ReceivedMessage, TransportFuture,
    };
    use uuid::Uuid;

    /// Hands out queued configurations, then blocks forever.
    #[derive(Default)]
    struct MockApi {
        configs: Mutex<VecDeque<Result<AgentConfig, ApiError>>>,
        fetches: AtomicUsize,
    }

    impl MockApi {
        fn new(configs: Vec<Result<AgentConfig, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                configs: Mutex::new(configs.into()),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    impl ControlPlane for MockApi {
        fn get_queue_config<'a>(
            &'a self,
            agent_id: &'a str,
            _agent_version: &'a str,
        ) -> ApiFuture<'a, AgentConfig> {
            Box::pin(async move {
                assert_eq!(agent_id, "mill-01");
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let next = self.configs.lock().unwrap().pop_front();
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }

        fn set_transfer_status<'a>(
            &'a self,
            _transfer_id: Uuid,
            _report: &'a TransferStatusReport,
        ) -> ApiFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn create_upload_destinations<'a>(
            &'a self,
            _machine_operation_id: &'a str,
            _request: &'a UploadDestinationsRequest,
        ) -> ApiFuture<'a, Vec<UploadDestination>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    #[derive(Default)]
    struct Recorder {
        credentials: Mutex<Vec<String>>,
        closes: AtomicUsize,
        created: AtomicUsize,
    }

    /// A queue that never delivers anything.
    struct IdleTransport(Arc<Recorder>);

    impl QueueTransport for IdleTransport {
        fn receive(&self, max_wait: Duration) -> TransportFuture<'_, Option<ReceivedMessage>> {
            Box::pin(async move {
                tokio::time::sleep(max_wait).await;
                Ok(None)
            })
        }

        fn complete<'a>(&'a self, _message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn abandon<'a>(&'a self, _message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn dead_letter<'a>(
            &'a self,
            _message: &'a ReceivedMessage,
            _reason: &'a str,
            _description: &'a str,
        ) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn renew_lock<'a>(&'a self, _message: &'a ReceivedMessage) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn update_credential(&self, credential: &str) {
            self.0.credentials.lock().unwrap().push(credential.to_string());
        }

        fn close(&self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Accept;

    impl MessageHandler for Accept {
        fn handle<'a>(
            &'a self,
            _message: &'a ReceivedMessage,
            _cancel: &'a CancellationToken,
        ) -> HandlerFuture<'a> {
            Box::pin(async { Disposition::Complete })
        }
    }

    struct MockFactory(Arc<Recorder>);

    impl ListenerFactory for MockFactory {
        fn create(&self, config: &ListenerConfig) -> Result<QueueListener, QueueError> {
            self.0.created.fetch_add(1, Ordering::SeqCst);
            Ok(QueueListener::with_transport(
                config,
                Arc::new(IdleTransport(Arc::clone(&self.0))),
                Arc::new(Accept),
                Arc::new(LoggingErrorHandler),
            ))
        }
    }

    fn agent_config(sas: &str, refresh_in: TimeDelta) -> AgentConfig {
        AgentConfig {
            service_bus_namespace: "plant.servicebus.windows.net".into(),
            queue_name: "mill-01".into(),
            shared_access_signature: sas.into(),
            configuration_refresh_time: Utc::now() + refresh_in,
        }
    }

    fn worker(api: &Arc<MockApi>, recorder: &Arc<Recorder>) -> Worker {
        let settings = ListenerSettings {
            receive_wait: Duration::from_millis(10),
            ..ListenerSettings::default()
        };
        Worker::new(
            Arc::clone(api) as Arc<dyn ControlPlane>,
            Arc::new(MockFactory(Arc::clone(recorder))),
            settings,
            "mill-01",
            "0.1.0",
        )
    }

    fn unavailable() -> ApiError {
        ApiError::Api {
            status: 503,
            body: "down".into(),
        }
    }

    #[test]
    fn refresh_delay_respects_guard() {
        let now = Utc::now();
        assert_eq!(delay_until(now - TimeDelta::seconds(30), now), None);
        assert_eq!(delay_until(now + TimeDelta::seconds(5), now), None);
        assert_eq!(
            delay_until(now + TimeDelta::seconds(60), now),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn refreshes_credential_before_expiry() {
        let api = MockApi::new(vec![
            Ok(agent_config("sig=first", TimeDelta::seconds(1))),
            Ok(agent_config("sig=second", TimeDelta::hours(1))),
        ]);
        let recorder = Arc::new(Recorder::default());
        let worker = worker(&api, &recorder);
        let cancel = CancellationToken::new();

        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(&cancel).await })
        };

        for _ in 0..200 {
            if !recorder.credentials.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(api.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.created.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.credentials.lock().unwrap(), vec!["sig=second".to_string()]);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bootstrap_failure_is_fatal() {
        let api = MockApi::new(vec![Err(unavailable())]);
        let recorder = Arc::new(Recorder::default());

        let err = worker(&api, &recorder)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Config(_)));
        assert_eq!(recorder.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_failure_is_fatal_and_disposes_listener() {
        let api = MockApi::new(vec![
            Ok(agent_config("sig=first", TimeDelta::zero())),
            Err(unavailable()),
        ]);
        let recorder = Arc::new(Recorder::default());

        let err = worker(&api, &recorder)
            .run(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Config(_)));
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_bootstrap_is_clean() {
        let api = MockApi::new(Vec::new());
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        worker(&api, &recorder).run(&cancel).await.unwrap();
        assert_eq!(recorder.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_disposes_listener() {
        let api = MockApi::new(vec![Ok(agent_config("sig", TimeDelta::hours(1)))]);
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        worker(&api, &recorder).run(&cancel).await.unwrap();

        assert_eq!(api.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }
}
