//! Application orchestrator: wires all agent components together.

use std::sync::Arc;

use cnc_agent_blob_store::{BlobStore, ObjectStore};
use cnc_agent_control_plane::{ApiClient, ControlPlane};
use cnc_agent_dispatch::TransferDispatcher;
use cnc_agent_queue::{LoggingErrorHandler, ServiceBusListenerFactory};
use cnc_agent_share_auth::ShareAuthenticator;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::worker::Worker;

/// Runs the agent until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // -- Control plane --
    let api: Arc<dyn ControlPlane> = Arc::new(ApiClient::new(
        &config.api_base_url,
        config.api_token.as_deref(),
    )?);

    // -- Transfers --
    let store: Arc<dyn ObjectStore> = Arc::new(BlobStore::new()?);
    let auth = ShareAuthenticator::for_mode(config.auth)?;
    tracing::info!(mode = ?config.auth, authenticator = ?auth, "share authentication selected");

    let dispatcher = TransferDispatcher::new(Arc::clone(&api), store, auth)
        .with_delete_parallelism(config.delete_parallelism);

    // -- Queue --
    let factory = Arc::new(ServiceBusListenerFactory::new(
        Arc::new(dispatcher),
        Arc::new(LoggingErrorHandler),
    ));

    let worker = Worker::new(
        api,
        factory,
        config.listener_settings(),
        config.agent_id.clone(),
        env!("CARGO_PKG_VERSION"),
    );

    // -- Shutdown --
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    tracing::info!(agent_id = %config.agent_id, "agent ready");
    worker.run(&cancel).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
