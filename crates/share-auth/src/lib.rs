//! Machine-share authentication.
//!
//! A transfer request may carry credentials for the share it targets. The
//! [`ShareAuthenticator`] chosen at startup decides what happens with them:
//! [`ShareAuthenticator::NoAuth`] ignores them and runs the work directly,
//! [`ShareAuthenticator::NetworkShare`] holds a connection to the share for
//! the duration of the work. Connections are counted per share root and
//! closed when the last holder is done.

mod guard;
mod unc;
#[cfg(windows)]
mod wnet;

use std::future::Future;
use std::sync::Arc;

use cnc_agent_protocol::{Credentials, TransferRequest};
use serde::{Deserialize, Serialize};

pub use guard::ShareConnections;
pub use unc::share_root;
#[cfg(windows)]
pub use wnet::WNetShareConnector;

/// Errors from establishing or releasing a share connection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("failed to connect to {share} as {user}: {message}")]
    Connect {
        share: String,
        user: String,
        message: String,
    },

    #[error("failed to disconnect from {share}: {message}")]
    Disconnect { share: String, message: String },

    #[error("network-share authentication is not supported on this platform")]
    Unsupported,

    #[error("connection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// OS mechanism that opens and closes connections to a share.
///
/// Both calls block and are run on the blocking thread pool.
pub trait ShareConnector: Send + Sync + 'static {
    fn connect(&self, share: &str, credentials: &Credentials) -> Result<(), AuthError>;

    fn disconnect(&self, share: &str) -> Result<(), AuthError>;
}

/// Authentication mode selected in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Network-share connections where the platform supports them.
    #[default]
    Auto,
    /// Never authenticate.
    None,
    /// Always use network-share connections; unsupported platforms fail.
    NetworkShare,
}

/// Strategy for running work against a machine share.
#[derive(Clone)]
pub enum ShareAuthenticator {
    NoAuth,
    NetworkShare(Arc<ShareConnections>),
}

impl std::fmt::Debug for ShareAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAuth => f.write_str("NoAuth"),
            Self::NetworkShare(_) => f.write_str("NetworkShare"),
        }
    }
}

impl ShareAuthenticator {
    /// Builds the authenticator for `mode` on the current platform.
    pub fn for_mode(mode: AuthMode) -> Result<Self, AuthError> {
        match mode {
            AuthMode::None => Ok(Self::NoAuth),
            #[cfg(windows)]
            AuthMode::Auto | AuthMode::NetworkShare => {
                Ok(Self::network_share(Arc::new(WNetShareConnector)))
            }
            #[cfg(not(windows))]
            AuthMode::Auto => Ok(Self::NoAuth),
            #[cfg(not(windows))]
            AuthMode::NetworkShare => Err(AuthError::Unsupported),
        }
    }

    pub fn network_share(connector: Arc<dyn ShareConnector>) -> Self {
        Self::NetworkShare(Arc::new(ShareConnections::new(connector)))
    }

    /// Runs `work`, inside a share connection when this is a
    /// network-share authenticator and `request` carries credentials.
    ///
    /// The hold on the connection is given back on every exit path,
    /// including when the returned future is dropped before completion. A
    /// failure to connect is returned without running `work`.
    pub async fn run<T, E, F, Fut>(&self, request: &TransferRequest, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AuthError>,
    {
        let connections = match self {
            Self::NoAuth => return work().await,
            Self::NetworkShare(connections) => connections,
        };
        let Some(credentials) = request.credentials() else {
            return work().await;
        };

        let share = share_root(&request.machine_share);
        let guard = connections.acquire(share, credentials).await?;
        let result = work().await;
        guard.release().await;
        result
    }
}
