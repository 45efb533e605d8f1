use std::collections::HashMap;
use std::sync::Arc;

use cnc_agent_protocol::Credentials;
use tokio::sync::Mutex;

use crate::{AuthError, ShareConnector};

/// Connections opened through a [`ShareConnector`], counted per share root.
///
/// The OS keeps one connection per share for the whole logon session, so
/// overlapping work on the same share uses the same connection: the first
/// holder opens it and the last one closes it.
pub struct ShareConnections {
    connector: Arc<dyn ShareConnector>,
    holders: Mutex<HashMap<String, usize>>,
}

impl ShareConnections {
    pub fn new(connector: Arc<dyn ShareConnector>) -> Self {
        Self {
            connector,
            holders: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a hold on `share`, connecting if nobody holds it yet.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        share: String,
        credentials: Credentials,
    ) -> Result<ShareGuard, AuthError> {
        let mut holders = self.holders.lock().await;
        match holders.get_mut(&share) {
            Some(count) => {
                *count += 1;
                tracing::debug!(share = %share, holders = *count, "share connection reused");
            }
            None => {
                let user = credentials.qualified_username();
                let (c, s) = (Arc::clone(&self.connector), share.clone());
                tokio::task::spawn_blocking(move || c.connect(&s, &credentials)).await??;
                holders.insert(share.clone(), 1);
                tracing::debug!(share = %share, user = %user, "share connected");
            }
        }

        Ok(ShareGuard {
            connections: Arc::clone(self),
            share,
            released: false,
        })
    }

    async fn release(&self, share: &str) {
        let mut holders = self.holders.lock().await;
        if !Self::drop_hold(&mut holders, share) {
            return;
        }
        let (c, s) = (Arc::clone(&self.connector), share.to_string());
        match tokio::task::spawn_blocking(move || c.disconnect(&s)).await {
            Ok(Ok(())) => tracing::debug!(share = %share, "share disconnected"),
            Ok(Err(e)) => tracing::warn!(error = %e, "share disconnect failed"),
            Err(e) => tracing::warn!(share = %share, error = %e, "share disconnect task failed"),
        }
    }

    /// Release path used outside a runtime.
    fn release_blocking(&self, share: &str) {
        let mut holders = self.holders.blocking_lock();
        if !Self::drop_hold(&mut holders, share) {
            return;
        }
        if let Err(e) = self.connector.disconnect(share) {
            tracing::warn!(error = %e, "share disconnect after cancellation failed");
        }
    }

    /// Decrements the hold count; `true` when it reached zero.
    fn drop_hold(holders: &mut HashMap<String, usize>, share: &str) -> bool {
        let Some(count) = holders.get_mut(share) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            tracing::debug!(share = %share, holders = *count, "share still in use");
            return false;
        }
        holders.remove(share);
        true
    }
}

/// A hold on a share connection, given back by [`ShareGuard::release`] or,
/// if the owning future is dropped first, from `Drop`.
pub(crate) struct ShareGuard {
    connections: Arc<ShareConnections>,
    share: String,
    released: bool,
}

impl ShareGuard {
    pub(crate) async fn release(mut self) {
        self.released = true;
        self.connections.release(&self.share).await;
    }
}

impl Drop for ShareGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let connections = Arc::clone(&self.connections);
        let share = std::mem::take(&mut self.share);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    connections.release(&share).await;
                    tracing::debug!(share = %share, "share released after cancellation");
                });
            }
            Err(_) => connections.release_blocking(&share),
        }
    }
}
