use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::FileOpsError;

/// Runs `op` once per item, at most `limit` at a time (`None` = unbounded).
///
/// No new item is started after `cancel` fires or after any started item
/// fails. Items already started always run to completion before this
/// returns. The first error observed wins; later ones are only logged.
pub async fn run_bounded<T, F, Fut>(
    items: Vec<T>,
    limit: Option<usize>,
    cancel: &CancellationToken,
    op: F,
) -> Result<(), FileOpsError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), FileOpsError>> + Send + 'static,
{
    let semaphore = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let mut tasks = JoinSet::new();
    let mut first_error = None;

    for item in items {
        let permit = match &semaphore {
            Some(sem) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(sem).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        if cancel.is_cancelled() {
            first_error.get_or_insert(FileOpsError::Cancelled);
            break;
        }

        while let Some(done) = tasks.try_join_next() {
            record(&mut first_error, done);
        }
        if first_error.is_some() {
            break;
        }

        let fut = op(item);
        tasks.spawn(async move {
            let _permit = permit;
            fut.await
        });
    }

    while let Some(done) = tasks.join_next().await {
        record(&mut first_error, done);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn record(
    first_error: &mut Option<FileOpsError>,
    done: Result<Result<(), FileOpsError>, JoinError>,
) {
    let err = match done {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(e) => FileOpsError::Join(e),
    };
    match first_error {
        None => *first_error = Some(err),
        Some(_) => tracing::debug!(error = %err, "additional failure in batch"),
    }
}
