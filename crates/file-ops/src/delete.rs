//! Purging the contents of a machine share.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::FileOpsError;
use crate::bounded::run_bounded;

/// Concurrent deletions used when the caller has no preference.
pub const DEFAULT_DELETE_PARALLELISM: usize = 5;

/// Deletes every entry directly under `path`, leaving `path` itself.
///
/// Files (and symlinks, which are removed as links and never followed) go
/// first, then directories recursively. Each set runs with at most
/// `parallelism` removals in flight.
pub async fn delete_all(
    path: &Path,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<(), FileOpsError> {
    let (files, dirs) = collect_entries(path).await?;
    let (file_count, dir_count) = (files.len(), dirs.len());

    run_bounded(files, Some(parallelism), cancel, |entry: PathBuf| async move {
        tokio::task::spawn_blocking(move || remove_file_or_link(&entry))
            .await?
    })
    .await?;

    run_bounded(dirs, Some(parallelism), cancel, |dir: PathBuf| async move {
        tokio::task::spawn_blocking(move || {
            std::fs::remove_dir_all(&dir).map_err(FileOpsError::io(&dir))
        })
        .await?
    })
    .await?;

    tracing::info!(
        path = %path.display(),
        files = file_count,
        directories = dir_count,
        "purged directory contents"
    );
    Ok(())
}

async fn collect_entries(path: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), FileOpsError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(FileOpsError::io(path))?;

    let mut files = Vec::new();
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(FileOpsError::io(path))? {
        let entry_path = entry.path();
        // `file_type` does not follow symlinks.
        let file_type = entry
            .file_type()
            .await
            .map_err(FileOpsError::io(&entry_path))?;
        if file_type.is_dir() {
            dirs.push(entry_path);
        } else {
            files.push(entry_path);
        }
    }
    Ok((files, dirs))
}

fn remove_file_or_link(path: &Path) -> Result<(), FileOpsError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        // Directory symlinks on Windows are removed with `remove_dir`.
        Err(e) if cfg!(windows) && path.is_symlink() => {
            std::fs::remove_dir(path).map_err(|_| FileOpsError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(FileOpsError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
