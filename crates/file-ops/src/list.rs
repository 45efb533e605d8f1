use std::path::Path;

use crate::FileOpsError;

/// Names of the regular files directly under `path`, sorted.
///
/// Directories are skipped; symlinks count when they point at a file.
/// A file whose name is not valid UTF-8 cannot be sent to the control
/// plane, so it fails the listing rather than being left out of it.
pub async fn list_files(path: &Path) -> Result<Vec<String>, FileOpsError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(FileOpsError::io(path))?;

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(FileOpsError::io(path))? {
        let entry_path = entry.path();
        let is_file = tokio::fs::metadata(&entry_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| FileOpsError::NonUtf8Name { path: entry_path })?;
        names.push(name);
    }

    names.sort();
    Ok(names)
}
