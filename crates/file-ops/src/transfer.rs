//! Concurrent download and upload of file sets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cnc_agent_blob_store::ObjectStore;
use cnc_agent_protocol::{RemoteFile, UploadDestination, validate_file_name};
use tokio_util::sync::CancellationToken;

use crate::FileOpsError;
use crate::bounded::run_bounded;

/// Downloads every remote file into `dest_dir`, one task per file, each
/// saved under its descriptor name.
pub async fn download_all(
    store: Arc<dyn ObjectStore>,
    files: &[RemoteFile],
    dest_dir: &Path,
    cancel: &CancellationToken,
) -> Result<(), FileOpsError> {
    for file in files {
        validate_file_name(&file.name)?;
    }

    let jobs: Vec<(RemoteFile, PathBuf)> = files
        .iter()
        .map(|f| (f.clone(), dest_dir.join(&f.name)))
        .collect();

    run_bounded(jobs, None, cancel, |(file, dest)| {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        async move {
            store
                .download_to_file(&file.url, &dest, &cancel)
                .await
                .map_err(|e| FileOpsError::store(&file.name, e))?;
            Ok(())
        }
    })
    .await?;

    tracing::info!(path = %dest_dir.display(), files = files.len(), "downloaded files");
    Ok(())
}

/// Uploads `src_dir/<filename>` to each destination URL, one task per
/// file. Existing objects are overwritten.
pub async fn upload_all(
    store: Arc<dyn ObjectStore>,
    src_dir: &Path,
    destinations: &[UploadDestination],
    cancel: &CancellationToken,
) -> Result<(), FileOpsError> {
    for dest in destinations {
        validate_file_name(&dest.filename)?;
    }

    let jobs: Vec<(UploadDestination, PathBuf)> = destinations
        .iter()
        .map(|d| (d.clone(), src_dir.join(&d.filename)))
        .collect();

    run_bounded(jobs, None, cancel, |(dest, src)| {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        async move {
            store
                .upload_from_file(&src, &dest.url, &cancel)
                .await
                .map_err(|e| FileOpsError::store(&dest.filename, e))?;
            Ok(())
        }
    })
    .await?;

    tracing::info!(path = %src_dir.display(), files = destinations.len(), "uploaded files");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use cnc_agent_blob_store::{BlobError, StoreFuture};

    /// Writes the URL as file content on download and records uploads.
    #[derive(Default)]
    struct MockStore {
        uploads: Mutex<Vec<(String, String)>>,
        fail_url: Option<String>,
        block_until_cancelled: bool,
    }

    impl ObjectStore for MockStore {
        fn download_to_file<'a>(
            &'a self,
            url: &'a str,
            dest: &'a Path,
            cancel: &'a CancellationToken,
        ) -> StoreFuture<'a> {
            Box::pin(async move {
                if self.block_until_cancelled {
                    cancel.cancelled().await;
                    return Err(BlobError::Cancelled);
                }
                if self.fail_url.as_deref() == Some(url) {
                    return Err(BlobError::Status {
                        status: 404,
                        body: "BlobNotFound".into(),
                    });
                }
                tokio::fs::write(dest, url).await.unwrap();
                Ok(url.len() as u64)
            })
        }

        fn upload_from_file<'a>(
            &'a self,
            src: &'a Path,
            url: &'a str,
            _cancel: &'a CancellationToken,
        ) -> StoreFuture<'a> {
            Box::pin(async move {
                let content = tokio::fs::read_to_string(src)
                    .await
                    .map_err(|source| BlobError::Io {
                        path: src.to_path_buf(),
                        source,
                    })?;
                let len = content.len() as u64;
                self.uploads.lock().unwrap().push((url.to_string(), content));
                Ok(len)
            })
        }
    }

    fn remote(name: &str) -> RemoteFile {
        RemoteFile {
            name: name.into(),
            url: format!("https://blob/{name}"),
        }
    }

    #[tokio::test]
    async fn downloads_each_file_under_its_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore::default());
        let files = [remote("O1.nc"), remote("O2.nc"), remote("O3.nc")];

        download_all(store, &files, tmp.path(), &CancellationToken::new())
            .await
            .unwrap();

        for f in &files {
            let content = std::fs::read_to_string(tmp.path().join(&f.name)).unwrap();
            assert_eq!(content, f.url);
        }
    }

    #[tokio::test]
    async fn download_failure_names_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore {
            fail_url: Some("https://blob/O2.nc".into()),
            ..MockStore::default()
        });

        let err = download_all(
            store,
            &[remote("O1.nc"), remote("O2.nc")],
            tmp.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            FileOpsError::Store { name, .. } => assert_eq!(name, "O2.nc"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn download_rejects_traversal_before_any_transfer() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore::default());

        let err = download_all(
            store,
            &[remote("ok.nc"), remote("../escape.nc")],
            tmp.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, FileOpsError::InvalidName(_)));
        assert!(!tmp.path().join("ok.nc").exists());
    }

    #[tokio::test]
    async fn cancelled_download_batch_returns_promptly() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore {
            block_until_cancelled: true,
            ..MockStore::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let files: Vec<RemoteFile> = (0..5).map(|i| remote(&format!("f{i}.nc"))).collect();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            download_all(store, &files, tmp.path(), &cancel),
        )
        .await
        .expect("download batch hung after cancellation");

        assert!(matches!(result, Err(FileOpsError::Cancelled)));
    }

    #[tokio::test]
    async fn uploads_pair_files_with_destinations() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("O1.nc"), "one").unwrap();
        std::fs::write(tmp.path().join("O2.nc"), "two").unwrap();
        let mock = Arc::new(MockStore::default());
        let store: Arc<dyn ObjectStore> = mock.clone();

        let destinations = vec![
            UploadDestination {
                filename: "O1.nc".into(),
                url: "https://blob/up/1".into(),
            },
            UploadDestination {
                filename: "O2.nc".into(),
                url: "https://blob/up/2".into(),
            },
        ];
        upload_all(store, tmp.path(), &destinations, &CancellationToken::new())
            .await
            .unwrap();

        let mut uploads = mock.uploads.lock().unwrap().clone();
        uploads.sort();
        assert_eq!(
            uploads,
            vec![
                ("https://blob/up/1".to_string(), "one".to_string()),
                ("https://blob/up/2".to_string(), "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore::default());
        let destinations = [UploadDestination {
            filename: "ghost.nc".into(),
            url: "https://blob/up/ghost".into(),
        }];

        let err = upload_all(store, tmp.path(), &destinations, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpsError::Store { .. }));
    }

    #[tokio::test]
    async fn upload_rejects_unsafe_destination_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(MockStore::default());
        let destinations = [UploadDestination {
            filename: "../../etc/passwd".into(),
            url: "https://blob/up/x".into(),
        }];

        let err = upload_all(store, tmp.path(), &destinations, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FileOpsError::InvalidName(_)));
    }
}
