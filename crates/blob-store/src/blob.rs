//! Blob storage over plain HTTPS with SAS URIs.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{BlobError, ObjectStore, StoreFuture};

/// Storage REST version sent with every request.
const API_VERSION: &str = "2021-08-06";

/// Buffer size for file reads and writes.
const BUFFER_SIZE: usize = 256 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest silence tolerated on a connection. Transfers may take
/// arbitrarily long as a whole, so there is no overall request timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// [`ObjectStore`] backed by the blob REST API.
#[derive(Clone)]
pub struct BlobStore {
    http: reqwest::Client,
}

impl BlobStore {
    pub fn new() -> Result<Self, BlobError> {
        Self::with_timeouts(CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    /// Builds a store with explicit connect and read timeouts.
    pub fn with_timeouts(connect: Duration, read: Duration) -> Result<Self, BlobError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("cnc-agent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect)
            .read_timeout(read)
            .build()?;
        Ok(Self { http })
    }

    /// Downloads into `dest`. A file created here is removed again on
    /// failure; an existing file is left alone until the response is good.
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, BlobError> {
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlobError::Cancelled),
            resp = self.http.get(url).header("x-ms-version", API_VERSION).send() => resp?,
        };
        let resp = check_status(resp).await?;

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(io_error(dest))?;

        match write_body(resp, file, dest, cancel).await {
            Ok(written) => Ok(written),
            Err(e) => {
                // Never leave a truncated file behind.
                if let Err(remove) = tokio::fs::remove_file(dest).await {
                    warn!(dest = %dest.display(), error = %remove, "failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn put(
        &self,
        src: &Path,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, BlobError> {
        let file = tokio::fs::File::open(src).await.map_err(io_error(src))?;
        let len = file.metadata().await.map_err(io_error(src))?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, BUFFER_SIZE));

        let request = self
            .http
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", API_VERSION)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(body);

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlobError::Cancelled),
            resp = request.send() => resp?,
        };
        check_status(resp).await?;
        Ok(len)
    }
}

async fn write_body(
    resp: reqwest::Response,
    file: tokio::fs::File,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<u64, BlobError> {
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BlobError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        writer.write_all(&chunk).await.map_err(io_error(dest))?;
        written += chunk.len() as u64;
    }

    writer.flush().await.map_err(io_error(dest))?;
    Ok(written)
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BlobError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BlobError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Strips the query (signature) from a URI for logging.
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

impl ObjectStore for BlobStore {
    fn download_to_file<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        cancel: &'a CancellationToken,
    ) -> StoreFuture<'a> {
        Box::pin(async move {
            let bytes = self.fetch(url, dest, cancel).await?;
            debug!(url = redact(url), dest = %dest.display(), bytes, "blob downloaded");
            Ok(bytes)
        })
    }

    fn upload_from_file<'a>(
        &'a self,
        src: &'a Path,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> StoreFuture<'a> {
        Box::pin(async move {
            let bytes = self.put(src, url, cancel).await?;
            debug!(url = redact(url), src = %src.display(), bytes, "blob uploaded");
            Ok(bytes)
        })
    }
}
