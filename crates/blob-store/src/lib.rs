//! Object storage access for the transfer agent.
//!
//! Objects are addressed by signed URIs handed out by the control plane,
//! so no account credentials are involved here. Content is streamed to and
//! from disk; whole files are never held in memory.

mod blob;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

pub use blob::BlobStore;

/// A boxed future returned by [`ObjectStore`] methods, yielding bytes moved.
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<u64, BlobError>> + Send + 'a>>;

/// Errors from object-storage transfers.
///
/// Object URIs carry their signature in the query string, so transport
/// errors are stored without the URL.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("storage returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BlobError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

/// Fetch and put objects by URI.
pub trait ObjectStore: Send + Sync {
    /// Streams the object at `url` into `dest`, creating or truncating it.
    fn download_to_file<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        cancel: &'a CancellationToken,
    ) -> StoreFuture<'a>;

    /// Streams `src` to `url`, overwriting any existing object.
    fn upload_from_file<'a>(
        &'a self,
        src: &'a Path,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> StoreFuture<'a>;
}
