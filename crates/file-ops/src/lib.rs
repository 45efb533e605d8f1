//! Bulk file operations for the transfer agent.
//!
//! Every operation fans out over a set of files through [`run_bounded`]:
//! it stops starting work once cancelled or after the first failure, lets
//! work already started finish, and reports the first error.

mod bounded;
mod delete;
mod list;
mod transfer;

use std::path::{Path, PathBuf};

use cnc_agent_blob_store::BlobError;
use cnc_agent_protocol::ValidationError;

pub use bounded::run_bounded;
pub use delete::{DEFAULT_DELETE_PARALLELISM, delete_all};
pub use list::list_files;
pub use transfer::{download_all, upload_all};

/// Errors produced by bulk file operations.
#[derive(Debug, thiserror::Error)]
pub enum FileOpsError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer of {name} failed: {source}")]
    Store {
        name: String,
        #[source]
        source: BlobError,
    },

    #[error(transparent)]
    InvalidName(#[from] ValidationError),

    #[error("file name is not valid UTF-8: {}", path.display())]
    NonUtf8Name { path: PathBuf },

    #[error("cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FileOpsError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn store(name: &str, source: BlobError) -> Self {
        match source {
            BlobError::Cancelled => Self::Cancelled,
            source => Self::Store {
                name: name.to_string(),
                source,
            },
        }
    }
}
