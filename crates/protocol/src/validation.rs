use std::path::{Component, Path};

use crate::types::{TransferDirection, TransferRequest};

/// Reasons a transfer request can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("machine share is empty")]
    EmptyMachineShare,

    #[error("no files to download from cloud")]
    NoFilesToDownload,

    #[error("unknown direction {0:?}")]
    UnknownDirection(String),

    #[error("invalid file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: &'static str },
}

impl TransferRequest {
    /// Checks the request before any file is touched.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.machine_share.trim().is_empty() {
            return Err(ValidationError::EmptyMachineShare);
        }

        if self.direction == TransferDirection::FromCloud && self.files_to_download.is_empty() {
            return Err(ValidationError::NoFilesToDownload);
        }

        if let TransferDirection::Unknown(raw) = &self.direction {
            return Err(ValidationError::UnknownDirection(raw.clone()));
        }

        if self.direction == TransferDirection::FromCloud {
            for file in &self.files_to_download {
                validate_file_name(&file.name)?;
            }
        }

        Ok(())
    }
}

/// Validates that `name` is a single plain file name.
///
/// Rejects:
/// - Empty names
/// - Path separators of either platform
/// - `.` and `..`
/// - Drive letters and stream separators (`:`)
/// - Anything `Path` would not read as one normal component
pub fn validate_file_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidFileName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.contains(['/', '\\']) {
        return Err(invalid("path separators not allowed"));
    }
    if name.contains(':') {
        return Err(invalid("drive or stream separator not allowed"));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) => Err(invalid("parent directory traversal not allowed")),
        _ => Err(invalid("not a plain file name")),
    }
}
