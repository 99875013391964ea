//! Error types for plugin export.

use std::path::PathBuf;

use thiserror::Error;

/// Export failures. Each is reported to the user and aborts the export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The prebuilt plugin template is not where it should be.
    #[error("{} cannot be found, it should be in the Cabbage install folder", .path.display())]
    ArtifactMissing { path: PathBuf },
    /// The template could not be copied to the destination.
    #[error("cannot copy plugin library to {}, is it in use? ({source})", .to.display())]
    ArtifactCopyFailed {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    /// The destination exists and overwriting was not requested.
    #[error("{} already exists", .0.display())]
    DestinationExists(PathBuf),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ExportError::Io { path, source }
    }
}

/// Result type for export operations.
pub type Result<T> = std::result::Result<T, ExportError>;
