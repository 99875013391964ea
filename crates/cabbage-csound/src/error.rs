//! Error types for loading the Csound library.

use cabbage_core::EngineError;
use thiserror::Error;

/// libcsound could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The library file could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },
    /// None of the default library names could be opened.
    #[error("no Csound library found (tried {})", .0.join(", "))]
    NotFound(Vec<String>),
    /// The library lacks a required API function.
    #[error("Csound library has no symbol '{0}'")]
    MissingSymbol(&'static str),
}

impl From<LoadError> for EngineError {
    fn from(err: LoadError) -> Self {
        EngineError::LibraryLoad(err.to_string())
    }
}

/// Result type for library loading.
pub type Result<T> = std::result::Result<T, LoadError>;
