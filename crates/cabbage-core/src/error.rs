//! Error types for the engine core.
//!
//! Control-plane operations (compile, state restore, config loading) return
//! rich errors that carry diagnostic text. The real-time path only ever
//! produces [`EngineRuntimeError`], which is `Copy` so it can be recorded
//! without allocating.

use thiserror::Error;

/// The orchestra could not be compiled.
///
/// Non-fatal: the processor keeps its previous engine (or stays silent) and
/// the diagnostics are kept for display.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The engine rejected the orchestra.
    #[error("orchestra failed to compile (code {code})")]
    Rejected {
        /// Engine status code
        code: i32,
        /// Engine console output captured during compilation
        diagnostics: String,
    },
    /// The engine compiled the orchestra but could not start the performance.
    #[error("engine failed to start (code {code})")]
    StartFailed {
        /// Engine status code
        code: i32,
        /// Engine console output captured during startup
        diagnostics: String,
    },
    /// The document has no `<CsInstruments>` section.
    #[error("document has no <CsInstruments> section")]
    MissingOrchestra,
    /// No engine instance could be created.
    #[error("engine unavailable: {0}")]
    Engine(#[from] EngineError),
    /// The document file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

impl CompileError {
    /// Engine console output associated with this failure, if any.
    pub fn diagnostics(&self) -> &str {
        match self {
            CompileError::Rejected { diagnostics, .. }
            | CompileError::StartFailed { diagnostics, .. } => diagnostics,
            _ => "",
        }
    }
}

/// Failure to create or configure an engine instance.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine library could not be loaded.
    #[error("failed to load engine library: {0}")]
    LibraryLoad(String),
    /// The engine refused to create an instance.
    #[error("failed to create engine instance")]
    CreateFailed,
    /// An engine option was rejected.
    #[error("engine rejected option '{option}' (code {code})")]
    OptionRejected {
        /// Option text as passed to the engine
        option: String,
        /// Engine status code
        code: i32,
    },
}

/// Per-block fault raised on the audio thread.
///
/// Recovered by zeroing the block. Reported to the control plane through
/// [`crate::FaultReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineRuntimeError {
    /// The engine returned an error status from its performance call.
    #[error("engine performance failed (code {0})")]
    PerformFailed(i32),
    /// The engine's buffers do not match the prepared layout.
    #[error("engine buffer layout mismatch")]
    LayoutMismatch,
}

impl EngineRuntimeError {
    /// Compact numeric code used for lock-free reporting.
    pub const fn code(&self) -> i32 {
        match self {
            EngineRuntimeError::PerformFailed(code) => *code,
            EngineRuntimeError::LayoutMismatch => i32::MIN,
        }
    }
}

/// Named-channel lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The compiled document has no channel with this name.
    #[error("channel '{0}' not found")]
    NotFound(String),
    /// The channel exists but is an audio-rate array channel.
    #[error("channel '{0}' is not a control channel")]
    NotControl(String),
}

/// Persisted state could not be restored.
#[derive(Debug, Error)]
pub enum StateError {
    /// The blob does not start with the state magic.
    #[error("state blob has an unrecognized header")]
    BadMagic,
    /// The blob was written by an incompatible format version.
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
    /// The blob body could not be decoded.
    #[error("malformed state body: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The stored document failed to compile.
    #[error("stored document failed to compile: {0}")]
    Compile(#[from] CompileError),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that was being read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The config text is not valid TOML for [`crate::Config`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid value for '{key}': {reason}")]
    Invalid {
        /// Offending key
        key: &'static str,
        /// Why the value was rejected
        reason: &'static str,
    },
}

/// Result alias for compile operations.
pub type CompileResult<T> = std::result::Result<T, CompileError>;
