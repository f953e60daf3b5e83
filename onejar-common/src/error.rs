//! Error types for onejar
//!
//! Library errors use `thiserror`; the binaries wrap them with `anyhow` context.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for onejar operations
pub type OnejarResult<T> = Result<T, OnejarError>;

/// Main error type for packaging and boot descriptors
#[derive(Error, Debug)]
pub enum OnejarError {
    /// A required key is absent from a descriptor
    #[error("missing property '{key}' in {file}")]
    MissingKey { key: String, file: String },

    /// A component reference does not follow the `reference:file:` grammar
    #[error("unhandled specification: {0}")]
    UnhandledSpecification(String),

    /// A descriptor line or value has a shape we do not support
    #[error("not supported in {file}: {line}")]
    UnsupportedDescriptor { file: String, line: String },

    /// Simple-configurator descriptor with an encoding other than UTF-8
    #[error("only UTF-8 supported, got '{0}'")]
    UnsupportedEncoding(String),

    /// Simple-configurator descriptor with a version other than 1
    #[error("only version 1 supported, got '{0}'")]
    UnsupportedVersion(String),

    /// Start level that is not a non-negative integer
    #[error("invalid start level '{value}' in '{entry}'")]
    InvalidStartLevel { entry: String, value: String },

    /// Same component path declared with different start settings
    #[error("{what} conflict for {path}: {existing} {incoming}")]
    Conflict {
        what: &'static str,
        path: String,
        existing: String,
        incoming: String,
    },

    /// Same pass-through property declared with different values
    #[error("property '{key}' has different values in different artifacts: '{existing}', '{incoming}'")]
    PropertyConflict {
        key: String,
        existing: String,
        incoming: String,
    },

    /// More than one runtime implementation among the inputs
    #[error("runtime implementation mismatch: '{primary}' vs '{other}'")]
    RuntimeMismatch { primary: String, other: String },

    /// A different file already occupies a destination in the output tree
    #[error("duplicate: {}", .0.display())]
    DuplicateFile(PathBuf),

    /// The content registry was asked to track a path twice
    #[error("already registered: {}", .0.display())]
    DuplicateRegistration(PathBuf),

    /// Malformed archive manifest
    #[error("invalid manifest line {line}: {message}")]
    InvalidManifest { line: usize, message: String },

    /// Malformed or missing executable payload
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
