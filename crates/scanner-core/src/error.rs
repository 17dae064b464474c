//! Error taxonomy shared by training and inference.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Degenerate training input or invalid configuration. Raised before any fit.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The target could not be decoded as a PE image at all.
    #[error("malformed input {path}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },

    #[error("not a regular file: {path}")]
    NotAFile { path: PathBuf },

    /// Missing, corrupt or mutually inconsistent model/feature stores.
    #[error("failed to load artifact {path}: {reason}")]
    ArtifactLoad { path: PathBuf, reason: String },

    /// A selected feature has no counterpart in the extracted vector.
    #[error("selected feature `{name}` is not produced by the extractor")]
    FeatureMismatch { name: String },

    /// The tree learner rejected its input or hyperparameters.
    #[error("model fit failed: {0}")]
    Fit(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn malformed<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::MalformedInput { path: path.into(), reason: reason.into() }
    }

    pub fn artifact<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::ArtifactLoad { path: path.into(), reason: reason.into() }
    }
}
