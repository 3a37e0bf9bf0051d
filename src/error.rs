//! Error types for prefix packaging.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the packaging pipeline.
pub type Result<T> = std::result::Result<T, PackError>;

/// Errors that abort packaging a prefix.
#[derive(Error, Debug)]
pub enum PackError {
    /// The package ships site-packages files but no interpreter version is tracked.
    #[error("package contains site-packages files but no installed '{interpreter}' version was found in {}", .prefix.display())]
    MissingDependencyVersion { interpreter: String, prefix: PathBuf },

    /// The tracked interpreter version could not be reduced to `major.minor`.
    #[error("cannot derive a major.minor version from installed {interpreter} version '{version}'")]
    InvalidInterpreterVersion { interpreter: String, version: String },

    /// An executable starts with `#!` but is not valid text.
    #[error("executable '{}' has an interpreter directive but is not valid UTF-8 text", .path.display())]
    UnreadableExecutable {
        path: PathBuf,
        #[source]
        source: std::string::FromUtf8Error,
    },

    /// The package name or version cannot form an archive name.
    #[error("invalid package {field} '{value}': {reason}")]
    InvalidPackage {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    /// A prefix entry's path cannot be expressed as a UTF-8 string.
    #[error("path is not valid UTF-8: {}", .path.display())]
    NonUtf8Path { path: PathBuf },

    /// Directory traversal failed.
    #[error("walking prefix failed: {0}")]
    Walk(#[from] walkdir::Error),

    /// Filesystem failure with the path or action involved.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The package-tracking records could not be read.
    #[error("reading tracked package record '{}': {reason}", .path.display())]
    Baseline { path: PathBuf, reason: String },

    /// Manifest serialization failed.
    #[error("serializing package metadata: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Attach a context message to an `io::Result`, mirroring `anyhow::Context`.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| PackError::Io {
            context: f().into(),
            source,
        })
    }
}
