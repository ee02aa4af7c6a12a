use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the host builder.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The function's runtime has no registered language builder.
    #[error("the {0} runtime is not supported by the host builder")]
    UnsupportedRuntime(String),

    /// Another live process is already building this function.
    #[error("a build for this function is already in progress: {0}")]
    BuildInProgress(PathBuf),

    /// The project contains a symlink with an absolute target.
    #[error("project may not contain absolute links: {0}")]
    AbsoluteLink(PathBuf),

    /// The project contains a symlink whose target resolves outside the
    /// project root.
    #[error("links must stay within project root: {0}")]
    LinkEscapesRoot(PathBuf),

    /// The project tree could not be fingerprinted.
    #[error("error calculating fingerprint for build: {0}")]
    Fingerprint(String),

    /// A toolchain subprocess failed.
    #[error("{program} failed: {message}")]
    Toolchain { program: String, message: String },

    /// The base image could not be fetched from its registry.
    #[error("cannot fetch base image {reference}: {message}")]
    RegistryFetch { reference: String, message: String },

    /// A blob could not be written.
    #[error("cannot write blob: {0}")]
    BlobWrite(String),

    /// A blob could not be linked into the build.
    #[error("cannot link blob: {0}")]
    Link(String),

    /// A blob could not be moved to its content-addressed path.
    #[error("cannot rename blob: {0}")]
    Rename(String),

    /// Wrapper code could not be scaffolded into the build directory.
    #[error("cannot scaffold function: {0}")]
    Scaffold(String),

    /// The build context was canceled.
    #[error("build canceled")]
    Canceled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result type used throughout the builder.
pub type Result<T> = std::result::Result<T, BuildError>;
