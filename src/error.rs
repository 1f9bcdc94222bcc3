//! Error types for the restic uploader.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The repository password could not be materialized on disk
    #[error("error creating temp restic credentials file: {0}")]
    CredentialProvision(String),

    /// Provider setup failed (CA material, command env, missing identifiers)
    #[error("error constructing restic provider: {0}")]
    Construction(String),

    /// Arguments this backend does not support; no process was started
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("need to initialize a progress updater first")]
    MissingUpdater,

    /// restic ran and failed
    #[error("error running restic command {command} with error: {reason} stderr: {stderr}")]
    Execution {
        command: String,
        reason: String,
        stderr: String,
    },

    /// The backup finished but its snapshot id could not be looked up
    #[error("error getting snapshot id with error: {0}")]
    SnapshotResolution(String),

    /// One or more provisioned files could not be removed
    #[error("failed to clean up restic provider files: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures raised while building the provider.
    pub fn is_construction(&self) -> bool {
        matches!(self, Error::CredentialProvision(_) | Error::Construction(_))
    }
}
