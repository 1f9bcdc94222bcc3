//! Volume backup and restore through the restic CLI.
//!
//! [`ResticProvider`] turns backup and restore requests into restic
//! invocations, provisions the repository password and object-store CA as
//! private temporary files for its lifetime, and interprets restic's output
//! into a [`BackupOutcome`].

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod progress;
pub mod provider;
pub mod restic;
pub mod utils;

pub use config::{ResticConfig, StorageLocation};
pub use context::CallContext;
pub use credentials::{CredentialFileStore, SecretDirStore, SecretKeySelector};
pub use error::{Error, Result};
pub use progress::{Progress, ProgressUpdater};
pub use provider::{BackupOutcome, BackupRequest, ResticProvider, UploaderProvider, VolumeMode};
pub use restic::{ProcessRunner, ResticCommand, ResticRunner, Tags};
