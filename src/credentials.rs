//! Secret and CA material for restic.
//!
//! Everything written here is secret: files are created owner-only through
//! `tempfile` and persisted until the provider that asked for them removes
//! them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::io::write_private_file;

/// Reference to one key of a named secret.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

impl SecretKeySelector {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::str::FromStr for SecretKeySelector {
    type Err = String;

    /// Parses `name/key`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => {
                Ok(Self::new(name, key))
            }
            _ => Err(format!("expected <secret-name>/<key>, got '{}'", s)),
        }
    }
}

/// Produces a file path holding the decrypted value of a secret key.
pub trait CredentialFileStore: Send + Sync {
    fn path(&self, selector: &SecretKeySelector) -> Result<PathBuf>;
}

/// Reads secrets laid out as `<secrets_dir>/<name>/<key>` (the shape of a
/// mounted secret volume) and copies the requested value into a private
/// file under `output_dir`.
pub struct SecretDirStore {
    secrets_dir: PathBuf,
    output_dir: PathBuf,
}

impl SecretDirStore {
    pub fn new(secrets_dir: impl AsRef<Path>) -> Self {
        Self {
            secrets_dir: secrets_dir.as_ref().to_path_buf(),
            output_dir: std::env::temp_dir(),
        }
    }

    /// Materialize files under `dir` instead of the system temp directory.
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }
}

impl CredentialFileStore for SecretDirStore {
    fn path(&self, selector: &SecretKeySelector) -> Result<PathBuf> {
        let source = self.secrets_dir.join(&selector.name).join(&selector.key);
        let value = fs::read(&source).map_err(|e| {
            Error::CredentialProvision(format!(
                "unable to read secret {}/{} from {}: {}",
                selector.name,
                selector.key,
                source.display(),
                e
            ))
        })?;

        let prefix = format!("{}-{}-", selector.name, selector.key);
        let path = write_private_file(&self.output_dir, &prefix, &value)
            .map_err(|e| Error::CredentialProvision(e.to_string()))?;
        debug!(secret = %selector.name, key = %selector.key, path = %path.display(), "materialized secret");
        Ok(path)
    }
}

/// Write a CA bundle to a uniquely named private file in `dir`.
pub fn temp_ca_cert_file(ca_cert: &[u8], location_name: &str, dir: &Path) -> io::Result<PathBuf> {
    write_private_file(dir, &format!("{}-cacert", location_name), ca_cert)
}
