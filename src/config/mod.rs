pub mod location;
pub mod policy;

use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub use location::{ObjectStorage, StorageLocation};
pub use policy::ResticConfig;

/// Read and deserialize a JSON configuration file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
}
