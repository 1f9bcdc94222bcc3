use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::credentials::SecretKeySelector;

/// Where backups are stored, as configured by the orchestration system.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocation {
    pub name: String,
    /// Object store provider, e.g. "aws", "azure", "gcp"
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage: Option<ObjectStorage>,
    /// Provider-specific settings (region, profile, insecureSkipTLSVerify, ...)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Cloud credential for the object store, if not taken from `config`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<SecretKeySelector>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorage {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    /// PEM-encoded CA bundle used to verify the object store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
}

impl StorageLocation {
    pub fn ca_cert(&self) -> Option<&[u8]> {
        self.object_storage
            .as_ref()
            .and_then(|os| os.ca_cert.as_deref())
            .filter(|ca| !ca.is_empty())
            .map(str::as_bytes)
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Normalized provider name, without the "velero.io/" style plugin prefix.
    pub fn provider_kind(&self) -> &str {
        match self.provider.rsplit_once('/') {
            Some((_, kind)) => kind,
            None => &self.provider,
        }
    }
}
