//! Environment and flags restic needs to reach a storage location.

use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::StorageLocation;
use crate::credentials::CredentialFileStore;
use crate::error::{Error, Result};

const AWS_CREDENTIALS_FILE_ENV: &str = "AWS_SHARED_CREDENTIALS_FILE";
const AWS_PROFILE_ENV: &str = "AWS_PROFILE";
const AZURE_ACCOUNT_NAME_ENV: &str = "AZURE_ACCOUNT_NAME";
const AZURE_ACCOUNT_KEY_ENV: &str = "AZURE_ACCOUNT_KEY";
const GCP_CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Key inside an azure credentials file holding the storage account key,
/// unless the location overrides it with `storageAccountKeyEnvVar`.
const DEFAULT_AZURE_KEY_VAR: &str = "AZURE_STORAGE_ACCOUNT_ACCESS_KEY";

/// `KEY=VALUE` entries restic needs to authenticate against `location`.
/// Providers without restic-specific settings get an empty list.
///
/// Files written by `store` are pushed onto `provisioned` as soon as they
/// exist, even when a later step fails, so the caller can remove them.
pub fn cmd_env(
    location: &StorageLocation,
    store: &dyn CredentialFileStore,
    provisioned: &mut Vec<PathBuf>,
) -> Result<Vec<String>> {
    let mut env = Vec::new();
    match location.provider_kind() {
        "aws" => {
            if let Some(file) = credentials_file(location, store, provisioned)? {
                env.push(format!("{}={}", AWS_CREDENTIALS_FILE_ENV, file.display()));
            }
            if let Some(profile) = location.config_value("profile") {
                env.push(format!("{}={}", AWS_PROFILE_ENV, profile));
            }
        }
        "azure" => {
            let account = location.config_value("storageAccount").ok_or_else(|| {
                Error::Construction(format!(
                    "storage location {} has no storageAccount configured",
                    location.name
                ))
            })?;
            env.push(format!("{}={}", AZURE_ACCOUNT_NAME_ENV, account));

            let file = credentials_file(location, store, provisioned)?.ok_or_else(|| {
                Error::Construction(format!(
                    "storage location {} has no azure credentials file",
                    location.name
                ))
            })?;
            let key_var = location
                .config_value("storageAccountKeyEnvVar")
                .unwrap_or(DEFAULT_AZURE_KEY_VAR);
            let key = read_env_file_value(&file, key_var)?;
            env.push(format!("{}={}", AZURE_ACCOUNT_KEY_ENV, key));
        }
        "gcp" => {
            if let Some(file) = credentials_file(location, store, provisioned)? {
                env.push(format!("{}={}", GCP_CREDENTIALS_FILE_ENV, file.display()));
            }
        }
        other => debug!(provider = other, "no restic environment for provider"),
    }
    Ok(env)
}

/// Flag disabling TLS verification when an aws location asks for it with
/// `insecureSkipTLSVerify`. Unparsable values are logged and ignored.
pub fn insecure_skip_tls_flag(location: &StorageLocation) -> Option<String> {
    if location.provider_kind() != "aws" {
        return None;
    }
    let raw = location.config_value("insecureSkipTLSVerify")?;
    match raw.trim().to_ascii_lowercase().parse::<bool>() {
        Ok(true) => Some("--insecure-tls=true".to_string()),
        Ok(false) => None,
        Err(e) => {
            warn!(
                location = %location.name,
                value = raw,
                "ignoring invalid insecureSkipTLSVerify: {}", e
            );
            None
        }
    }
}

/// Credentials file for the object store: the location's secret if it names
/// one, else a `credentialsFile` path from its config. Only the former is
/// recorded in `provisioned`; configured paths are not ours to delete.
fn credentials_file(
    location: &StorageLocation,
    store: &dyn CredentialFileStore,
    provisioned: &mut Vec<PathBuf>,
) -> Result<Option<PathBuf>> {
    if let Some(selector) = &location.credential {
        let path = store.path(selector).map_err(|e| {
            Error::Construction(format!(
                "unable to get credentials for storage location {}: {}",
                location.name, e
            ))
        })?;
        provisioned.push(path.clone());
        return Ok(Some(path));
    }
    Ok(location.config_value("credentialsFile").map(PathBuf::from))
}

/// Look up `key` in a dotenv-style `KEY=VALUE` file.
fn read_env_file_value(path: &std::path::Path, key: &str) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Construction(format!("unable to read {}: {}", path.display(), e))
    })?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .ok_or_else(|| {
            Error::Construction(format!("{} not found in {}", key, path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SecretKeySelector;
    use std::path::Path;
    use tempfile::TempDir;

    /// Hands out a fixed path for every selector.
    struct FixedStore(PathBuf);

    impl CredentialFileStore for FixedStore {
        fn path(&self, _selector: &SecretKeySelector) -> Result<PathBuf> {
            Ok(self.0.clone())
        }
    }

    struct FailingStore;

    impl CredentialFileStore for FailingStore {
        fn path(&self, selector: &SecretKeySelector) -> Result<PathBuf> {
            Err(Error::CredentialProvision(format!("no secret {}", selector.name)))
        }
    }

    fn location(provider: &str, config: &[(&str, &str)]) -> StorageLocation {
        StorageLocation {
            name: "default".into(),
            provider: provider.into(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn aws_env_uses_credential_secret_and_profile() {
        let mut loc = location("velero.io/aws", &[("profile", "backup")]);
        loc.credential = Some(SecretKeySelector::new("cloud-credentials", "cloud"));
        let store = FixedStore(PathBuf::from("/tmp/cloud"));

        let mut provisioned = Vec::new();
        let env = cmd_env(&loc, &store, &mut provisioned).unwrap();
        assert_eq!(
            env,
            vec![
                "AWS_SHARED_CREDENTIALS_FILE=/tmp/cloud".to_string(),
                "AWS_PROFILE=backup".to_string(),
            ]
        );
        assert_eq!(provisioned, vec![PathBuf::from("/tmp/cloud")]);
    }

    #[test]
    fn aws_env_falls_back_to_configured_file() {
        let loc = location("aws", &[("credentialsFile", "/etc/aws/creds")]);
        let mut provisioned = Vec::new();
        let env = cmd_env(&loc, &FailingStore, &mut provisioned).unwrap();
        assert_eq!(env, vec!["AWS_SHARED_CREDENTIALS_FILE=/etc/aws/creds".to_string()]);
        assert!(provisioned.is_empty());
    }

    #[test]
    fn credential_failure_is_a_construction_error() {
        let mut loc = location("gcp", &[]);
        loc.credential = Some(SecretKeySelector::new("gcp-creds", "key.json"));
        let err = cmd_env(&loc, &FailingStore, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Construction(_)));
    }

    #[test]
    fn gcp_env_points_at_credentials() {
        let mut loc = location("gcp", &[]);
        loc.credential = Some(SecretKeySelector::new("gcp-creds", "key.json"));
        let env = cmd_env(&loc, &FixedStore(PathBuf::from("/tmp/key.json")), &mut Vec::new()).unwrap();
        assert_eq!(env, vec!["GOOGLE_APPLICATION_CREDENTIALS=/tmp/key.json".to_string()]);
    }

    #[test]
    fn azure_env_reads_account_key_from_file() {
        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("azure");
        fs::write(
            &creds,
            "# azure\nAZURE_SUBSCRIPTION_ID=sub\nAZURE_STORAGE_ACCOUNT_ACCESS_KEY=\"k3y\"\n",
        )
        .unwrap();
        let mut loc = location("azure", &[("storageAccount", "acct")]);
        loc.credential = Some(SecretKeySelector::new("azure-creds", "cloud"));

        let env = cmd_env(&loc, &FixedStore(creds), &mut Vec::new()).unwrap();
        assert_eq!(
            env,
            vec!["AZURE_ACCOUNT_NAME=acct".to_string(), "AZURE_ACCOUNT_KEY=k3y".to_string()]
        );
    }

    #[test]
    fn azure_without_account_fails() {
        let loc = location("azure", &[]);
        assert!(cmd_env(&loc, &FixedStore(PathBuf::from("/x")), &mut Vec::new()).is_err());
    }

    #[test]
    fn azure_records_credentials_before_key_lookup_fails() {
        let dir = TempDir::new().unwrap();
        let creds = dir.path().join("azure");
        fs::write(&creds, "AZURE_SUBSCRIPTION_ID=sub\n").unwrap();
        let mut loc = location("azure", &[("storageAccount", "acct")]);
        loc.credential = Some(SecretKeySelector::new("azure-creds", "cloud"));

        let mut provisioned = Vec::new();
        let err = cmd_env(&loc, &FixedStore(creds.clone()), &mut provisioned).unwrap_err();
        assert!(matches!(err, Error::Construction(_)));
        assert_eq!(provisioned, vec![creds]);
    }

    #[test]
    fn unknown_provider_has_no_env() {
        let loc = location("example.com/minio-gateway", &[]);
        assert!(cmd_env(&loc, &FailingStore, &mut Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn insecure_flag_only_for_true_on_aws() {
        let on = location("aws", &[("insecureSkipTLSVerify", "True")]);
        assert_eq!(insecure_skip_tls_flag(&on).as_deref(), Some("--insecure-tls=true"));

        let off = location("aws", &[("insecureSkipTLSVerify", "false")]);
        assert!(insecure_skip_tls_flag(&off).is_none());

        let garbage = location("aws", &[("insecureSkipTLSVerify", "maybe")]);
        assert!(insecure_skip_tls_flag(&garbage).is_none());

        let other = location("gcp", &[("insecureSkipTLSVerify", "true")]);
        assert!(insecure_skip_tls_flag(&other).is_none());
    }

    #[test]
    fn env_file_lookup_reports_missing_key() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("env");
        fs::write(&file, "OTHER=1\n").unwrap();
        let err = read_env_file_value(Path::new(&file), "WANTED").unwrap_err();
        assert!(err.to_string().contains("WANTED not found"));
    }
}
