//! Uploader provider backed by the restic CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Span, debug, info, info_span, warn};

use super::{BackupOutcome, BackupRequest, UploaderProvider, VolumeMode};
use crate::config::StorageLocation;
use crate::context::CallContext;
use crate::credentials::{CredentialFileStore, SecretKeySelector, temp_ca_cert_file};
use crate::error::{Error, Result};
use crate::progress::ProgressUpdater;
use crate::restic::{
    self, ResticCommand, ResticRunner, Tags, env, is_empty_snapshot_error, resolve_exclude,
};
use crate::utils::io::remove_if_present;

/// Backs up and restores volume directories with restic against one
/// repository. Owns the credential and CA files it provisions, including
/// any object-store credentials written for the location; call
/// [`UploaderProvider::close`] when done.
pub struct ResticProvider {
    repo_identifier: String,
    credentials_file: PathBuf,
    ca_cert_file: Option<PathBuf>,
    location_files: Vec<PathBuf>,
    cmd_env: Vec<String>,
    extra_flags: Vec<String>,
    runner: Arc<dyn ResticRunner>,
    log: Span,
}

impl ResticProvider {
    /// Provision credentials for `repo_identifier`, placing CA material in
    /// the system temp directory.
    pub fn new(
        repo_identifier: impl Into<String>,
        location: &StorageLocation,
        credentials: &dyn CredentialFileStore,
        repo_key: &SecretKeySelector,
        runner: Arc<dyn ResticRunner>,
    ) -> Result<Self> {
        Self::new_in(
            repo_identifier,
            location,
            credentials,
            repo_key,
            runner,
            &std::env::temp_dir(),
        )
    }

    /// Like [`ResticProvider::new`], writing CA material under `temp_dir`.
    /// On failure nothing provisioned so far is left behind.
    pub fn new_in(
        repo_identifier: impl Into<String>,
        location: &StorageLocation,
        credentials: &dyn CredentialFileStore,
        repo_key: &SecretKeySelector,
        runner: Arc<dyn ResticRunner>,
        temp_dir: &Path,
    ) -> Result<Self> {
        let repo_identifier = repo_identifier.into();
        if repo_identifier.is_empty() {
            return Err(Error::Construction("repository identifier is empty".into()));
        }
        let log = info_span!("restic_provider", location = %location.name, repo = %repo_identifier);

        let credentials_file = credentials.path(repo_key).map_err(|e| match e {
            Error::CredentialProvision(_) => e,
            other => Error::CredentialProvision(other.to_string()),
        })?;
        if credentials_file.as_os_str().is_empty() {
            return Err(Error::CredentialProvision(
                "credential store returned an empty path".into(),
            ));
        }
        let mut guard = ProvisionGuard::new(credentials_file.clone());

        // restic needs the object store's CA on disk to pass it with --cacert
        let ca_cert_file = match location.ca_cert() {
            Some(ca) => {
                let path = temp_ca_cert_file(ca, &location.name, temp_dir).map_err(|e| {
                    Error::Construction(format!("error creating temp cert file: {}", e))
                })?;
                guard.track(path.clone());
                Some(path)
            }
            None => None,
        };

        let mut location_files = Vec::new();
        let cmd_env = env::cmd_env(location, credentials, &mut location_files);
        for path in &location_files {
            guard.track(path.clone());
        }
        let cmd_env = cmd_env?;

        let mut extra_flags = Vec::new();
        if let Some(flag) = env::insecure_skip_tls_flag(location) {
            extra_flags.push(flag);
        }

        guard.disarm();
        debug!(parent: &log, ca = ca_cert_file.is_some(), flags = ?extra_flags, "restic provider ready");
        Ok(Self {
            repo_identifier,
            credentials_file,
            ca_cert_file,
            location_files,
            cmd_env,
            extra_flags,
            runner,
            log,
        })
    }

    pub fn repo_identifier(&self) -> &str {
        &self.repo_identifier
    }

    pub fn credentials_file(&self) -> &Path {
        &self.credentials_file
    }

    pub fn ca_cert_file(&self) -> Option<&Path> {
        self.ca_cert_file.as_deref()
    }

    pub fn cmd_env(&self) -> &[String] {
        &self.cmd_env
    }

    /// Flags applied to every command this provider runs.
    pub fn extra_flags(&self) -> &[String] {
        &self.extra_flags
    }

    /// The backup command for `request`, with the policy carried by `ctx`
    /// applied. Flag order: command flags, provider flags, `--parent`,
    /// policy excludes, policy flags.
    pub fn build_backup_command(&self, ctx: &CallContext, request: &BackupRequest) -> ResticCommand {
        let mut cmd = self.with_repository_context(restic::backup_command(
            &self.repo_identifier,
            &self.credentials_file,
            &request.path,
            &request.tags,
        ));

        if let Some(parent) = request.parent_snapshot.as_deref().filter(|p| !p.is_empty()) {
            cmd.extra_flags.push(format!("--parent={}", parent));
        }

        if let Some(policy) = ctx.policy().filter(|p| !p.is_empty()) {
            debug!(?policy, "using restic config");
            for exclude in &policy.excludes {
                cmd.extra_flags.push("--exclude".to_string());
                cmd.extra_flags.push(resolve_exclude(&cmd.dir, exclude));
            }
            cmd.env.extend(policy.env.iter().cloned());
            cmd.extra_flags.extend(policy.extra_flags.iter().cloned());
        }
        cmd
    }

    pub fn build_restore_command(&self, snapshot_id: &str, volume_path: &Path) -> ResticCommand {
        self.with_repository_context(restic::restore_command(
            &self.repo_identifier,
            &self.credentials_file,
            snapshot_id,
            volume_path,
        ))
    }

    fn snapshot_lookup_command(&self, tags: &Tags) -> ResticCommand {
        self.with_repository_context(restic::snapshots_command(
            &self.repo_identifier,
            &self.credentials_file,
            tags,
        ))
    }

    fn snapshot_size_command(&self, snapshot_id: &str) -> ResticCommand {
        self.with_repository_context(restic::stats_command(
            &self.repo_identifier,
            &self.credentials_file,
            snapshot_id,
        ))
    }

    /// Copy this provider's env, CA and base flags onto `cmd`.
    fn with_repository_context(&self, mut cmd: ResticCommand) -> ResticCommand {
        cmd.env = self.cmd_env.clone();
        cmd.ca_cert_file = self.ca_cert_file.clone();
        cmd.extra_flags.extend(self.extra_flags.iter().cloned());
        cmd
    }

    /// Remove every provisioned file, returning a message per failure.
    fn remove_files(&self) -> Vec<String> {
        let mut failures = Vec::new();
        let owned = std::iter::once(&self.credentials_file)
            .chain(self.ca_cert_file.as_ref())
            .chain(&self.location_files);
        for path in owned {
            match remove_if_present(path) {
                Ok(true) => debug!(path = %path.display(), "removed provisioned file"),
                Ok(false) => {}
                Err(e) => failures.push(format!("failed to remove {}: {}", path.display(), e)),
            }
        }
        failures
    }
}

impl UploaderProvider for ResticProvider {
    fn run_backup(
        &self,
        ctx: &CallContext,
        request: &BackupRequest,
        updater: Option<&dyn ProgressUpdater>,
    ) -> Result<BackupOutcome> {
        let _enter = self.log.enter();
        let updater = updater.ok_or(Error::MissingUpdater)?;

        if request.path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("path is empty".into()));
        }
        if request.real_source.as_deref().is_some_and(|s| !s.is_empty()) {
            return Err(Error::InvalidInput(
                "real source is not empty, this is not supported by restic uploader".into(),
            ));
        }
        if request.volume_mode == VolumeMode::Block {
            return Err(Error::InvalidInput("unable to support block mode".into()));
        }
        if request.force_full {
            debug!("force full has no effect, restic always deduplicates against the repository");
        }

        let cmd = self.build_backup_command(ctx, request);
        info!(
            path = %request.path.display(),
            parent_snapshot = request.parent_snapshot.as_deref().unwrap_or_default(),
            "Run command={}", cmd
        );

        let output = match self.runner.run_backup(ctx, &cmd, updater) {
            Ok(output) => output,
            Err(failure) if is_empty_snapshot_error(&failure.stderr) => {
                debug!(path = %request.path.display(), "restic backup got empty dir");
                return Ok(BackupOutcome::Empty);
            }
            Err(failure) => {
                return Err(Error::Execution {
                    command: failure.command.unwrap_or_else(|| cmd.to_string()),
                    reason: failure.reason,
                    stderr: failure.stderr,
                });
            }
        };

        let lookup = self.snapshot_lookup_command(&request.tags);
        let snapshot_id = self.runner.snapshot_id(ctx, &lookup).map_err(|f| {
            if f.stderr.is_empty() {
                Error::SnapshotResolution(f.reason)
            } else {
                Error::SnapshotResolution(format!("{} stderr: {}", f.reason, f.stderr))
            }
        })?;

        info!(
            snapshot = %snapshot_id,
            "Run command={}, stdout={}, stderr={}", cmd, output.stdout, output.stderr
        );
        Ok(BackupOutcome::Snapshot(snapshot_id))
    }

    fn run_restore(
        &self,
        ctx: &CallContext,
        snapshot_id: &str,
        volume_path: &Path,
        volume_mode: VolumeMode,
        updater: Option<&dyn ProgressUpdater>,
    ) -> Result<()> {
        let _enter = self.log.enter();
        let updater = updater.ok_or(Error::MissingUpdater)?;

        if volume_mode == VolumeMode::Block {
            return Err(Error::InvalidInput("unable to support block mode".into()));
        }

        let cmd = self.build_restore_command(snapshot_id, volume_path);
        let size_cmd = self.snapshot_size_command(snapshot_id);

        match self.runner.run_restore(ctx, &cmd, &size_cmd, updater) {
            Ok(output) => {
                info!(
                    snapshot = snapshot_id,
                    volume = %volume_path.display(),
                    "Run command={}, stdout={}, stderr={}", cmd, output.stdout, output.stderr
                );
                Ok(())
            }
            Err(failure) => Err(Error::Execution {
                command: failure.command.unwrap_or_else(|| cmd.to_string()),
                reason: failure.reason,
                stderr: failure.stderr,
            }),
        }
    }

    /// Removes the credential, CA and location credential files. Every
    /// removal is attempted; already-missing files count as removed.
    fn close(&self, _ctx: &CallContext) -> Result<()> {
        let _enter = self.log.enter();
        let failures = self.remove_files();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup(failures))
        }
    }
}

impl Drop for ResticProvider {
    fn drop(&mut self) {
        let _enter = self.log.enter();
        for failure in self.remove_files() {
            warn!("{}", failure);
        }
    }
}

/// Deletes files provisioned during construction unless construction
/// completes.
struct ProvisionGuard {
    files: Vec<PathBuf>,
    armed: bool,
}

impl ProvisionGuard {
    fn new(first: PathBuf) -> Self {
        Self {
            files: vec![first],
            armed: true,
        }
    }

    fn track(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProvisionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.files {
            if let Err(e) = remove_if_present(path) {
                warn!(path = %path.display(), "failed to remove provisioned file: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ObjectStorage, ResticConfig};
    use crate::progress::Progress;
    use crate::restic::{CommandFailure, CommandOutput};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct NoopRunner;

    impl ResticRunner for NoopRunner {
        fn run_backup(
            &self,
            _ctx: &CallContext,
            _cmd: &ResticCommand,
            _updater: &dyn ProgressUpdater,
        ) -> std::result::Result<CommandOutput, CommandFailure> {
            Ok(CommandOutput::default())
        }

        fn run_restore(
            &self,
            _ctx: &CallContext,
            _cmd: &ResticCommand,
            _size_cmd: &ResticCommand,
            _updater: &dyn ProgressUpdater,
        ) -> std::result::Result<CommandOutput, CommandFailure> {
            Ok(CommandOutput::default())
        }

        fn snapshot_id(
            &self,
            _ctx: &CallContext,
            _cmd: &ResticCommand,
        ) -> std::result::Result<String, CommandFailure> {
            Ok("abc123".into())
        }
    }

    /// Writes the repository password into a scratch dir, like a secret store would.
    struct ScratchStore {
        dir: PathBuf,
        handed_out: Mutex<Vec<PathBuf>>,
    }

    impl CredentialFileStore for ScratchStore {
        fn path(&self, selector: &SecretKeySelector) -> Result<PathBuf> {
            let path = self.dir.join(format!("{}-{}", selector.name, selector.key));
            fs::write(&path, "password")?;
            self.handed_out.lock().unwrap().push(path.clone());
            Ok(path)
        }
    }

    struct NullUpdater;

    impl ProgressUpdater for NullUpdater {
        fn update_progress(&self, _progress: &Progress) {}
    }

    fn store(dir: &Path) -> ScratchStore {
        ScratchStore {
            dir: dir.to_path_buf(),
            handed_out: Mutex::new(Vec::new()),
        }
    }

    fn aws_location(insecure: bool, ca: Option<&str>) -> StorageLocation {
        let mut loc = StorageLocation {
            name: "default".into(),
            provider: "aws".into(),
            object_storage: Some(ObjectStorage {
                bucket: "bucket".into(),
                prefix: String::new(),
                ca_cert: ca.map(str::to_string),
            }),
            ..Default::default()
        };
        if insecure {
            loc.config
                .insert("insecureSkipTLSVerify".into(), "true".into());
        }
        loc
    }

    fn provider(dir: &Path, location: &StorageLocation) -> ResticProvider {
        ResticProvider::new_in(
            "s3:s3.amazonaws.com/bucket/ns",
            location,
            &store(dir),
            &SecretKeySelector::new("repo", "password"),
            Arc::new(NoopRunner),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn empty_repository_identifier_fails_construction() {
        let dir = TempDir::new().unwrap();
        let creds = store(dir.path());
        let err = ResticProvider::new_in(
            "",
            &aws_location(false, None),
            &creds,
            &SecretKeySelector::new("repo", "password"),
            Arc::new(NoopRunner),
            dir.path(),
        )
        .err()
        .unwrap();
        assert!(err.is_construction());
        assert!(creds.handed_out.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_construction_removes_credentials() {
        let dir = TempDir::new().unwrap();
        let creds = store(dir.path());
        // azure without a storage account cannot build its env
        let location = StorageLocation {
            name: "azure".into(),
            provider: "azure".into(),
            ..Default::default()
        };
        let result = ResticProvider::new_in(
            "azure:container:/ns",
            &location,
            &creds,
            &SecretKeySelector::new("repo", "password"),
            Arc::new(NoopRunner),
            dir.path(),
        );
        assert!(result.is_err());
        let handed_out = creds.handed_out.lock().unwrap();
        assert_eq!(handed_out.len(), 1);
        assert!(!handed_out[0].exists());
    }

    #[test]
    fn failed_construction_removes_ca_and_location_credentials() {
        let dir = TempDir::new().unwrap();
        let ca_dir = TempDir::new().unwrap();
        let creds = store(dir.path());
        // the account key is missing from the credentials file, so the env
        // build fails after the CA and the location secret are on disk
        let location = StorageLocation {
            name: "azure".into(),
            provider: "azure".into(),
            object_storage: Some(ObjectStorage {
                bucket: "container".into(),
                prefix: String::new(),
                ca_cert: Some("PEM".into()),
            }),
            config: [("storageAccount".to_string(), "acct".to_string())].into(),
            credential: Some(SecretKeySelector::new("azure-creds", "cloud")),
        };
        let err = ResticProvider::new_in(
            "azure:container:/ns",
            &location,
            &creds,
            &SecretKeySelector::new("repo", "password"),
            Arc::new(NoopRunner),
            ca_dir.path(),
        )
        .err()
        .unwrap();
        assert!(err.is_construction());

        let handed_out = creds.handed_out.lock().unwrap();
        assert_eq!(handed_out.len(), 2);
        assert!(handed_out.iter().all(|p| !p.exists()));
        assert_eq!(fs::read_dir(ca_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn insecure_flag_is_a_base_flag() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(true, None));
        assert_eq!(p.extra_flags(), &["--insecure-tls=true".to_string()]);

        let cmd = p.build_restore_command("abc", Path::new("/restore"));
        assert_eq!(cmd.extra_flags, vec!["--target=.", "--insecure-tls=true"]);
    }

    #[test]
    fn ca_cert_is_written_and_passed() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(false, Some("PEM")));
        let ca = p.ca_cert_file().unwrap().to_path_buf();
        assert_eq!(fs::read_to_string(&ca).unwrap(), "PEM");

        let cmd = p.build_restore_command("abc", Path::new("/restore"));
        assert_eq!(cmd.ca_cert_file.as_deref(), Some(ca.as_path()));
    }

    #[test]
    fn policy_overlay_order() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(true, None));
        let ctx = CallContext::new().with_policy(ResticConfig {
            excludes: vec!["/etc/foo".into(), "logs/*.tmp".into()],
            env: vec!["RESTIC_PACK_SIZE=64".into()],
            extra_flags: vec!["--one-file-system".into()],
        });
        let req = BackupRequest::new("/data/src").parent("prev");

        let cmd = p.build_backup_command(&ctx, &req);
        assert_eq!(
            cmd.extra_flags,
            vec![
                "--host=restic-uploader",
                "--json",
                "--insecure-tls=true",
                "--parent=prev",
                "--exclude",
                "/data/src/etc/foo",
                "--exclude",
                "logs/*.tmp",
                "--one-file-system",
            ]
        );
        assert_eq!(cmd.env.last().map(String::as_str), Some("RESTIC_PACK_SIZE=64"));
        // the provider's own lists are untouched
        assert_eq!(p.extra_flags(), &["--insecure-tls=true".to_string()]);
        assert!(p.cmd_env().iter().all(|e| !e.starts_with("RESTIC_PACK_SIZE")));
    }

    #[test]
    fn empty_policy_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(false, None));
        let req = BackupRequest::new("/data/src");
        let with_empty = CallContext::new().with_policy(ResticConfig::default());
        assert_eq!(
            p.build_backup_command(&with_empty, &req),
            p.build_backup_command(&CallContext::new(), &req)
        );
    }

    #[test]
    fn drop_removes_unclosed_files() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(false, Some("PEM")));
        let creds = p.credentials_file().to_path_buf();
        let ca = p.ca_cert_file().unwrap().to_path_buf();
        drop(p);
        assert!(!creds.exists());
        assert!(!ca.exists());
    }

    #[test]
    fn missing_updater_wins_over_bad_input() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path(), &aws_location(false, None));
        let err = p
            .run_backup(&CallContext::new(), &BackupRequest::new(""), None)
            .unwrap_err();
        assert!(matches!(err, Error::MissingUpdater));

        let err = p
            .run_backup(&CallContext::new(), &BackupRequest::new(""), Some(&NullUpdater))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
