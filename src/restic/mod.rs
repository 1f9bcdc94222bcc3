//! restic command construction.
//!
//! A [`ResticCommand`] describes one restic invocation. The builders here
//! produce the command-specific part; the provider layers repository
//! context (CA, env, base flags) and per-call policy on top.

pub mod env;
pub mod exec;

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

pub use exec::{CommandFailure, CommandOutput, ProcessRunner, ResticRunner};

/// Snapshot tags. Ordered so that generated flags are reproducible.
pub type Tags = BTreeMap<String, String>;

/// Host recorded on every snapshot this uploader creates.
pub const SNAPSHOT_HOST: &str = "restic-uploader";

/// stderr text restic emits when a backup source had nothing to save.
const EMPTY_SNAPSHOT_MARKER: &str = "snapshot is empty";

/// Whether a failed backup's stderr means "nothing to back up" rather than
/// a real failure. restic reports this case only through its message text,
/// so any wording change upstream must be mirrored here.
pub fn is_empty_snapshot_error(stderr: &str) -> bool {
    stderr.contains(EMPTY_SNAPSHOT_MARKER)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResticCommand {
    pub command: String,
    pub repo_identifier: String,
    pub password_file: PathBuf,
    pub ca_cert_file: Option<PathBuf>,
    /// Working directory; empty means inherit the caller's
    pub dir: PathBuf,
    pub args: Vec<String>,
    pub extra_flags: Vec<String>,
    /// `KEY=VALUE` entries added to the inherited environment
    pub env: Vec<String>,
}

impl ResticCommand {
    /// Full argument vector, starting with the program name.
    pub fn string_slice(&self) -> Vec<String> {
        let mut res = vec![
            "restic".to_string(),
            self.command.clone(),
            format!("--repo={}", self.repo_identifier),
            format!("--password-file={}", self.password_file.display()),
        ];
        if let Some(ca) = &self.ca_cert_file {
            res.push(format!("--cacert={}", ca.display()));
        }
        res.extend(self.args.iter().cloned());
        res.extend(self.extra_flags.iter().cloned());
        res
    }

    /// A process for this command using `binary` in place of `restic`.
    /// stdout and stderr are piped; stdin is closed.
    pub fn to_process(&self, binary: &Path) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(self.string_slice().iter().skip(1));
        if !self.dir.as_os_str().is_empty() {
            cmd.current_dir(&self.dir);
        }
        cmd.envs(self.env.iter().filter_map(|kv| kv.split_once('=')));
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        cmd
    }
}

impl fmt::Display for ResticCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string_slice().join(" "))
    }
}

fn base_command(command: &str, repo_identifier: &str, password_file: &Path) -> ResticCommand {
    ResticCommand {
        command: command.to_string(),
        repo_identifier: repo_identifier.to_string(),
        password_file: password_file.to_path_buf(),
        ..Default::default()
    }
}

/// `restic backup .` run from inside `path`, emitting JSON progress.
pub fn backup_command(
    repo_identifier: &str,
    password_file: &Path,
    path: &Path,
    tags: &Tags,
) -> ResticCommand {
    let mut extra_flags = backup_tag_flags(tags);
    extra_flags.push(format!("--host={}", SNAPSHOT_HOST));
    extra_flags.push("--json".to_string());
    ResticCommand {
        dir: path.to_path_buf(),
        args: vec![".".to_string()],
        extra_flags,
        ..base_command("backup", repo_identifier, password_file)
    }
}

/// `restic restore <id> --target=.` run from inside `target`.
pub fn restore_command(
    repo_identifier: &str,
    password_file: &Path,
    snapshot_id: &str,
    target: &Path,
) -> ResticCommand {
    ResticCommand {
        dir: target.to_path_buf(),
        args: vec![snapshot_id.to_string()],
        extra_flags: vec!["--target=.".to_string()],
        ..base_command("restore", repo_identifier, password_file)
    }
}

/// Latest snapshot carrying all of `tags`, as JSON.
pub fn snapshots_command(repo_identifier: &str, password_file: &Path, tags: &Tags) -> ResticCommand {
    let mut args = vec!["--json".to_string(), "--last".to_string()];
    if let Some(flag) = snapshot_tag_flag(tags) {
        args.push(flag);
    }
    ResticCommand {
        args,
        ..base_command("snapshots", repo_identifier, password_file)
    }
}

/// Size statistics of one snapshot, as JSON.
pub fn stats_command(repo_identifier: &str, password_file: &Path, snapshot_id: &str) -> ResticCommand {
    ResticCommand {
        args: vec!["-q".to_string(), "--json".to_string(), snapshot_id.to_string()],
        ..base_command("stats", repo_identifier, password_file)
    }
}

/// One `--tag=key=value` per tag.
fn backup_tag_flags(tags: &Tags) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("--tag={}={}", k, v)).collect()
}

/// A single `--tag=k1=v1,k2=v2` filter matching snapshots that carry every tag.
fn snapshot_tag_flag(tags: &Tags) -> Option<String> {
    if tags.is_empty() {
        return None;
    }
    let joined = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("--tag={}", joined))
}

/// Resolve an exclude pattern against the backup's working directory.
///
/// restic treats a leading `/` as the filesystem root, but backups run with
/// the volume root as working directory, so absolute patterns are re-anchored
/// under `dir`. `..` components are clamped at `dir`. Relative patterns are
/// returned unchanged.
pub fn resolve_exclude(dir: &Path, pattern: &str) -> String {
    if !pattern.starts_with('/') {
        return pattern.to_string();
    }
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(pattern).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    let mut resolved = dir.to_path_buf();
    resolved.extend(parts);
    resolved.to_string_lossy().into_owned()
}
