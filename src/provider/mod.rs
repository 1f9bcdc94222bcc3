use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::context::CallContext;
use crate::error::Result;
use crate::progress::ProgressUpdater;
use crate::restic::Tags;

pub mod restic;

pub use restic::ResticProvider;

/// How a persistent volume presents its data.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "Filesystem"),
            VolumeMode::Block => write!(f, "Block"),
        }
    }
}

impl FromStr for VolumeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" => Ok(VolumeMode::Filesystem),
            "block" => Ok(VolumeMode::Block),
            other => Err(format!("unknown volume mode '{}'", other)),
        }
    }
}

/// One backup of a volume directory.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub path: PathBuf,
    /// Alternative source to read from; unsupported by restic
    pub real_source: Option<String>,
    pub tags: Tags,
    pub force_full: bool,
    pub parent_snapshot: Option<String>,
    pub volume_mode: VolumeMode,
}

impl BackupRequest {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn parent(mut self, snapshot_id: impl Into<String>) -> Self {
        self.parent_snapshot = Some(snapshot_id.into());
        self
    }

    pub fn volume_mode(mut self, mode: VolumeMode) -> Self {
        self.volume_mode = mode;
        self
    }
}

/// Result of a backup that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// restic created a snapshot with this id
    Snapshot(String),
    /// The source had nothing to back up; no snapshot exists
    Empty,
}

impl BackupOutcome {
    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            BackupOutcome::Snapshot(id) => Some(id),
            BackupOutcome::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BackupOutcome::Empty)
    }
}

/// A data mover that backs up and restores volume directories.
pub trait UploaderProvider {
    fn run_backup(
        &self,
        ctx: &CallContext,
        request: &BackupRequest,
        updater: Option<&dyn ProgressUpdater>,
    ) -> Result<BackupOutcome>;

    fn run_restore(
        &self,
        ctx: &CallContext,
        snapshot_id: &str,
        volume_path: &Path,
        volume_mode: VolumeMode,
        updater: Option<&dyn ProgressUpdater>,
    ) -> Result<()>;

    /// Release everything the provider put on disk.
    fn close(&self, ctx: &CallContext) -> Result<()>;
}
