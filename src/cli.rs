use clap::{Parser, Subcommand};
use std::path::PathBuf;

use restic_uploader::{SecretKeySelector, VolumeMode};

/// restic-uploader: back up and restore volume directories with restic
#[derive(Parser, Debug)]
#[command(name = "restic-uploader", version, about = "Back up and restore volume directories with restic.", long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Storage location JSON file
    #[arg(short = 'l', long = "location", global = true)]
    pub location: Option<PathBuf>,

    /// restic repository identifier (e.g., s3:s3.amazonaws.com/bucket/restic/ns)
    #[arg(short = 'r', long = "repo", global = true)]
    pub repo: Option<String>,

    /// Directory of mounted secrets laid out as <name>/<key>
    #[arg(long = "secrets-dir", global = true, default_value = "/credentials")]
    pub secrets_dir: PathBuf,

    /// Secret holding the repository password, as <name>/<key>
    #[arg(long = "repo-key", global = true, default_value = "velero-repo-credentials/repository-password")]
    pub repo_key: SecretKeySelector,

    /// restic executable to run
    #[arg(long = "restic", global = true, default_value = "restic")]
    pub restic: PathBuf,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up a volume directory and print the snapshot id
    Backup {
        /// Directory to back up
        #[arg(short = 'p', long = "path")]
        path: PathBuf,

        /// Snapshot tag as key=value (repeatable)
        #[arg(short = 't', long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,

        /// Snapshot to use as deduplication baseline
        #[arg(long)]
        parent: Option<String>,

        /// Request a full backup
        #[arg(long)]
        force_full: bool,

        /// Resource policy JSON file with restic excludes, env and flags
        #[arg(long, value_name = "file")]
        policy: Option<PathBuf>,

        /// Volume mode of the source (filesystem or block)
        #[arg(long, default_value = "filesystem")]
        volume_mode: VolumeMode,
    },

    /// Restore a snapshot into a volume directory
    Restore {
        /// Snapshot id to restore
        #[arg(short = 's', long = "snapshot")]
        snapshot: String,

        /// Directory to restore into
        #[arg(short = 'p', long = "target")]
        target: PathBuf,

        /// Volume mode of the target (filesystem or block)
        #[arg(long, default_value = "filesystem")]
        volume_mode: VolumeMode,
    },

    /// Print CLI version
    Version,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}
