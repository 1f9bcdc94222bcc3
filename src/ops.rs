use anyhow::{Context, Result, anyhow};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use restic_uploader::config::load_json;
use restic_uploader::progress::BarUpdater;
use restic_uploader::{
    BackupOutcome, BackupRequest, CallContext, ProcessRunner, ResticConfig, ResticProvider,
    SecretDirStore, StorageLocation, Tags, UploaderProvider, VolumeMode,
};

use crate::cli::Cli;

pub struct BackupArgs {
    pub path: PathBuf,
    pub tags: Tags,
    pub parent: Option<String>,
    pub force_full: bool,
    pub policy: Option<PathBuf>,
    pub volume_mode: VolumeMode,
}

pub fn do_backup(cli: &Cli, args: BackupArgs) -> Result<()> {
    let mut ctx = CallContext::new();
    if let Some(policy_path) = &args.policy {
        let policy: ResticConfig = load_json(policy_path)?;
        ctx = ctx.with_policy(policy);
    }

    let provider = open_provider(cli)?;
    let request = BackupRequest {
        path: args.path.clone(),
        real_source: None,
        tags: args.tags,
        force_full: args.force_full,
        parent_snapshot: args.parent,
        volume_mode: args.volume_mode,
    };

    let bar = BarUpdater::new("Backing up");
    let result = provider.run_backup(&ctx, &request, Some(&bar));
    match &result {
        Ok(_) => bar.finish("Backup complete"),
        Err(_) => bar.abandon(),
    }
    let outcome = finish(&provider, &ctx, result)?;

    match outcome {
        BackupOutcome::Snapshot(id) => {
            println!(
                "{} {}",
                "✔".green().bold(),
                format!("Snapshot {} created for {}", id, args.path.display()).green()
            );
        }
        BackupOutcome::Empty => {
            println!(
                "{} {}",
                "i".yellow().bold(),
                format!("Nothing to back up in {}; no snapshot created", args.path.display()).yellow()
            );
        }
    }
    Ok(())
}

pub fn do_restore(cli: &Cli, snapshot: &str, target: &Path, volume_mode: VolumeMode) -> Result<()> {
    let ctx = CallContext::new();
    let provider = open_provider(cli)?;

    let bar = BarUpdater::new("Restoring");
    let result = provider.run_restore(&ctx, snapshot, target, volume_mode, Some(&bar));
    match &result {
        Ok(()) => bar.finish("Restore complete"),
        Err(_) => bar.abandon(),
    }
    finish(&provider, &ctx, result)?;

    println!(
        "{} {}",
        "✔".green().bold(),
        format!("Snapshot {} restored to {}", snapshot, target.display()).green()
    );
    Ok(())
}

pub fn do_version() {
    println!("{} {}", "restic-uploader".bold(), env!("CARGO_PKG_VERSION").cyan());
}

fn open_provider(cli: &Cli) -> Result<ResticProvider> {
    let location_path = cli
        .location
        .as_deref()
        .ok_or_else(|| anyhow!("--location is required"))?;
    let repo = cli
        .repo
        .as_deref()
        .ok_or_else(|| anyhow!("--repo is required"))?;

    let location: StorageLocation = load_json(location_path)?;
    let store = SecretDirStore::new(&cli.secrets_dir);
    let runner = Arc::new(ProcessRunner::new(&cli.restic));
    ResticProvider::new(repo, &location, &store, &cli.repo_key, runner)
        .context("failed to set up restic provider")
}

/// Close the provider whatever the outcome. The operation's own error takes
/// precedence; a close failure after it is only reported.
fn finish<T>(
    provider: &ResticProvider,
    ctx: &CallContext,
    result: restic_uploader::Result<T>,
) -> Result<T> {
    let closed = provider.close(ctx);
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err).context("operation succeeded but cleanup failed"),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                eprintln!("{} {}: {}", "!".yellow().bold(), "Warning".yellow(), close_err);
            }
            Err(err.into())
        }
    }
}
