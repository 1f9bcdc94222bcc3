//! Running restic and interpreting its output.
//!
//! [`ResticRunner`] is the seam between the provider and the operating
//! system; [`ProcessRunner`] is the real implementation. Output capture
//! follows the usual pattern of draining both pipes on helper threads while
//! the calling thread handles progress and cancellation.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::ResticCommand;
use crate::context::CallContext;
use crate::progress::{Progress, ProgressUpdater};
use crate::utils::io::dir_size;

/// How often the output loop wakes up to check for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default period between restore progress samples.
const RESTORE_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Captured output of a successful restic run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A restic run that failed, with whatever it wrote to stderr.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct CommandFailure {
    pub reason: String,
    pub stderr: String,
    /// The command that failed, when it is not the one the caller asked for
    pub command: Option<String>,
}

impl CommandFailure {
    pub fn new(reason: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            stderr: stderr.into(),
            command: None,
        }
    }

    pub fn with_command(mut self, cmd: &ResticCommand) -> Self {
        self.command = Some(cmd.to_string());
        self
    }
}

/// Executes restic commands on behalf of a provider.
pub trait ResticRunner: Send + Sync {
    /// Run a `backup` command, reporting progress as it goes. On success the
    /// returned stdout is restic's summary line.
    fn run_backup(
        &self,
        ctx: &CallContext,
        cmd: &ResticCommand,
        updater: &dyn ProgressUpdater,
    ) -> Result<CommandOutput, CommandFailure>;

    /// Run a `restore` command. `size_cmd` is the matching `stats` command
    /// used to learn how many bytes the restore will write.
    fn run_restore(
        &self,
        ctx: &CallContext,
        cmd: &ResticCommand,
        size_cmd: &ResticCommand,
        updater: &dyn ProgressUpdater,
    ) -> Result<CommandOutput, CommandFailure>;

    /// Run a `snapshots` lookup and return the single matching snapshot id.
    fn snapshot_id(&self, ctx: &CallContext, cmd: &ResticCommand) -> Result<String, CommandFailure>;
}

/// Runs restic as a child process.
pub struct ProcessRunner {
    binary: PathBuf,
    restore_progress_interval: Duration,
}

impl ProcessRunner {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            restore_progress_interval: RESTORE_PROGRESS_INTERVAL,
        }
    }

    pub fn with_restore_progress_interval(mut self, interval: Duration) -> Self {
        self.restore_progress_interval = interval;
        self
    }

    /// Spawn `cmd`, feed each stdout line to `on_line` and call `on_tick`
    /// every `tick_every` until the child exits.
    fn execute(
        &self,
        ctx: &CallContext,
        cmd: &ResticCommand,
        on_line: &mut dyn FnMut(&str),
        tick_every: Option<Duration>,
        on_tick: &mut dyn FnMut(),
    ) -> Result<CommandOutput, CommandFailure> {
        if ctx.is_cancelled() {
            return Err(CommandFailure::new(
                "context cancelled before restic was started",
                "",
            ));
        }

        debug!(command = %cmd, "starting restic");
        let mut child = cmd.to_process(&self.binary).spawn().map_err(|e| {
            CommandFailure::new(format!("failed to start {}: {}", self.binary.display(), e), "")
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CommandFailure::new("restic output pipes were not captured", ""));
        };

        let (tx, rx) = mpsc::channel();
        let stdout_thread = thread::spawn(move || capture_lines(stdout, tx));
        let stderr_thread = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = BufReader::new(stderr).read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut stdout_lines: Vec<String> = Vec::new();
        let mut killed = false;
        let mut last_tick = Instant::now();
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    on_line(&line);
                    stdout_lines.push(line);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if killed {
                // a grandchild may still hold the pipes open
                if matches!(child.try_wait(), Ok(Some(_))) {
                    break;
                }
                continue;
            }
            if ctx.is_cancelled() {
                warn!(command = %cmd, "context cancelled, killing restic");
                let _ = child.kill();
                killed = true;
                continue;
            }
            if let Some(every) = tick_every {
                if last_tick.elapsed() >= every {
                    on_tick();
                    last_tick = Instant::now();
                }
            }
        }

        let status = child
            .wait()
            .map_err(|e| CommandFailure::new(format!("failed to wait for restic: {}", e), ""))?;
        if killed {
            return Err(CommandFailure::new(
                "context cancelled while restic was running",
                "",
            ));
        }
        let _ = stdout_thread.join();
        let stderr = stderr_thread.join().unwrap_or_default();

        if !status.success() {
            return Err(CommandFailure::new(status.to_string(), stderr));
        }
        Ok(CommandOutput {
            stdout: stdout_lines.join("\n"),
            stderr,
        })
    }
}

impl ResticRunner for ProcessRunner {
    fn run_backup(
        &self,
        ctx: &CallContext,
        cmd: &ResticCommand,
        updater: &dyn ProgressUpdater,
    ) -> Result<CommandOutput, CommandFailure> {
        updater.update_progress(&Progress::default());

        let mut on_line = |line: &str| {
            if let Some(progress) = parse_backup_status(line) {
                updater.update_progress(&progress);
            }
        };
        let output = self.execute(ctx, cmd, &mut on_line, None, &mut || {})?;

        let (summary, total) = backup_summary(&output.stdout)
            .map_err(|reason| CommandFailure::new(reason, output.stderr.clone()))?;
        updater.update_progress(&Progress::complete(total));

        Ok(CommandOutput {
            stdout: summary,
            stderr: output.stderr,
        })
    }

    fn run_restore(
        &self,
        ctx: &CallContext,
        cmd: &ResticCommand,
        size_cmd: &ResticCommand,
        updater: &dyn ProgressUpdater,
    ) -> Result<CommandOutput, CommandFailure> {
        let stats = self
            .execute(ctx, size_cmd, &mut |_| {}, None, &mut || {})
            .map_err(|f| {
                CommandFailure::new(format!("error getting snapshot size: {}", f.reason), f.stderr)
                    .with_command(size_cmd)
            })?;
        let total = parse_snapshot_size(&stats.stdout).map_err(|reason| {
            CommandFailure::new(reason, stats.stderr.clone()).with_command(size_cmd)
        })?;
        updater.update_progress(&Progress::new(total, 0));

        let target = cmd.dir.clone();
        let mut on_tick = || {
            let done = dir_size(&target);
            if done > 0 {
                updater.update_progress(&Progress::new(total, done));
            }
        };
        let output = self.execute(
            ctx,
            cmd,
            &mut |_| {},
            Some(self.restore_progress_interval),
            &mut on_tick,
        )?;

        updater.update_progress(&Progress::complete(total));
        Ok(output)
    }

    fn snapshot_id(&self, ctx: &CallContext, cmd: &ResticCommand) -> Result<String, CommandFailure> {
        let output = self.execute(ctx, cmd, &mut |_| {}, None, &mut || {})?;
        parse_snapshot_id(&output.stdout)
            .map_err(|reason| CommandFailure::new(format!("{} (command: {})", reason, cmd), output.stderr))
    }
}

/// Forward each line of `reader` to `tx`. Invalid UTF-8 is replaced rather
/// than ending the capture.
fn capture_lines<R: Read>(reader: R, tx: Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if tx.send(line.to_string()).is_err() {
                    break;
                }
            }
        }
    }
}

/// One line of `restic backup --json` output.
#[derive(Deserialize)]
struct BackupStatusLine {
    message_type: String,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    bytes_done: u64,
    #[serde(default)]
    total_bytes_processed: u64,
}

/// Progress from a `status` line, once restic knows the total size.
pub fn parse_backup_status(line: &str) -> Option<Progress> {
    let status: BackupStatusLine = serde_json::from_str(line).ok()?;
    if status.message_type != "status" || status.total_bytes == 0 {
        return None;
    }
    Some(Progress::new(status.total_bytes, status.bytes_done))
}

/// The last `summary` line of a backup and the bytes it processed.
pub fn backup_summary(stdout: &str) -> Result<(String, u64), String> {
    stdout
        .lines()
        .rev()
        .find_map(|line| {
            let parsed: BackupStatusLine = serde_json::from_str(line).ok()?;
            (parsed.message_type == "summary")
                .then(|| (line.to_string(), parsed.total_bytes_processed))
        })
        .ok_or_else(|| "unable to find summary in restic backup command output".to_string())
}

#[derive(Deserialize)]
struct SnapshotRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    short_id: String,
    #[serde(default)]
    time: Option<DateTime<FixedOffset>>,
}

/// Id of the only snapshot in `restic snapshots --json` output.
pub fn parse_snapshot_id(stdout: &str) -> Result<String, String> {
    let snapshots: Vec<SnapshotRecord> = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("error unmarshalling restic snapshots result: {}", e))?;
    if snapshots.len() != 1 {
        return Err(format!("expected one matching snapshot, got {}", snapshots.len()));
    }
    let snapshot = &snapshots[0];
    let id = if snapshot.short_id.is_empty() {
        &snapshot.id
    } else {
        &snapshot.short_id
    };
    if id.is_empty() {
        return Err("restic returned a snapshot without an id".to_string());
    }
    if let Some(time) = snapshot.time {
        debug!(snapshot = %id, %time, "resolved snapshot");
    }
    Ok(id.clone())
}

#[derive(Deserialize)]
struct StatsLine {
    total_size: u64,
}

/// Total size from `restic stats --json` output.
pub fn parse_snapshot_size(stdout: &str) -> Result<u64, String> {
    let stats: StatsLine = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("error unmarshalling restic stats result: {}", e))?;
    Ok(stats.total_size)
}
