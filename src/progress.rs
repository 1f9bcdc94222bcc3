use indicatif::{ProgressBar, ProgressStyle};

/// Byte-level progress of a running backup or restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total_bytes: u64,
    pub bytes_done: u64,
}

impl Progress {
    pub fn new(total_bytes: u64, bytes_done: u64) -> Self {
        Self {
            total_bytes,
            bytes_done,
        }
    }

    /// Progress for a finished operation of `total` bytes.
    pub fn complete(total: u64) -> Self {
        Self::new(total, total)
    }
}

/// Receives progress as restic produces it. Called synchronously from the
/// thread running the command, so implementations must return promptly.
pub trait ProgressUpdater: Send + Sync {
    fn update_progress(&self, progress: &Progress);
}

/// Renders progress on an indicatif bar.
pub struct BarUpdater {
    bar: ProgressBar,
}

impl BarUpdater {
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({eta})",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn length(&self) -> Option<u64> {
        self.bar.length()
    }
}

impl ProgressUpdater for BarUpdater {
    fn update_progress(&self, progress: &Progress) {
        self.bar.set_length(progress.total_bytes);
        self.bar.set_position(progress.bytes_done);
    }
}
