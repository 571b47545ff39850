//! Progress UI for a running task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use rangeload::download::{DownloadStatus, DownloadTask};
use rangeload::units::HumanBytes;

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    task: DownloadTask,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar_inner(task, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_bar_inner(task: DownloadTask, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        let files = task.files().len();
        while !stop.load(Ordering::SeqCst) {
            let progress = task.progress();
            let active = task
                .files()
                .iter()
                .position(|f| f.status() != DownloadStatus::Completed)
                .unwrap_or(files);

            bar.set_length(progress.total.unwrap_or(0));
            bar.set_position(progress.downloaded);
            let total = progress
                .total
                .map_or_else(|| "?".to_string(), |t| HumanBytes(t).to_string());
            bar.set_message(format!(
                "[{}/{}] {} / {} ({})",
                (active + 1).min(files),
                files,
                HumanBytes(progress.downloaded),
                total,
                task.status()
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        bar.finish_and_clear();
    })
}
