//! Multi-file download task.
//!
//! A [`DownloadTask`] owns an ordered list of [`DownloadFile`]s and transfers
//! them one at a time. Scanning for the next file is serialized by an async
//! sequencing lock; every operation that changes which file is active takes it.
//!
//! Files report terminal transitions through a [`FileObserver`] link that only
//! holds a weak reference to the task. A completion re-scans (advancing to the
//! next file, or completing the task); a failure fails the task and halts
//! sequencing, leaving later files queued.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::client::HttpClient;
use super::error::DownloadError;
use super::file::{DownloadFile, FileObserver, FileSnapshot};
use super::filename::FALLBACK_FILENAME;
use super::status::{DownloadStatus, StatusCell};

/// Transfer protocol of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Plain HTTP(S) downloads.
    #[default]
    Http,
    /// Peer-to-peer; declared but not implemented, rejected at creation.
    P2p,
}

impl TaskType {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::P2p => "p2p",
        }
    }
}

/// Options for [`DownloadTask::create`].
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Display name; defaults to the first file's name.
    pub name: Option<String>,
    /// Default limit for every file in bytes per second, `0` = unlimited.
    pub rate_limit: u64,
    pub task_type: TaskType,
}

/// Aggregated byte counts over a task's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub downloaded: u64,
    /// `None` while any file's size is unknown.
    pub total: Option<u64>,
}

impl TaskProgress {
    /// Completed fraction in `0.0..=1.0`, when the total is known and non-zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.downloaded as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Point-in-time view of a [`DownloadTask`] and its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub name: String,
    pub dir: PathBuf,
    pub task_type: TaskType,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub rate_limit: u64,
    pub files: Vec<FileSnapshot>,
}

/// An ordered set of files downloaded sequentially into one directory.
#[derive(Clone)]
pub struct DownloadTask {
    shared: Arc<TaskShared>,
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("status", &self.status())
            .field("files", &self.shared.files.len())
            .finish_non_exhaustive()
    }
}

struct TaskShared {
    id: Uuid,
    name: String,
    dir: PathBuf,
    task_type: TaskType,
    files: Vec<DownloadFile>,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<DownloadStatus>,
    sequencing: tokio::sync::Mutex<()>,
}

struct TaskState {
    cell: StatusCell,
    rate_limit: u64,
}

/// Weak back-reference handed to each file.
struct TaskLink(Weak<TaskShared>);

impl FileObserver for TaskLink {
    fn file_finished(&self, file: &DownloadFile) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        let task = DownloadTask { shared };

        match file.status() {
            DownloadStatus::Completed => {
                tokio::spawn(async move { task.on_file_completed().await });
            }
            DownloadStatus::Failed => {
                if let Some(error) = file.error() {
                    warn!(task = %task.shared.id, file = %file.name(), %error, "file failed, halting task");
                    task.update(|cell| cell.fail_first(error));
                }
            }
            other => debug!(status = %other, "ignoring non-terminal file notification"),
        }
    }
}

impl DownloadTask {
    /// Creates a task for `urls` under `dir` and negotiates every file.
    ///
    /// A file whose negotiation fails is recorded as `Failed`; creation still
    /// succeeds.
    ///
    /// # Errors
    ///
    /// [`DownloadError::UnsupportedTaskType`] for anything but
    /// [`TaskType::Http`], or [`DownloadError::Io`] when `dir` cannot be
    /// created.
    #[instrument(skip(client, urls, dir, options), fields(name = ?options.name))]
    pub async fn create<I, S>(
        client: HttpClient,
        urls: I,
        dir: impl Into<PathBuf>,
        options: TaskOptions,
    ) -> Result<Self, DownloadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if options.task_type != TaskType::Http {
            return Err(DownloadError::UnsupportedTaskType {
                kind: options.task_type.as_str(),
            });
        }

        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(&dir, e))?;

        let files: Vec<DownloadFile> = urls
            .into_iter()
            .map(|url| DownloadFile::new(client.clone(), url, &dir, options.rate_limit))
            .collect();
        for file in &files {
            if let Err(error) = file.negotiate().await {
                debug!(url = file.url(), %error, "file recorded as failed");
            }
        }

        let name = options
            .name
            .or_else(|| files.first().map(DownloadFile::name))
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
        let (status_tx, _) = watch::channel(DownloadStatus::Queued);

        let shared = Arc::new_cyclic(|weak: &Weak<TaskShared>| {
            let link: Arc<dyn FileObserver> = Arc::new(TaskLink(weak.clone()));
            for file in &files {
                file.set_observer(Arc::clone(&link));
            }
            TaskShared {
                id: Uuid::new_v4(),
                name,
                dir,
                task_type: options.task_type,
                files,
                state: Mutex::new(TaskState {
                    cell: StatusCell::default(),
                    rate_limit: options.rate_limit,
                }),
                status_tx,
                sequencing: tokio::sync::Mutex::new(()),
            }
        });

        info!(task = %shared.id, files = shared.files.len(), "task created");
        Ok(Self { shared })
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a status change and publishes the new status.
    fn update<R>(&self, change: impl FnOnce(&mut StatusCell) -> R) -> R {
        let mut state = self.state();
        let result = change(&mut state.cell);
        self.shared.status_tx.send_replace(state.cell.status());
        result
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    #[must_use]
    pub fn task_type(&self) -> TaskType {
        self.shared.task_type
    }

    /// Files in transfer order.
    #[must_use]
    pub fn files(&self) -> &[DownloadFile] {
        &self.shared.files
    }

    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.state().cell.status()
    }

    /// First error observed; `Some` exactly when the status is `Failed`.
    #[must_use]
    pub fn error(&self) -> Option<DownloadError> {
        self.state().cell.error().cloned()
    }

    #[must_use]
    pub fn rate_limit(&self) -> u64 {
        self.state().rate_limit
    }

    /// Watches status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DownloadStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Waits until the task is no longer `Started` and returns its status.
    pub async fn settled(&self) -> DownloadStatus {
        let mut rx = self.subscribe();
        match rx.wait_for(|status| *status != DownloadStatus::Started).await {
            Ok(status) => *status,
            // The sender lives as long as `self`.
            Err(_) => self.status(),
        }
    }

    /// Sums downloaded and total bytes over all files.
    #[must_use]
    pub fn progress(&self) -> TaskProgress {
        let mut progress = TaskProgress {
            downloaded: 0,
            total: Some(0),
        };
        for file in &self.shared.files {
            progress.downloaded += file.downloaded();
            progress.total = match (progress.total, file.total()) {
                (Some(sum), Some(total)) => Some(sum + total),
                _ => None,
            };
        }
        progress
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let progress = self.progress();
        let (status, error, rate_limit) = {
            let state = self.state();
            (
                state.cell.status(),
                state.cell.error().map(ToString::to_string),
                state.rate_limit,
            )
        };
        TaskSnapshot {
            id: self.shared.id,
            name: self.shared.name.clone(),
            dir: self.shared.dir.clone(),
            task_type: self.shared.task_type,
            status,
            error,
            downloaded: progress.downloaded,
            total: progress.total,
            rate_limit,
            files: self.shared.files.iter().map(DownloadFile::snapshot).collect(),
        }
    }

    /// Starts, or continues after pause/stop, the first unfinished file.
    ///
    /// No-op when already started or completed.
    ///
    /// # Errors
    ///
    /// The retained error of a failed task, or the error that kept the next
    /// file from starting (the task is then `Failed`).
    #[instrument(skip(self), fields(task = %self.shared.id))]
    pub async fn start(&self) -> Result<(), DownloadError> {
        let _sequencing = self.shared.sequencing.lock().await;
        let resume = {
            let state = self.state();
            match state.cell.status() {
                DownloadStatus::Started | DownloadStatus::Completed => return Ok(()),
                DownloadStatus::Failed => {
                    return Err(state.cell.error().cloned().unwrap_or_else(|| {
                        DownloadError::fault(self.shared.name.clone(), "failed without error")
                    }));
                }
                DownloadStatus::Paused | DownloadStatus::Stopped => true,
                DownloadStatus::Queued => false,
            }
        };
        self.advance(resume).await
    }

    /// Pauses the active file. No-op unless `Started`.
    #[instrument(skip(self), fields(task = %self.shared.id))]
    pub async fn pause(&self) {
        let _sequencing = self.shared.sequencing.lock().await;
        if self.status() != DownloadStatus::Started {
            return;
        }
        self.update(|cell| cell.set(DownloadStatus::Paused));
        for file in &self.shared.files {
            file.pause();
        }
    }

    /// Stops the active file and waits for its read loop to exit. No-op
    /// unless `Started` or `Paused`.
    #[instrument(skip(self), fields(task = %self.shared.id))]
    pub async fn stop(&self) {
        let _sequencing = self.shared.sequencing.lock().await;
        if !self.status().is_active() {
            return;
        }
        self.update(|cell| cell.set(DownloadStatus::Stopped));
        for file in &self.shared.files {
            file.stop().await;
        }
    }

    /// Changes the task default and every file's limit (`0` = unlimited).
    pub fn set_rate_limit(&self, bytes_per_sec: u64) {
        self.state().rate_limit = bytes_per_sec;
        for file in &self.shared.files {
            file.set_rate_limit(bytes_per_sec);
        }
        debug!(task = %self.shared.id, bytes_per_sec, "task rate limit changed");
    }

    /// Stops the task and drops it, keeping downloaded data.
    pub async fn delete(self) {
        self.stop().await;
        debug!(task = %self.shared.id, "task deleted");
    }

    /// Stops the task, drops it and removes every file's local data.
    /// Files that were never written are ignored.
    ///
    /// # Errors
    ///
    /// The first removal error; removal is still attempted for every file.
    pub async fn delete_with_data(self) -> Result<(), DownloadError> {
        self.stop().await;
        let mut first_error = None;
        for file in &self.shared.files {
            if let Err(error) = file.remove_data().await {
                warn!(%error, "could not remove downloaded data");
                first_error.get_or_insert(error);
            }
        }
        debug!(task = %self.shared.id, "task deleted with data");
        first_error.map_or(Ok(()), Err)
    }

    async fn on_file_completed(&self) {
        let _sequencing = self.shared.sequencing.lock().await;
        if self.status() != DownloadStatus::Started {
            return;
        }
        if let Err(error) = self.advance(false).await {
            debug!(%error, "task halted after file completion");
        }
    }

    /// A file that failed right after starting has already failed the task
    /// through its observer; that outcome stands.
    fn mark_started(&self) {
        self.update(|cell| {
            if cell.status() != DownloadStatus::Failed {
                cell.set(DownloadStatus::Started);
            }
        });
    }

    /// Scans files in order and (re)starts the first unfinished one.
    /// Caller holds the sequencing lock.
    async fn advance(&self, resume: bool) -> Result<(), DownloadError> {
        for file in &self.shared.files {
            match file.status() {
                DownloadStatus::Completed => {}
                DownloadStatus::Failed => {
                    let error = file.error().unwrap_or_else(|| {
                        DownloadError::fault(file.url(), "failed without error")
                    });
                    self.update(|cell| cell.fail_first(error.clone()));
                    return Err(error);
                }
                DownloadStatus::Started => {
                    self.mark_started();
                    return Ok(());
                }
                DownloadStatus::Queued | DownloadStatus::Paused | DownloadStatus::Stopped => {
                    debug!(file = %file.name(), resume, "activating file");
                    let result = if resume {
                        file.resume().await
                    } else {
                        file.start().await
                    };
                    return match result {
                        Ok(()) => {
                            self.mark_started();
                            Ok(())
                        }
                        Err(error) => {
                            self.update(|cell| cell.fail_first(error.clone()));
                            Err(error)
                        }
                    };
                }
            }
        }

        self.update(|cell| cell.set(DownloadStatus::Completed));
        info!(task = %self.shared.id, name = %self.shared.name, "task complete");
        Ok(())
    }
}
