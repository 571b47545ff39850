//! A single remote resource and its transfer lifecycle.
//!
//! A [`DownloadFile`] negotiates its resource up front, then moves through the
//! [`DownloadStatus`] machine under external control. Each successful
//! `start`/`resume` opens a new *episode*: a spawned read loop that drives the
//! [`pipeline`](super::pipeline) into the destination file until the body
//! ends, an error occurs, or the episode is cancelled.
//!
//! Status, error and metadata sit behind one `std::sync::Mutex` that is never
//! held across an `.await`. Episode management (`start`, `resume`, `stop`) is
//! serialized by an async mutex, and `stop`/`resume` await the previous read
//! loop before returning, so the file handle and connection are closed by then.

use std::any::Any;
use std::io::SeekFrom;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use futures_util::FutureExt;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::client::{HttpClient, ensure_success, head_unsupported, resource_info, resumed_range};
use super::constants::WRITE_BUFFER_BYTES;
use super::error::DownloadError;
use super::filename::{FALLBACK_FILENAME, filename_from_url};
use super::limiter::SpeedLimiter;
use super::pipeline::{Chunk, EpisodeControls, PauseSignal, ReadStage, ResponseSource, assemble};
use super::status::{DownloadStatus, StatusCell};

/// Receives a file's terminal transitions (`Completed` or `Failed`).
///
/// Called from the file's read loop after the destination file is closed.
/// Implementations must not block. The observer must not own the file, or
/// the pair would keep each other alive.
pub(crate) trait FileObserver: Send + Sync {
    fn file_finished(&self, file: &DownloadFile);
}

/// Point-in-time view of a [`DownloadFile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub path: PathBuf,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub status: DownloadStatus,
    /// Display form of the retained error, present exactly when `Failed`.
    pub error: Option<String>,
    pub resumable: bool,
    /// Bytes per second, `0` = unlimited.
    pub rate_limit: u64,
}

/// One remote resource downloaded into a local directory.
///
/// Cloning is cheap and yields another handle to the same file.
#[derive(Clone)]
pub struct DownloadFile {
    shared: Arc<FileShared>,
}

impl std::fmt::Debug for DownloadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadFile")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url)
            .field("status", &self.status())
            .field("downloaded", &self.downloaded())
            .finish_non_exhaustive()
    }
}

struct FileShared {
    id: Uuid,
    url: String,
    dir: PathBuf,
    client: HttpClient,
    /// Written only by the active read loop, reset when an episode opens.
    downloaded: Arc<AtomicU64>,
    state: Mutex<FileState>,
    pause: PauseSignal,
    observer: OnceLock<Arc<dyn FileObserver>>,
    transfer: tokio::sync::Mutex<Option<Transfer>>,
}

struct FileState {
    name: String,
    total: Option<u64>,
    cell: StatusCell,
    resumable: bool,
    rate_limit: u64,
    /// Limiter of the current episode, retuned by `set_rate_limit`.
    limiter: Option<Arc<SpeedLimiter>>,
}

struct Transfer {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// A request that succeeded and a destination positioned to receive it.
struct Opened {
    response: Response,
    file: File,
    path: PathBuf,
    expected: Option<u64>,
}

enum EpisodeEnd {
    Completed,
    Interrupted,
}

/// What `start`/`resume` should do given the current status.
enum Gate {
    Proceed,
    Skip,
}

impl DownloadFile {
    /// Creates a queued file. Nothing is requested until
    /// [`negotiate`](Self::negotiate) or [`start`](Self::start).
    #[must_use]
    pub fn new(
        client: HttpClient,
        url: impl Into<String>,
        dir: impl Into<PathBuf>,
        rate_limit: u64,
    ) -> Self {
        let url = url.into();
        let name = Url::parse(&url)
            .map(|u| filename_from_url(&u))
            .unwrap_or_else(|_| FALLBACK_FILENAME.to_string());
        Self {
            shared: Arc::new(FileShared {
                id: Uuid::new_v4(),
                url,
                dir: dir.into(),
                client,
                downloaded: Arc::new(AtomicU64::new(0)),
                state: Mutex::new(FileState {
                    name,
                    total: None,
                    cell: StatusCell::default(),
                    resumable: false,
                    rate_limit,
                    limiter: None,
                }),
                pause: PauseSignal::new(),
                observer: OnceLock::new(),
                transfer: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub(crate) fn set_observer(&self, observer: Arc<dyn FileObserver>) {
        if self.shared.observer.set(observer).is_err() {
            debug!(file = %self.shared.id, "observer already attached");
        }
    }

    fn state(&self) -> MutexGuard<'_, FileState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn parsed_url(&self) -> Result<Url, DownloadError> {
        Url::parse(&self.shared.url).map_err(|_| DownloadError::invalid_url(&self.shared.url))
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Display name, also the destination file name.
    #[must_use]
    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    /// Destination path: the directory joined with the display name.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.shared.dir.join(&self.state().name)
    }

    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.shared.downloaded.load(Ordering::SeqCst)
    }

    /// Total size in bytes, `None` until known.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.state().total
    }

    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.state().cell.status()
    }

    /// The retained error; `Some` exactly when the status is `Failed`.
    #[must_use]
    pub fn error(&self) -> Option<DownloadError> {
        self.state().cell.error().cloned()
    }

    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.state().resumable
    }

    /// Current limit in bytes per second, `0` = unlimited.
    #[must_use]
    pub fn rate_limit(&self) -> u64 {
        self.state().rate_limit
    }

    /// Consistent view of status, error and metadata.
    #[must_use]
    pub fn snapshot(&self) -> FileSnapshot {
        let state = self.state();
        FileSnapshot {
            id: self.shared.id,
            url: self.shared.url.clone(),
            name: state.name.clone(),
            path: self.shared.dir.join(&state.name),
            downloaded: self.downloaded(),
            total: state.total,
            status: state.cell.status(),
            error: state.cell.error().map(ToString::to_string),
            resumable: state.resumable,
            rate_limit: state.rate_limit,
        }
    }

    /// Learns size, display name and resumability without transferring.
    ///
    /// Sends HEAD, falling back to GET (body discarded) when the server
    /// answers 405 or 501. Only a queued file negotiates; on a failed file
    /// this returns the retained error.
    ///
    /// # Errors
    ///
    /// Any request error; the file is then `Failed` with the same error.
    #[instrument(skip(self), fields(url = %self.shared.url))]
    pub async fn negotiate(&self) -> Result<(), DownloadError> {
        match self.gate()? {
            Gate::Skip => return Ok(()),
            Gate::Proceed if self.status() != DownloadStatus::Queued => return Ok(()),
            Gate::Proceed => {}
        }

        match self.try_negotiate().await {
            Ok(info) => {
                debug!(
                    name = %info.name,
                    total = ?info.total,
                    resumable = info.resumable,
                    "negotiated"
                );
                let mut state = self.state();
                state.name = info.name;
                state.total = info.total;
                state.resumable = info.resumable;
                Ok(())
            }
            Err(error) => {
                warn!(%error, "negotiation failed");
                self.state().cell.fail(error.clone());
                Err(error)
            }
        }
    }

    async fn try_negotiate(&self) -> Result<super::client::ResourceInfo, DownloadError> {
        let url = self.parsed_url()?;
        let client = &self.shared.client;

        let mut response = client.send(Method::HEAD, &url, None).await?;
        if head_unsupported(response.status()) {
            debug!(status = response.status().as_u16(), "HEAD unsupported, falling back to GET");
            response = client.send(Method::GET, &url, None).await?;
        }
        let response = ensure_success(response, &url)?;
        Ok(resource_info(&response, &url))
    }

    /// Starts a fresh transfer from offset zero.
    ///
    /// Any paused or stopped episode is shut down first. Size, name and
    /// resumability are re-read from the GET response. No-op on a completed
    /// or already started file.
    ///
    /// # Errors
    ///
    /// The retained error of a failed file, or any request or file-open error
    /// (which also moves the file to `Failed`).
    #[instrument(skip(self), fields(url = %self.shared.url))]
    pub async fn start(&self) -> Result<(), DownloadError> {
        let mut transfer = self.shared.transfer.lock().await;
        if let Gate::Skip = self.gate()? {
            return Ok(());
        }

        shutdown(transfer.take()).await;
        let opened = self.open_fresh().await;
        self.launch(&mut transfer, opened)
    }

    /// Continues from the current offset with a Range request.
    ///
    /// Falls back to [`start`](Self::start) when the resource is not resumable
    /// or nothing has been downloaded yet. The paused or stopped episode is
    /// shut down before the offset is read, so the request asks for exactly
    /// the bytes not yet written.
    ///
    /// # Errors
    ///
    /// As for `start`, plus [`DownloadError::ResumeRejected`] when the server
    /// does not answer 206 and [`DownloadError::RangeParse`] when its
    /// `Content-Range` is unusable.
    #[instrument(skip(self), fields(url = %self.shared.url))]
    pub async fn resume(&self) -> Result<(), DownloadError> {
        let mut transfer = self.shared.transfer.lock().await;
        if let Gate::Skip = self.gate()? {
            return Ok(());
        }

        shutdown(transfer.take()).await;
        let offset = self.downloaded();
        let opened = if self.is_resumable() && offset > 0 {
            self.open_ranged(offset).await
        } else {
            debug!(offset, "not resumable from here, restarting from zero");
            self.open_fresh().await
        };
        self.launch(&mut transfer, opened)
    }

    /// Cooperatively pauses a started transfer. The connection and file stay
    /// open; no-op unless `Started`.
    pub fn pause(&self) {
        let mut state = self.state();
        if state.cell.status() == DownloadStatus::Started {
            state.cell.set(DownloadStatus::Paused);
            self.shared.pause.pause();
            debug!(file = %self.shared.id, downloaded = self.downloaded(), "paused");
        }
    }

    /// Stops a started or paused transfer and waits for its read loop to
    /// close the file and connection. Progress is kept for a later resume.
    #[instrument(skip(self), fields(url = %self.shared.url))]
    pub async fn stop(&self) {
        let mut transfer = self.shared.transfer.lock().await;
        {
            let mut state = self.state();
            if !state.cell.status().is_active() {
                return;
            }
            state.cell.set(DownloadStatus::Stopped);
        }
        shutdown(transfer.take()).await;
        debug!(downloaded = self.downloaded(), "stopped");
    }

    /// Changes the limit (`0` = unlimited), including for a live transfer.
    pub fn set_rate_limit(&self, bytes_per_sec: u64) {
        let mut state = self.state();
        state.rate_limit = bytes_per_sec;
        if let Some(limiter) = &state.limiter {
            limiter.set_limit(bytes_per_sec);
        }
    }

    /// Removes the destination file, ignoring a missing one.
    pub(crate) async fn remove_data(&self) -> Result<(), DownloadError> {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::io(path, e)),
        }
    }

    fn gate(&self) -> Result<Gate, DownloadError> {
        let state = self.state();
        match state.cell.status() {
            DownloadStatus::Failed => Err(state
                .cell
                .error()
                .cloned()
                .unwrap_or_else(|| DownloadError::fault(&self.shared.url, "failed without error"))),
            DownloadStatus::Completed | DownloadStatus::Started => Ok(Gate::Skip),
            DownloadStatus::Queued | DownloadStatus::Paused | DownloadStatus::Stopped => {
                Ok(Gate::Proceed)
            }
        }
    }

    async fn open_fresh(&self) -> Result<Opened, DownloadError> {
        let url = self.parsed_url()?;
        let response = self.shared.client.send(Method::GET, &url, None).await?;
        let response = ensure_success(response, &url)?;
        let info = resource_info(&response, &url);

        let path = {
            let mut state = self.state();
            state.name = info.name;
            state.total = info.total;
            state.resumable = info.resumable;
            self.shared.dir.join(&state.name)
        };
        self.shared.downloaded.store(0, Ordering::SeqCst);
        let file = open_destination(&path, 0).await?;

        Ok(Opened {
            response,
            file,
            path,
            expected: info.total,
        })
    }

    async fn open_ranged(&self, offset: u64) -> Result<Opened, DownloadError> {
        let url = self.parsed_url()?;
        let response = self.shared.client.send(Method::GET, &url, Some(offset)).await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::resume_rejected(
                url.as_str(),
                response.status().as_u16(),
            ));
        }
        let (start, range) = resumed_range(&response, offset)?;
        debug!(requested = offset, start, size = ?range.size, "resuming");

        let (path, total) = {
            let mut state = self.state();
            if range.size.is_some() {
                state.total = range.size;
            }
            (self.shared.dir.join(&state.name), state.total)
        };
        self.shared.downloaded.store(start, Ordering::SeqCst);
        let file = open_destination(&path, start).await?;

        Ok(Opened {
            response,
            file,
            path,
            expected: range.len().or_else(|| total.map(|t| t.saturating_sub(start))),
        })
    }

    /// Moves to `Started` and spawns the read loop, or records the failure.
    fn launch(
        &self,
        slot: &mut Option<Transfer>,
        opened: Result<Opened, DownloadError>,
    ) -> Result<(), DownloadError> {
        let opened = match opened {
            Ok(opened) => opened,
            Err(error) => {
                warn!(%error, "transfer could not start");
                self.state().cell.fail(error.clone());
                return Err(error);
            }
        };

        let cancel = CancellationToken::new();
        let limiter = {
            let mut state = self.state();
            let limiter = Arc::new(SpeedLimiter::new(state.rate_limit));
            state.limiter = Some(Arc::clone(&limiter));
            state.cell.set(DownloadStatus::Started);
            limiter
        };
        self.shared.pause.resume();

        let keep_going = {
            let cancel = cancel.clone();
            Box::new(move |_: usize| !cancel.is_cancelled())
        };
        let pipeline = assemble(
            Box::new(ResponseSource::new(opened.response, cancel.clone())),
            EpisodeControls {
                expected: opened.expected,
                limiter,
                pause: self.shared.pause.clone(),
                counter: Arc::clone(&self.shared.downloaded),
                cancel: cancel.clone(),
                keep_going,
            },
        );

        let file = self.clone();
        let episode_cancel = cancel.clone();
        let handle = tokio::spawn(file.run_episode(pipeline, opened.file, opened.path, episode_cancel));
        *slot = Some(Transfer { handle, cancel });
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(file = %self.shared.id))]
    async fn run_episode(
        self,
        pipeline: Box<dyn ReadStage>,
        file: File,
        path: PathBuf,
        cancel: CancellationToken,
    ) {
        let outcome = AssertUnwindSafe(self.pump(pipeline, file, &path, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(DownloadError::fault(&self.shared.url, panic_message(payload.as_ref())))
            });
        self.finish(outcome);
    }

    /// The read loop. Owns the destination file; it is closed when this returns.
    async fn pump(
        &self,
        mut pipeline: Box<dyn ReadStage>,
        file: File,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<EpisodeEnd, DownloadError> {
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
        let io_err = |e| DownloadError::io(path, e);

        loop {
            let chunk = match pipeline.read_chunk().await {
                Ok(chunk) => chunk,
                Err(error) => {
                    if let Err(flush_error) = writer.flush().await {
                        debug!(error = %flush_error, "flush after failed read also failed");
                    }
                    return Err(error);
                }
            };

            match chunk {
                Chunk::Data(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        self.shared
                            .downloaded
                            .fetch_sub(bytes.len() as u64, Ordering::SeqCst);
                        return Err(io_err(e));
                    }
                }
                Chunk::Idle => {
                    // A paused episode is only ever ended by `resume` or `stop`,
                    // both of which cancel it and open a fresh one.
                    writer.flush().await.map_err(io_err)?;
                    cancel.cancelled().await;
                    return Ok(EpisodeEnd::Interrupted);
                }
                Chunk::Stopped => {
                    writer.flush().await.map_err(io_err)?;
                    return Ok(EpisodeEnd::Interrupted);
                }
                Chunk::End => {
                    writer.flush().await.map_err(io_err)?;
                    let downloaded = self.downloaded();
                    if let Some(total) = self.total()
                        && downloaded < total
                    {
                        return Err(DownloadError::truncated(total, total - downloaded));
                    }
                    writer.get_ref().set_len(downloaded).await.map_err(io_err)?;
                    return Ok(EpisodeEnd::Completed);
                }
            }
        }
    }

    fn finish(&self, outcome: Result<EpisodeEnd, DownloadError>) {
        let notify = {
            let mut state = self.state();
            match outcome {
                Ok(EpisodeEnd::Completed) => {
                    state.cell.set(DownloadStatus::Completed);
                    state.limiter = None;
                    info!(name = %state.name, bytes = self.downloaded(), "download complete");
                    true
                }
                Ok(EpisodeEnd::Interrupted) => {
                    debug!(status = %state.cell.status(), "read loop interrupted");
                    false
                }
                Err(error) if state.cell.status() == DownloadStatus::Stopped => {
                    warn!(%error, "discarding error raised after stop");
                    false
                }
                Err(error) => {
                    warn!(%error, name = %state.name, "download failed");
                    state.cell.fail(error);
                    state.limiter = None;
                    true
                }
            }
        };

        if notify && let Some(observer) = self.shared.observer.get() {
            observer.file_finished(self);
        }
    }
}

/// Cancels an episode and waits for its read loop to exit.
async fn shutdown(transfer: Option<Transfer>) {
    if let Some(transfer) = transfer {
        transfer.cancel.cancel();
        if let Err(error) = transfer.handle.await {
            warn!(%error, "read loop ended abnormally");
        }
    }
}

/// Opens (creating, never truncating) the destination and seeks to `offset`.
async fn open_destination(path: &Path, offset: u64) -> Result<File, DownloadError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(file)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    async fn wait_for_status(file: &DownloadFile, wanted: DownloadStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while file.status() != wanted {
            assert!(
                tokio::time::Instant::now() < deadline,
                "file stuck in {} waiting for {wanted}",
                file.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_negotiate_reads_head_metadata() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("HEAD"))
            .and(path("/iso"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("Content-Disposition", "attachment; filename=\"disk.iso\"")
                    .set_body_bytes(vec![0u8; 2048]),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let file = DownloadFile::new(
            HttpClient::new(),
            format!("{}/iso", mock_server.uri()),
            temp_dir.path(),
            0,
        );
        file.negotiate().await.unwrap();

        assert_eq!(file.name(), "disk.iso");
        assert_eq!(file.total(), Some(2048));
        assert!(file.is_resumable());
        assert_eq!(file.status(), DownloadStatus::Queued);
        assert_eq!(file.path(), temp_dir.path().join("disk.iso"));
    }

    #[tokio::test]
    async fn test_negotiate_falls_back_to_get_when_head_not_allowed() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 300]))
            .expect(1)
            .mount(&mock_server)
            .await;

        let file = DownloadFile::new(
            HttpClient::new(),
            format!("{}/data.bin", mock_server.uri()),
            temp_dir.path(),
            0,
        );
        file.negotiate().await.unwrap();

        assert_eq!(file.total(), Some(300));
        assert_eq!(file.name(), "data.bin");
        assert!(!file.is_resumable());
    }

    #[tokio::test]
    async fn test_failed_negotiation_is_retained_and_blocks_start() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let file = DownloadFile::new(
            HttpClient::new(),
            format!("{}/gone", mock_server.uri()),
            temp_dir.path(),
            0,
        );
        assert!(file.negotiate().await.is_err());
        assert_eq!(file.status(), DownloadStatus::Failed);
        assert!(matches!(
            file.error(),
            Some(DownloadError::HttpStatus { status: 404, .. })
        ));

        let err = file.start().await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
        let err = file.resume().await.unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn test_invalid_url_fails_negotiation() {
        let temp_dir = TempDir::new().unwrap();
        let file = DownloadFile::new(HttpClient::new(), "not a url", temp_dir.path(), 0);

        let err = tokio_test::block_on(file.negotiate()).unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
        assert_eq!(file.status(), DownloadStatus::Failed);
        assert!(file.error().is_some());
    }

    #[tokio::test]
    async fn test_start_downloads_and_truncates_stale_tail() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("small.txt"), b"an older, much longer body").unwrap();

        Mock::given(method("GET"))
            .and(path("/small.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh".to_vec()))
            .mount(&mock_server)
            .await;

        let file = DownloadFile::new(
            HttpClient::new(),
            format!("{}/small.txt", mock_server.uri()),
            temp_dir.path(),
            0,
        );
        file.start().await.unwrap();
        wait_for_status(&file, DownloadStatus::Completed).await;

        assert_eq!(std::fs::read(file.path()).unwrap(), b"fresh");
        assert_eq!(file.downloaded(), 5);
        assert_eq!(file.total(), Some(5));
        assert!(file.error().is_none());

        // Starting a completed file is a no-op.
        file.start().await.unwrap();
        assert_eq!(file.status(), DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_rejected_when_server_ignores_range() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let body = vec![3u8; 1024 * 1024];

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(body),
            )
            .mount(&mock_server)
            .await;

        let file = DownloadFile::new(
            HttpClient::new(),
            format!("{}/ignores-range.bin", mock_server.uri()),
            temp_dir.path(),
            1024,
        );
        file.start().await.unwrap();
        // At 1 KiB/s roughly one kilobyte has been admitted by now.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        file.stop().await;
        assert_eq!(file.status(), DownloadStatus::Stopped);
        assert!(file.downloaded() > 0);

        let err = file.resume().await.unwrap_err();
        assert!(matches!(err, DownloadError::ResumeRejected { status: 200, .. }), "{err}");
        assert_eq!(file.status(), DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn test_pause_and_stop_are_noops_when_not_started() {
        let temp_dir = TempDir::new().unwrap();
        let file = DownloadFile::new(HttpClient::new(), "http://127.0.0.1:1/x", temp_dir.path(), 0);

        file.pause();
        assert_eq!(file.status(), DownloadStatus::Queued);
        file.stop().await;
        assert_eq!(file.status(), DownloadStatus::Queued);
    }

    #[tokio::test]
    async fn test_set_rate_limit_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let file = DownloadFile::new(HttpClient::new(), "http://127.0.0.1:1/x", temp_dir.path(), 10);
        file.set_rate_limit(0);
        assert_eq!(file.rate_limit(), 0);
        assert_eq!(file.snapshot().rate_limit, 0);
    }

    struct Exploding;

    #[async_trait::async_trait]
    impl ReadStage for Exploding {
        async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
            panic!("stage exploded");
        }
    }

    struct CountingObserver(std::sync::atomic::AtomicUsize);

    impl FileObserver for CountingObserver {
        fn file_finished(&self, _file: &DownloadFile) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_panicking_read_loop_fails_the_file_and_notifies() {
        let temp_dir = TempDir::new().unwrap();
        let file = DownloadFile::new(HttpClient::new(), "http://127.0.0.1:1/boom.bin", temp_dir.path(), 0);
        let observer = Arc::new(CountingObserver(std::sync::atomic::AtomicUsize::new(0)));
        file.set_observer(Arc::clone(&observer) as Arc<dyn FileObserver>);
        file.state().cell.set(DownloadStatus::Started);

        let path = file.path();
        let destination = open_destination(&path, 0).await.unwrap();
        file.clone()
            .run_episode(Box::new(Exploding), destination, path, CancellationToken::new())
            .await;

        assert_eq!(file.status(), DownloadStatus::Failed);
        match file.error() {
            Some(DownloadError::Fault { url, message }) => {
                assert_eq!(url, "http://127.0.0.1:1/boom.bin");
                assert!(message.contains("stage exploded"), "{message}");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    struct AlwaysIdle(Arc<std::sync::atomic::AtomicUsize>);

    #[async_trait::async_trait]
    impl ReadStage for AlwaysIdle {
        async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Chunk::Idle)
        }
    }

    #[tokio::test]
    async fn test_paused_read_loop_waits_for_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        let file = DownloadFile::new(HttpClient::new(), "http://127.0.0.1:1/idle.bin", temp_dir.path(), 0);
        let observer = Arc::new(CountingObserver(std::sync::atomic::AtomicUsize::new(0)));
        file.set_observer(Arc::clone(&observer) as Arc<dyn FileObserver>);
        file.state().cell.set(DownloadStatus::Paused);

        let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let path = file.path();
        let destination = open_destination(&path, 0).await.unwrap();
        let cancel = CancellationToken::new();
        let episode = tokio::spawn(file.clone().run_episode(
            Box::new(AlwaysIdle(Arc::clone(&polls))),
            destination,
            path,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!episode.is_finished());
        // One read, then the loop parks instead of spinning.
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), episode)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status(), DownloadStatus::Paused);
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
