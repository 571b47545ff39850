//! Read-stage pipeline between a response body and the destination file.
//!
//! Each stage wraps the next one and implements [`ReadStage`]. A transfer
//! episode always assembles them in the same order, innermost first:
//!
//! ```text
//! ResponseSource -> BoundLength -> Throttle -> Pausable -> Progress
//! ```
//!
//! The read loop only ever talks to the outermost stage and reacts to the
//! [`Chunk`] it gets back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Response;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::error::DownloadError;
use super::limiter::SpeedLimiter;

/// One step of the pipeline's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes to write.
    Data(Bytes),
    /// Nothing delivered because the transfer is paused.
    Idle,
    /// The expected bytes have all arrived.
    End,
    /// The episode was stopped; not an error.
    Stopped,
}

/// A stage of the read pipeline.
#[async_trait]
pub trait ReadStage: Send {
    /// Produces the next chunk.
    ///
    /// # Errors
    ///
    /// Returns the first network or truncation error seen by this stage or an
    /// inner one.
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError>;
}

/// Continuation callback consulted for every chunk; `false` stops the episode.
pub type KeepGoing = Box<dyn FnMut(usize) -> bool + Send>;

/// Level-triggered pause flag shared by a file and its read loop.
#[derive(Debug, Clone)]
pub struct PauseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PauseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseSignal {
    /// Creates an unpaused signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raises the flag.
    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    /// Clears the flag.
    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Innermost stage: reads the HTTP response body.
pub struct ResponseSource {
    response: Response,
    url: String,
    cancel: CancellationToken,
}

impl ResponseSource {
    #[must_use]
    pub fn new(response: Response, cancel: CancellationToken) -> Self {
        let url = response.url().to_string();
        Self {
            response,
            url,
            cancel,
        }
    }
}

#[async_trait]
impl ReadStage for ResponseSource {
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Ok(Chunk::Stopped),
            chunk = self.response.chunk() => match chunk {
                Ok(Some(bytes)) => Ok(Chunk::Data(bytes)),
                Ok(None) => Ok(Chunk::End),
                Err(e) => Err(DownloadError::from_request(&self.url, e)),
            },
        }
    }
}

/// Never yields more than the expected bytes; reports a short body as
/// [`DownloadError::Truncated`].
pub struct BoundLength {
    inner: Box<dyn ReadStage>,
    expected: u64,
    remaining: Option<u64>,
}

impl BoundLength {
    /// `expected` is the number of bytes this episode should deliver, or
    /// `None` when the total is unknown (pass-through).
    #[must_use]
    pub fn new(inner: Box<dyn ReadStage>, expected: Option<u64>) -> Self {
        Self {
            inner,
            expected: expected.unwrap_or(0),
            remaining: expected,
        }
    }
}

#[async_trait]
impl ReadStage for BoundLength {
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
        if self.remaining == Some(0) {
            return Ok(Chunk::End);
        }

        match self.inner.read_chunk().await? {
            Chunk::Data(mut bytes) => {
                if let Some(remaining) = self.remaining {
                    if bytes.len() as u64 > remaining {
                        trace!(
                            received = bytes.len(),
                            remaining,
                            "discarding bytes past the expected length"
                        );
                        bytes.truncate(usize::try_from(remaining).unwrap_or(usize::MAX));
                    }
                    self.remaining = Some(remaining - bytes.len() as u64);
                }
                Ok(Chunk::Data(bytes))
            }
            Chunk::End => match self.remaining {
                Some(remaining) if remaining > 0 => {
                    Err(DownloadError::truncated(self.expected, remaining))
                }
                _ => Ok(Chunk::End),
            },
            other => Ok(other),
        }
    }
}

/// Holds data back until the limiter admits it.
///
/// Chunks larger than the limiter's capacity are released in capacity-sized
/// pieces; the rest is kept for the following reads.
pub struct Throttle {
    inner: Box<dyn ReadStage>,
    limiter: Arc<SpeedLimiter>,
    cancel: CancellationToken,
    pending: Option<Bytes>,
}

impl Throttle {
    #[must_use]
    pub fn new(
        inner: Box<dyn ReadStage>,
        limiter: Arc<SpeedLimiter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            limiter,
            cancel,
            pending: None,
        }
    }
}

#[async_trait]
impl ReadStage for Throttle {
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
        let mut bytes = match self.pending.take() {
            Some(bytes) => bytes,
            None => match self.inner.read_chunk().await? {
                Chunk::Data(bytes) => bytes,
                other => return Ok(other),
            },
        };

        let piece = match self.limiter.max_piece() {
            Some(max) if bytes.len() > max => {
                let piece = bytes.split_to(max);
                self.pending = Some(bytes);
                piece
            }
            _ => bytes,
        };

        if self.limiter.wait_n(piece.len(), &self.cancel).await.is_err() {
            return Ok(Chunk::Stopped);
        }
        Ok(Chunk::Data(piece))
    }
}

/// Returns [`Chunk::Idle`] without touching inner stages while paused.
pub struct Pausable {
    inner: Box<dyn ReadStage>,
    pause: PauseSignal,
}

impl Pausable {
    #[must_use]
    pub fn new(inner: Box<dyn ReadStage>, pause: PauseSignal) -> Self {
        Self { inner, pause }
    }
}

#[async_trait]
impl ReadStage for Pausable {
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
        if self.pause.is_paused() {
            return Ok(Chunk::Idle);
        }
        self.inner.read_chunk().await
    }
}

/// Outermost stage: asks the continuation callback about every chunk and
/// counts the ones it accepts.
pub struct Progress {
    inner: Box<dyn ReadStage>,
    counter: Arc<AtomicU64>,
    keep_going: KeepGoing,
}

impl Progress {
    #[must_use]
    pub fn new(inner: Box<dyn ReadStage>, counter: Arc<AtomicU64>, keep_going: KeepGoing) -> Self {
        Self {
            inner,
            counter,
            keep_going,
        }
    }
}

#[async_trait]
impl ReadStage for Progress {
    async fn read_chunk(&mut self) -> Result<Chunk, DownloadError> {
        match self.inner.read_chunk().await? {
            Chunk::Data(bytes) => {
                if !(self.keep_going)(bytes.len()) {
                    return Ok(Chunk::Stopped);
                }
                self.counter
                    .fetch_add(bytes.len() as u64, Ordering::SeqCst);
                Ok(Chunk::Data(bytes))
            }
            other => Ok(other),
        }
    }
}

/// Per-episode inputs for [`assemble`].
pub struct EpisodeControls {
    /// Bytes this episode should deliver, when known.
    pub expected: Option<u64>,
    pub limiter: Arc<SpeedLimiter>,
    pub pause: PauseSignal,
    pub counter: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub keep_going: KeepGoing,
}

/// Wraps `source` in the standard stage order and returns the outermost stage.
#[must_use]
pub fn assemble(source: Box<dyn ReadStage>, controls: EpisodeControls) -> Box<dyn ReadStage> {
    let bounded = Box::new(BoundLength::new(source, controls.expected));
    let throttled = Box::new(Throttle::new(bounded, controls.limiter, controls.cancel));
    let pausable = Box::new(Pausable::new(throttled, controls.pause));
    Box::new(Progress::new(pausable, controls.counter, controls.keep_going))
}
