//! Resumable, rate-limited HTTP download engine.
//!
//! A [`DownloadTask`] owns an ordered set of [`DownloadFile`]s and transfers
//! them one at a time into a destination directory. Each file negotiates its
//! resource up front (size, name, `Accept-Ranges`), streams the body through a
//! pipeline of [`ReadStage`]s, and can be paused, stopped and resumed with an
//! HTTP Range request from the exact byte it stopped at.
//!
//! # Features
//!
//! - Range-based resume with `Content-Range` validation
//! - Token-bucket throughput limit, adjustable on a live transfer
//! - Cooperative pause without dropping the connection
//! - Consistent status/error contract (`Failed` exactly when an error is held)
//! - Configurable timeouts (30s connect, 5min read by default)
//!
//! # Example
//!
//! ```no_run
//! use rangeload::download::{DownloadStatus, DownloadTask, HttpClient, TaskOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let task = DownloadTask::create(
//!     HttpClient::new(),
//!     ["https://example.com/disk.iso"],
//!     "./downloads",
//!     TaskOptions { rate_limit: 1024 * 1024, ..TaskOptions::default() },
//! )
//! .await?;
//!
//! task.start().await?;
//! if task.settled().await == DownloadStatus::Completed {
//!     println!("{} bytes", task.progress().downloaded);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod content_range;
mod error;
mod file;
mod filename;
mod limiter;
pub mod pipeline;
mod status;
mod task;

pub use client::HttpClient;
pub use content_range::ContentRange;
pub use error::DownloadError;
pub use file::{DownloadFile, FileSnapshot};
pub use limiter::{Cancelled, SpeedLimiter};
pub use pipeline::{Chunk, PauseSignal, ReadStage};
pub use status::DownloadStatus;
pub use task::{DownloadTask, TaskOptions, TaskProgress, TaskSnapshot, TaskType};

// Note: no module-local Result alias.
// Use `Result<T, DownloadError>` explicitly in function signatures.
