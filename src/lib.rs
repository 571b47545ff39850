//! Rangeload Core Library
//!
//! Resumable, rate-limited HTTP downloads of one or more files into a
//! directory, with pause, stop and Range-based resume.
//!
//! # Architecture
//!
//! - [`download`] - tasks, files, the read pipeline and the speed limiter
//! - [`units`] - human-readable byte counts for progress output

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod download;
pub mod units;
mod user_agent;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use download::{
    ContentRange, DownloadError, DownloadFile, DownloadStatus, DownloadTask, HttpClient,
    SpeedLimiter, TaskOptions, TaskProgress, TaskType,
};
