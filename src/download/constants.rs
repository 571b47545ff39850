//! Constants for the download module (timeouts, rate limiting, buffering).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes between body reads).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Longest single sleep inside a limiter wait, so rate changes and
/// cancellation are noticed promptly.
pub const LIMITER_WAIT_SLICE: Duration = Duration::from_millis(100);

/// Capacity of the buffered writer in front of each destination file.
pub const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Rate limit value meaning "unlimited".
pub const UNLIMITED: u64 = 0;
