//! HTTP client wrapper and response-header negotiation.
//!
//! `HttpClient` is created once and shared by every file of every task, so
//! connections are pooled. Automatic decompression stays off: byte counts must
//! match `Content-Length` and range offsets.

use std::time::Duration;

use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Method, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use super::content_range::ContentRange;
use super::error::DownloadError;
use super::filename::resolve_filename;
use crate::user_agent;

/// HTTP client for negotiating and transferring downloads.
///
/// # Example
///
/// ```no_run
/// use rangeload::download::HttpClient;
///
/// let client = HttpClient::new_with_timeouts(10, 60);
/// # let _ = client;
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes between body reads
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// The read timeout bounds each wait for response data, not the whole
    /// transfer, so large or throttled downloads are not cut off.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new_with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(user_agent::default_download_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Sends a request, optionally asking for the resource from `range_from`
    /// onwards. The response is returned whatever its status.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub(crate) async fn send(
        &self,
        method: Method,
        url: &Url,
        range_from: Option<u64>,
    ) -> Result<Response, DownloadError> {
        let mut request = self.client.request(method, url.clone());
        if let Some(offset) = range_from {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_request(url.as_str(), e))?;
        debug!(status = response.status().as_u16(), "response received");
        Ok(response)
    }
}

/// Rejects non-2xx responses with [`DownloadError::HttpStatus`].
pub(crate) fn ensure_success(response: Response, url: &Url) -> Result<Response, DownloadError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DownloadError::http_status(url.as_str(), status.as_u16()))
    }
}

/// Returns true for the statuses that mean "this server does not do HEAD".
pub(crate) fn head_unsupported(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    )
}

/// What a response says about the resource behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResourceInfo {
    pub(crate) total: Option<u64>,
    pub(crate) name: String,
    pub(crate) resumable: bool,
}

/// Reads size, display name and resumability from a full (non-partial)
/// response's headers.
///
/// The size comes straight from the `Content-Length` header: a HEAD response
/// has no body, so the body-derived length would read as zero.
pub(crate) fn resource_info(response: &Response, url: &Url) -> ResourceInfo {
    let headers = response.headers();
    let total = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let disposition = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok());
    let resumable = headers
        .get_all(ACCEPT_RANGES)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|unit| unit.trim().eq_ignore_ascii_case("bytes"));

    ResourceInfo {
        total,
        name: resolve_filename(disposition, url),
        resumable,
    }
}

/// Parses and checks the `Content-Range` of a 206 answering
/// `Range: bytes=<requested>-`, returning the confirmed start offset.
///
/// The server may start earlier than asked (the overlap is rewritten), never
/// later: that would leave a hole in the file.
pub(crate) fn resumed_range(
    response: &Response,
    requested: u64,
) -> Result<(u64, ContentRange), DownloadError> {
    let value = response
        .headers()
        .get(CONTENT_RANGE)
        .ok_or_else(|| DownloadError::range_parse("", "header missing from partial response"))?;
    let value = value.to_str().map_err(|_| {
        DownloadError::range_parse(String::from_utf8_lossy(value.as_bytes()), "not ASCII")
    })?;

    let range = ContentRange::parse(value)?;
    let start = range
        .range_start
        .ok_or_else(|| DownloadError::range_parse(value, "partial response has no start offset"))?;
    if start > requested {
        return Err(DownloadError::range_parse(
            value,
            "range starts after the requested offset",
        ));
    }
    Ok((start, range))
}
