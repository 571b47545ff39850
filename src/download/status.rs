//! Download status and the status/error consistency rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DownloadError;

/// Status of a download file or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Created, nothing requested yet.
    #[default]
    Queued,
    /// A request succeeded and a read loop is running.
    Started,
    /// Cooperatively paused; connection and file stay open.
    Paused,
    /// Deliberately stopped; progress is kept for a later resume.
    Stopped,
    /// All expected bytes written.
    Completed,
    /// Ended with an error.
    Failed,
}

impl DownloadStatus {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true while a transfer episode may still hold a connection.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Paused)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Status paired with its error.
///
/// The only way to enter `Failed` is [`StatusCell::fail`], and every other
/// transition clears the error, so `Failed` ⇔ `error().is_some()` holds at
/// every observation point.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusCell {
    status: DownloadStatus,
    error: Option<DownloadError>,
}

impl StatusCell {
    pub(crate) fn status(&self) -> DownloadStatus {
        self.status
    }

    pub(crate) fn error(&self) -> Option<&DownloadError> {
        self.error.as_ref()
    }

    /// Moves to a non-failed status and clears any error.
    pub(crate) fn set(&mut self, status: DownloadStatus) {
        if status == DownloadStatus::Failed {
            return;
        }
        self.status = status;
        self.error = None;
    }

    /// Moves to `Failed` with the given error.
    pub(crate) fn fail(&mut self, error: DownloadError) {
        self.status = DownloadStatus::Failed;
        self.error = Some(error);
    }

    /// Like [`fail`](Self::fail), but keeps an error that is already attached.
    pub(crate) fn fail_first(&mut self, error: DownloadError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.status = DownloadStatus::Failed;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [DownloadStatus; 6] = [
        DownloadStatus::Queued,
        DownloadStatus::Started,
        DownloadStatus::Paused,
        DownloadStatus::Stopped,
        DownloadStatus::Completed,
        DownloadStatus::Failed,
    ];

    #[test]
    fn test_status_strings_are_unique_and_parse_back() {
        let mut seen = std::collections::HashSet::new();
        for status in ALL {
            assert!(seen.insert(status.as_str()), "duplicate label {status}");
            assert_eq!(status.as_str().parse::<DownloadStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_status_paused_and_completed_are_distinct() {
        assert_ne!(DownloadStatus::Paused, DownloadStatus::Completed);
        assert_ne!(
            DownloadStatus::Paused.as_str(),
            DownloadStatus::Completed.as_str()
        );
    }

    #[test]
    fn test_status_from_str_rejects_unknown() {
        assert!("waiting".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_status_terminal_and_active() {
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(!DownloadStatus::Stopped.is_terminal());
        assert!(DownloadStatus::Started.is_active());
        assert!(DownloadStatus::Paused.is_active());
        assert!(!DownloadStatus::Queued.is_active());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&DownloadStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn test_status_cell_keeps_failed_iff_error() {
        let mut cell = StatusCell::default();
        assert_eq!(cell.status(), DownloadStatus::Queued);
        assert!(cell.error().is_none());

        cell.fail(DownloadError::timeout("u"));
        assert_eq!(cell.status(), DownloadStatus::Failed);
        assert!(cell.error().is_some());

        cell.set(DownloadStatus::Started);
        assert_eq!(cell.status(), DownloadStatus::Started);
        assert!(cell.error().is_none());
    }

    #[test]
    fn test_status_cell_fail_first_keeps_original_error() {
        let mut cell = StatusCell::default();
        cell.fail_first(DownloadError::timeout("first"));
        cell.fail_first(DownloadError::timeout("second"));
        assert!(cell.error().unwrap().to_string().contains("first"));
    }
}
