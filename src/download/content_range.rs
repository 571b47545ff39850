//! `Content-Range` response header parsing.
//!
//! Grammar: `bytes (<start>-<end>|*)/(<size>|*)`. Any component may also be
//! missing. Missing and `*` components both come back as `None`; anything that
//! does not fit the grammar is a [`DownloadError::RangeParse`].

use std::sync::LazyLock;

use regex::Regex;

use super::error::DownloadError;

static CONTENT_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^bytes (?:(?P<start>\d+)?-(?P<end>\d+)?|\*)(?:/(?P<size>\d+)|/\*)?$")
        .expect("static Content-Range pattern compiles")
});

/// Byte range described by a partial response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentRange {
    /// First byte of the body within the resource.
    pub range_start: Option<u64>,
    /// Last byte of the body within the resource (inclusive).
    pub range_end: Option<u64>,
    /// Full size of the resource.
    pub size: Option<u64>,
}

impl ContentRange {
    /// Parses a `Content-Range` header value.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::RangeParse`] when the value does not match the
    /// grammar, a number does not fit in `u64`, or the range is inverted.
    ///
    /// # Examples
    ///
    /// ```
    /// use rangeload::download::ContentRange;
    ///
    /// let range = ContentRange::parse("bytes 0-499/1234").unwrap();
    /// assert_eq!(range.range_start, Some(0));
    /// assert_eq!(range.range_end, Some(499));
    /// assert_eq!(range.size, Some(1234));
    ///
    /// let wildcard = ContentRange::parse("bytes */1234").unwrap();
    /// assert_eq!(wildcard.range_end, None);
    /// assert_eq!(wildcard.size, Some(1234));
    ///
    /// assert!(ContentRange::parse("not-a-range").is_err());
    /// ```
    pub fn parse(value: &str) -> Result<Self, DownloadError> {
        let trimmed = value.trim();
        let captures = CONTENT_RANGE_RE
            .captures(trimmed)
            .ok_or_else(|| DownloadError::range_parse(value, "does not match `bytes <range>/<size>`"))?;

        let number = |name: &str| -> Result<Option<u64>, DownloadError> {
            captures
                .name(name)
                .map(|m| {
                    m.as_str()
                        .parse::<u64>()
                        .map_err(|_| DownloadError::range_parse(value, "number out of range"))
                })
                .transpose()
        };

        let range = Self {
            range_start: number("start")?,
            range_end: number("end")?,
            size: number("size")?,
        };

        if let (Some(start), Some(end)) = (range.range_start, range.range_end)
            && start > end
        {
            return Err(DownloadError::range_parse(value, "range start is after range end"));
        }
        if range.range_start.is_some() && range.range_end.is_some() && range.len().is_none() {
            return Err(DownloadError::range_parse(value, "range length does not fit in u64"));
        }

        Ok(range)
    }

    /// Number of body bytes the range announces, when both ends are known and
    /// the count fits in `u64`.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        let (start, end) = (self.range_start?, self.range_end?);
        end.checked_sub(start)?.checked_add(1)
    }

    /// Returns true when the range does not pin down a byte span, as in
    /// `bytes */1234` or `bytes 500-`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len().is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_range() {
        let range = ContentRange::parse("bytes 0-499/1234").unwrap();
        assert_eq!(
            range,
            ContentRange {
                range_start: Some(0),
                range_end: Some(499),
                size: Some(1234),
            }
        );
        assert_eq!(range.len(), Some(500));
    }

    #[test]
    fn test_parse_wildcard_range_keeps_size() {
        let range = ContentRange::parse("bytes */1234").unwrap();
        assert_eq!(range.range_start, None);
        assert_eq!(range.range_end, None);
        assert_eq!(range.size, Some(1234));
        assert!(range.is_empty());
    }

    #[test]
    fn test_parse_wildcard_size() {
        let range = ContentRange::parse("bytes 100-199/*").unwrap();
        assert_eq!(range.range_start, Some(100));
        assert_eq!(range.range_end, Some(199));
        assert_eq!(range.size, None);
    }

    #[test]
    fn test_parse_missing_size_and_open_end() {
        let range = ContentRange::parse("bytes 500-").unwrap();
        assert_eq!(range.range_start, Some(500));
        assert_eq!(range.range_end, None);
        assert_eq!(range.size, None);
        assert_eq!(range.len(), None);
        assert!(range.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_value() {
        let err = ContentRange::parse("not-a-range").unwrap_err();
        assert!(matches!(err, DownloadError::RangeParse { .. }));
    }

    #[test]
    fn test_parse_rejects_other_units() {
        assert!(ContentRange::parse("items 0-1/2").is_err());
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        assert!(ContentRange::parse("bytes 0-1/2 extra").is_err());
    }

    #[test]
    fn test_parse_rejects_inverted_range() {
        let err = ContentRange::parse("bytes 10-5/20").unwrap_err();
        assert!(err.to_string().contains("after range end"), "{err}");
    }

    #[test]
    fn test_parse_rejects_overflowing_number() {
        let err = ContentRange::parse("bytes 0-1/99999999999999999999999").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_parse_rejects_range_covering_all_of_u64() {
        let err = ContentRange::parse("bytes 0-18446744073709551615/*").unwrap_err();
        assert!(matches!(err, DownloadError::RangeParse { .. }));
        assert!(err.to_string().contains("does not fit"), "{err}");

        let widest = ContentRange::parse("bytes 1-18446744073709551615/*").unwrap();
        assert_eq!(widest.len(), Some(u64::MAX));
        assert!(!widest.is_empty());
    }

    #[test]
    fn test_len_of_hand_built_ranges_never_panics() {
        let full = ContentRange {
            range_start: Some(0),
            range_end: Some(u64::MAX),
            size: None,
        };
        assert_eq!(full.len(), None);

        let inverted = ContentRange {
            range_start: Some(9),
            range_end: Some(3),
            size: None,
        };
        assert_eq!(inverted.len(), None);
        assert!(inverted.is_empty());
    }

    #[test]
    fn test_parse_tolerates_surrounding_whitespace() {
        let range = ContentRange::parse("  bytes 1-2/3 ").unwrap();
        assert_eq!(range.size, Some(3));
    }
}
