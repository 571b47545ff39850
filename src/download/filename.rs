//! Display-name resolution for downloads.
//!
//! A name comes from the `Content-Disposition` header when the server sends
//! one, otherwise from the last URL path segment. Whatever the source, the
//! result is sanitized so it stays inside the destination directory.

use std::path::{Component, Path};

use tracing::debug;
use url::Url;

/// Name used when neither the header nor the URL yields anything usable.
pub(crate) const FALLBACK_FILENAME: &str = "download";

/// Resolves the display name for a resource.
pub(crate) fn resolve_filename(content_disposition: Option<&str>, url: &Url) -> String {
    content_disposition
        .and_then(parse_content_disposition)
        .map(|name| sanitize_filename(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| filename_from_url(url))
}

/// Parses the filename out of a `Content-Disposition` header value.
///
/// Parameters follow RFC 6266: names are case-insensitive, values are tokens
/// or quoted strings (with `\` escapes, and `;` allowed inside quotes), and an
/// RFC 5987 `filename*` wins over a plain `filename`.
///
/// Handles:
/// - `attachment; filename="example.iso"`
/// - `attachment; filename=example.iso`
/// - `attachment; filename*=UTF-8''example%20name.iso`
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    let params = disposition_params(header);

    let extended = params
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("filename*"))
        .and_then(|(_, value)| decode_ext_value(value));
    if extended.is_some() {
        return extended;
    }

    params
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("filename"))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Splits `disposition-type; name=value; ...` into `(name, value)` pairs,
/// skipping the disposition type itself.
fn disposition_params(header: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = header.chars().peekable();

    // Disposition type.
    for c in chars.by_ref() {
        if c == ';' {
            break;
        }
    }

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ';') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ';' {
                break;
            }
            name.push(c);
            chars.next();
        }
        let name = name.trim().to_string();

        if chars.next_if_eq(&'=').is_none() {
            // Parameter without a value: ignore it.
            continue;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
            // Drop anything between the closing quote and the next separator.
            while chars.next_if(|c| *c != ';').is_some() {}
        } else {
            while let Some(c) = chars.next_if(|c| *c != ';') {
                value.push(c);
            }
            value = value.trim().to_string();
        }

        if !name.is_empty() {
            params.push((name, value));
        }
    }

    params
}

/// Decodes an RFC 5987 `charset'language'percent-encoded` value.
fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?;
    let _language = parts.next()?;
    let encoded = parts.next()?;

    if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("iso-8859-1") {
        debug!(charset, "unsupported filename* charset, ignoring");
        return None;
    }

    match urlencoding::decode(encoded) {
        Ok(decoded) if !decoded.is_empty() => Some(decoded.into_owned()),
        Ok(_) => None,
        Err(error) => {
            debug!(value, %error, "filename* is not valid UTF-8 after decoding");
            None
        }
    }
}

/// Name derived from the last URL path segment (percent-decoded), or
/// [`FALLBACK_FILENAME`].
pub(crate) fn filename_from_url(url: &Url) -> String {
    let Some(last) = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
    else {
        return FALLBACK_FILENAME.to_string();
    };

    let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
        debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
        last.into()
    });
    let sanitized = sanitize_filename(&decoded);
    if sanitized.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) and rewrites `.`/`..` so the
/// name can never address a parent or the directory itself.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() || is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
