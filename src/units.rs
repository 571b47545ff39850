//! Human-readable byte counts with SI or IEC prefixes, and the reverse
//! parse for quantities typed by users.
//!
//! ```
//! use rangeload::units::{Base, HumanBytes, Unit, scale};
//!
//! assert_eq!(HumanBytes(1_234_567_890).to_string(), "1.23 GB");
//! let (value, suffix) = scale(1_234_567_890, Base::Binary, Unit::Bits);
//! assert_eq!(format!("{value:.2} {suffix}"), "9.20 Gib");
//!
//! assert_eq!(rangeload::units::parse_bytes("512K"), Ok(512 * 1024));
//! ```

use std::fmt;

/// Prefixes in increasing order of magnitude.
pub const PREFIXES: [&str; 10] = ["K", "M", "G", "T", "P", "E", "Z", "Y", "R", "Q"];

/// Scaling step between prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Base {
    /// Powers of 1000 (`KB`, `MB`, ...).
    #[default]
    Decimal,
    /// Powers of 1024 (`KiB`, `MiB`, ...).
    Binary,
}

impl Base {
    fn factor(self) -> f64 {
        match self {
            Self::Decimal => 1000.0,
            Self::Binary => 1024.0,
        }
    }
}

/// What is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Unit {
    #[default]
    Bytes,
    /// Eight per byte.
    Bits,
}

/// Scales `bytes` to the largest prefix that keeps the value below the base
/// (or to `Q` for anything larger) and returns the value with its suffix.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn scale(bytes: u64, base: Base, unit: Unit) -> (f64, String) {
    let factor = base.factor();
    let (mut value, symbol) = match unit {
        Unit::Bytes => (bytes as f64, "B"),
        Unit::Bits => (bytes as f64 * 8.0, "b"),
    };
    let infix = match base {
        Base::Decimal => "",
        Base::Binary => "i",
    };

    if value < factor {
        return (value, symbol.to_string());
    }

    let mut prefix = PREFIXES[PREFIXES.len() - 1];
    for candidate in PREFIXES {
        value /= factor;
        if value < factor {
            prefix = candidate;
            break;
        }
    }
    (value, format!("{prefix}{infix}{symbol}"))
}

/// Displays a byte count as `{value:.2} {prefix}B` with decimal prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanBytes(pub u64);

impl fmt::Display for HumanBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, suffix) = scale(self.0, Base::Decimal, Unit::Bytes);
        write!(f, "{value:.2} {suffix}")
    }
}

/// Error returned by [`parse_bytes`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid byte quantity '{input}': {reason}")]
pub struct ParseBytesError {
    input: String,
    reason: &'static str,
}

/// Parses a byte quantity such as `65536`, `512K`, `1.5MiB` or `2MB`.
///
/// A bare prefix or an `iB` suffix is binary (`K` = 1024); a `B` suffix after
/// a prefix is decimal (`KB` = 1000). Suffixes are case-insensitive and may be
/// separated from the number by whitespace. Fractions are rounded to the
/// nearest byte.
///
/// # Errors
///
/// [`ParseBytesError`] for a missing or malformed number, an unknown suffix,
/// or a result that does not fit in `u64`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn parse_bytes(input: &str) -> Result<u64, ParseBytesError> {
    let fail = |reason| ParseBytesError {
        input: input.to_string(),
        reason,
    };
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(fail("missing number"));
    }
    let multiplier = suffix_multiplier(suffix.trim_start()).ok_or_else(|| fail("unknown unit"))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(|| fail("too large"));
    }
    let value: f64 = number.parse().map_err(|_| fail("malformed number"))?;
    let scaled = (value * multiplier as f64).round();
    // 2^64 is the first f64 above u64::MAX.
    if scaled >= u64::MAX as f64 {
        return Err(fail("too large"));
    }
    Ok(scaled as u64)
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    if suffix.is_empty() || suffix.eq_ignore_ascii_case("b") {
        return Some(1);
    }
    let (head, rest) = suffix.split_at(suffix.chars().next()?.len_utf8());
    let exponent = PREFIXES
        .iter()
        .position(|prefix| prefix.eq_ignore_ascii_case(head))?;
    let base: u64 = if rest.is_empty() || rest.eq_ignore_ascii_case("ib") {
        1024
    } else if rest.eq_ignore_ascii_case("b") {
        1000
    } else {
        return None;
    };
    base.checked_pow(u32::try_from(exponent + 1).ok()?)
}
