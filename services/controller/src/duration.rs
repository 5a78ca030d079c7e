//! Duration literals as written in config objects (`24h`, `1h30m`, `1.5s`).
//!
//! Parsing is delegated to [`kube::core::Duration`], which follows the
//! apimachinery duration format. On top of it, empty input and negative
//! values are rejected since every duration the controller reads is a
//! threshold or an interval.

use std::time::Duration;

use kube::core::duration::ParseError;
use thiserror::Error;

/// Longest accepted duration, matching a signed 64-bit nanosecond count.
const MAX_DURATION: Duration = Duration::from_nanos(i64::MAX as u64);

/// Largest sum of the numbers in one literal. Keeps unit scaling in range
/// before the value reaches `kube`'s parser.
const MAX_MAGNITUDE: f64 = 1e15;

/// Errors from parsing a duration literal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration {0:?}")]
    Invalid(String),

    #[error("missing unit in duration {0:?}")]
    MissingUnit(String),

    #[error("unknown unit in duration {0:?}")]
    UnknownUnit(String),

    #[error("negative duration {0:?}")]
    Negative(String),

    #[error("duration {0:?} overflows")]
    Overflow(String),
}

/// Parse a duration literal.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let unsigned = input.strip_prefix(['+', '-']).unwrap_or(input);
    if input.is_empty() {
        return Err(DurationError::Empty);
    }
    if unsigned.is_empty() || unsigned.contains(['+', '-']) {
        return Err(DurationError::Invalid(input.to_string()));
    }

    let magnitude: f64 = unsigned
        .split(char::is_alphabetic)
        .filter_map(|number| number.parse::<f64>().ok())
        .sum();
    if magnitude > MAX_MAGNITUDE {
        return Err(DurationError::Overflow(input.to_string()));
    }

    let parsed: kube::core::Duration = input.parse().map_err(|e| match e {
        ParseError::NoUnit => DurationError::MissingUnit(input.to_string()),
        ParseError::InvalidUnit => DurationError::UnknownUnit(input.to_string()),
        _ => DurationError::Invalid(input.to_string()),
    })?;

    let value = Duration::from(parsed);
    if parsed.is_negative() && !value.is_zero() {
        return Err(DurationError::Negative(input.to_string()));
    }
    if value > MAX_DURATION {
        return Err(DurationError::Overflow(input.to_string()));
    }
    Ok(value)
}
