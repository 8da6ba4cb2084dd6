use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Debug, Error)]
#[error("failed to parse duration: {reason}")]
pub struct ParseDurationError {
    reason: String,
}

/// Parse human-friendly durations like `500ms`, `5s` or `1m`. Used as the
/// clap value parser for every timing option.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    humantime::parse_duration(s).map_err(|err| ParseDurationError {
        reason: err.to_string(),
    })
}
