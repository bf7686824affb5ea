//! Downstream error classification.
//!
//! Adapters report failures as [`DownstreamError`]. The reconciler maps each
//! one onto an [`ErrorCategory`], which picks the backoff policy:
//! permanent errors fail the record at once, transient ones retry with
//! backoff, unknown ones retry on a smaller budget.

use std::fmt;

use concord_core::ErrorCategory;

/// What went wrong downstream, as far as the adapter could tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    Validation,
    RateLimited,
    Timeout,
    Network,
    /// Raw HTTP status from an adapter that did not map it.
    Http(u16),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DownstreamError {
    pub kind: DownstreamErrorKind,
    pub message: String,
}

impl fmt::Display for DownstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownstreamErrorKind::NotFound => f.write_str("not found"),
            DownstreamErrorKind::Unauthorized => f.write_str("unauthorized"),
            DownstreamErrorKind::Forbidden => f.write_str("forbidden"),
            DownstreamErrorKind::Validation => f.write_str("validation failed"),
            DownstreamErrorKind::RateLimited => f.write_str("rate limited"),
            DownstreamErrorKind::Timeout => f.write_str("timeout"),
            DownstreamErrorKind::Network => f.write_str("network error"),
            DownstreamErrorKind::Http(code) => write!(f, "HTTP {code}"),
            DownstreamErrorKind::Other => f.write_str("error"),
        }
    }
}

impl DownstreamError {
    pub fn new(kind: DownstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(DownstreamErrorKind::NotFound, message)
    }

    /// Classify a free-text adapter error by what it mentions.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = kind_from_message(&message);
        Self { kind, message }
    }

    pub fn category(&self) -> ErrorCategory {
        classify(self.kind)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DownstreamErrorKind::NotFound | DownstreamErrorKind::Http(404))
    }
}

/// Bucket a downstream error kind.
pub fn classify(kind: DownstreamErrorKind) -> ErrorCategory {
    use DownstreamErrorKind::*;
    match kind {
        NotFound | Unauthorized | Forbidden | Validation => ErrorCategory::Permanent,
        RateLimited | Timeout | Network => ErrorCategory::Transient,
        Http(code) => match code {
            408 | 429 | 500..=599 => ErrorCategory::Transient,
            400 | 401 | 403 | 404 | 409 | 422 => ErrorCategory::Permanent,
            _ => ErrorCategory::Unknown,
        },
        Other => ErrorCategory::Unknown,
    }
}

fn kind_from_message(message: &str) -> DownstreamErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit")
    {
        return DownstreamErrorKind::RateLimited;
    }

    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline exceeded")
    {
        return DownstreamErrorKind::Timeout;
    }

    if let Some(code) = server_status(&lower) {
        return DownstreamErrorKind::Http(code);
    }
    if lower.contains("server error") || lower.contains("service unavailable") {
        return DownstreamErrorKind::Http(503);
    }

    if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("dns")
        || lower.contains("reset by peer")
        || lower.contains("broken pipe")
    {
        return DownstreamErrorKind::Network;
    }

    if lower.contains("not found") || lower.contains("404") {
        return DownstreamErrorKind::NotFound;
    }

    if lower.contains("unauthorized")
        || lower.contains("401")
        || lower.contains("authentication")
        || lower.contains("invalid credentials")
    {
        return DownstreamErrorKind::Unauthorized;
    }

    if lower.contains("forbidden") || lower.contains("403") || lower.contains("permission denied") {
        return DownstreamErrorKind::Forbidden;
    }

    if lower.contains("invalid") || lower.contains("validation") || lower.contains("400") {
        return DownstreamErrorKind::Validation;
    }

    DownstreamErrorKind::Other
}

/// First standalone 5xx code in the message.
fn server_status(lower: &str) -> Option<u16> {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (500..600).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DownstreamErrorKind::NotFound, ErrorCategory::Permanent)]
    #[case(DownstreamErrorKind::Unauthorized, ErrorCategory::Permanent)]
    #[case(DownstreamErrorKind::Forbidden, ErrorCategory::Permanent)]
    #[case(DownstreamErrorKind::Validation, ErrorCategory::Permanent)]
    #[case(DownstreamErrorKind::RateLimited, ErrorCategory::Transient)]
    #[case(DownstreamErrorKind::Timeout, ErrorCategory::Transient)]
    #[case(DownstreamErrorKind::Network, ErrorCategory::Transient)]
    #[case(DownstreamErrorKind::Http(502), ErrorCategory::Transient)]
    #[case(DownstreamErrorKind::Http(429), ErrorCategory::Transient)]
    #[case(DownstreamErrorKind::Http(422), ErrorCategory::Permanent)]
    #[case(DownstreamErrorKind::Http(418), ErrorCategory::Unknown)]
    #[case(DownstreamErrorKind::Other, ErrorCategory::Unknown)]
    fn kinds_map_to_buckets(#[case] kind: DownstreamErrorKind, #[case] expected: ErrorCategory) {
        assert_eq!(classify(kind), expected);
    }

    #[rstest]
    #[case("HTTP 429 Too Many Requests", ErrorCategory::Transient)]
    #[case("request timed out after 30s", ErrorCategory::Transient)]
    #[case("upstream returned 503", ErrorCategory::Transient)]
    #[case("connection refused", ErrorCategory::Transient)]
    #[case("zone not found", ErrorCategory::Permanent)]
    #[case("Unauthorized: bad token", ErrorCategory::Permanent)]
    #[case("forbidden for this account", ErrorCategory::Permanent)]
    #[case("invalid hostname", ErrorCategory::Permanent)]
    #[case("something odd happened", ErrorCategory::Unknown)]
    fn messages_map_to_buckets(#[case] message: &str, #[case] expected: ErrorCategory) {
        assert_eq!(DownstreamError::from_message(message).category(), expected);
    }

    #[test]
    fn account_numbers_are_not_status_codes() {
        let err = DownstreamError::from_message("record 15003 is odd");
        assert_eq!(err.kind, DownstreamErrorKind::Other);
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = DownstreamError::new(DownstreamErrorKind::RateLimited, "slow down");
        assert_eq!(err.to_string(), "rate limited: slow down");
        assert!(DownstreamError::new(DownstreamErrorKind::Http(404), "").is_not_found());
    }
}
