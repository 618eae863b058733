//! Error taxonomy shared by every searchpipe layer.
//!
//! `ErrorKind` is a closed set. Everything that decides *what to do* about a
//! failure (retry, status mapping, hints in the MCP envelope) matches on it
//! exhaustively instead of inspecting messages.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Header carrying the upstream rate-limit reset time (epoch seconds).
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    ApiKeyInvalid,
    RateLimited {
        /// Epoch seconds at which the upstream quota resets, if advertised.
        reset_at_epoch_s: Option<u64>,
    },
    NetworkFailure {
        cause: String,
    },
    Timeout,
    ServerFault {
        status: u16,
    },
    ValidationFailed {
        messages: Vec<String>,
    },
    ConfigInvalid {
        messages: Vec<String>,
    },
    SecurityRejected {
        messages: Vec<String>,
    },
    NotImplemented,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApiKeyInvalid => "API_KEY_INVALID",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NetworkFailure { .. } => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ServerFault { .. } => "SERVER_ERROR",
            Self::ValidationFailed { .. } => "VALIDATION_ERROR",
            Self::ConfigInvalid { .. } => "CONFIG_ERROR",
            Self::SecurityRejected { .. } => "SECURITY_ERROR",
            Self::NotImplemented => "NOT_IMPLEMENTED",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::ApiKeyInvalid => 401,
            Self::RateLimited { .. } => 429,
            Self::NetworkFailure { .. } => 503,
            Self::Timeout => 408,
            Self::ServerFault { status } => *status,
            Self::ValidationFailed { .. } => 400,
            Self::ConfigInvalid { .. } => 500,
            Self::SecurityRejected { .. } => 403,
            Self::NotImplemented => 501,
        }
    }

    /// Kind-level default. Instances never override this; callers widen it per call
    /// through the allow-list passed to [`should_retry`].
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::NetworkFailure { .. }
            | Self::Timeout
            | Self::ServerFault { .. } => true,
            // Credentials, bad input and local misconfiguration do not heal by waiting.
            Self::ApiKeyInvalid
            | Self::ValidationFailed { .. }
            | Self::ConfigInvalid { .. }
            | Self::SecurityRejected { .. }
            | Self::NotImplemented => false,
        }
    }
}

/// A classified failure: the kind plus a human-readable message and when it was created.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message} ({})", .kind.code())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub created_at_epoch_ms: u64,
}

pub type Result<T> = std::result::Result<T, ApiError>;

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            created_at_epoch_ms: now_epoch_ms(),
        }
    }

    pub fn api_key_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiKeyInvalid, message)
    }

    pub fn rate_limited(message: impl Into<String>, reset_at_epoch_s: Option<u64>) -> Self {
        Self::new(ErrorKind::RateLimited { reset_at_epoch_s }, message)
    }

    pub fn network(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self::new(
            ErrorKind::NetworkFailure {
                cause: cause.clone(),
            },
            format!("network request failed: {cause}"),
        )
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("request timed out after {}ms", after.as_millis()),
        )
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerFault { status }, message)
    }

    pub fn validation(messages: Vec<String>) -> Self {
        let message = format!("invalid arguments: {}", messages.join("; "));
        Self::new(ErrorKind::ValidationFailed { messages }, message)
    }

    pub fn config(messages: Vec<String>) -> Self {
        let message = format!("invalid configuration: {}", messages.join("; "));
        Self::new(ErrorKind::ConfigInvalid { messages }, message)
    }

    pub fn security(messages: Vec<String>) -> Self {
        let message = format!("request rejected: {}", messages.join("; "));
        Self::new(ErrorKind::SecurityRejected { messages }, message)
    }

    pub fn not_implemented(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotImplemented, format!("not implemented: {what}"))
    }

    /// Coerce an arbitrary error that has no HTTP shape into `NetworkFailure`,
    /// keeping the original message.
    pub fn coerce(err: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(e) = err.downcast_ref::<ApiError>() {
            return e.clone();
        }
        Self::network(err.to_string())
    }

    /// Map an upstream HTTP status (+ optional body and rate-limit reset header)
    /// onto exactly one kind.
    pub fn from_http_status(status: u16, body: Option<&str>, reset_header: Option<&str>) -> Self {
        let message =
            body.and_then(message_from_body)
                .unwrap_or_else(|| match canonical_reason(status) {
                    Some(reason) => format!("upstream returned HTTP {status} {reason}"),
                    None => format!("upstream returned HTTP {status}"),
                });
        match status {
            401 | 403 => Self::api_key_invalid(message),
            429 => Self::rate_limited(message, reset_header.and_then(parse_reset_epoch_s)),
            408 => Self::new(ErrorKind::Timeout, message),
            _ => Self::server(status, message),
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn status(&self) -> u16 {
        self.kind.status()
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// Messages attached to the list-carrying kinds (empty for the rest).
    pub fn details(&self) -> &[String] {
        match &self.kind {
            ErrorKind::ValidationFailed { messages }
            | ErrorKind::ConfigInvalid { messages }
            | ErrorKind::SecurityRejected { messages } => messages,
            ErrorKind::ApiKeyInvalid
            | ErrorKind::RateLimited { .. }
            | ErrorKind::NetworkFailure { .. }
            | ErrorKind::Timeout
            | ErrorKind::ServerFault { .. }
            | ErrorKind::NotImplemented => &[],
        }
    }
}

/// The only retry/no-retry decision point.
pub fn should_retry(err: &ApiError, allow_list: &[String]) -> bool {
    err.retryable() || allow_list.iter().any(|c| c == err.code())
}

fn message_from_body(body: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    ["message", "error", "detail"]
        .iter()
        .find_map(|k| v.get(*k).and_then(|m| m.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_reset_epoch_s(raw: &str) -> Option<u64> {
    let s = raw.trim();
    s.parse::<u64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn canonical_reason(status: u16) -> Option<&'static str> {
    Some(match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => return None,
    })
}
