//! Classification of failures reported by upstream providers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamErrorCode {
    RateLimit,
    Timeout,
    NetworkError,
    ServerError,
    AuthError,
    ValidationError,
    NotFound,
    UnsupportedProvider,
    MissingApiKey,
    InvalidResponse,
    Unknown,
}

impl UpstreamErrorCode {
    /// Unknown failures are retried; the job's retry budget bounds them.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            UpstreamErrorCode::RateLimit
                | UpstreamErrorCode::Timeout
                | UpstreamErrorCode::NetworkError
                | UpstreamErrorCode::ServerError
                | UpstreamErrorCode::Unknown
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            429 => UpstreamErrorCode::RateLimit,
            401 | 403 => UpstreamErrorCode::AuthError,
            404 => UpstreamErrorCode::NotFound,
            400 => UpstreamErrorCode::ValidationError,
            500..=599 => UpstreamErrorCode::ServerError,
            _ => UpstreamErrorCode::Unknown,
        }
    }
}

impl fmt::Display for UpstreamErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&value)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct UpstreamError {
    pub code: UpstreamErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Explicit override reported by the worker, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl UpstreamError {
    pub fn new(code: UpstreamErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status_code: None,
            retryable: None,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: UpstreamErrorCode::from_status(status),
            message: message.into(),
            status_code: Some(status),
            retryable: None,
        }
    }

    /// Best-effort classification of a free-form failure message.
    pub fn classify_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let code = if lower.contains("timeout") || lower.contains("timed out") {
            UpstreamErrorCode::Timeout
        } else if ["connection", "network", "socket", "econnrefused", "enotfound"]
            .iter()
            .any(|p| lower.contains(p))
        {
            UpstreamErrorCode::NetworkError
        } else if lower.contains("rate limit") || lower.contains("429") {
            UpstreamErrorCode::RateLimit
        } else {
            UpstreamErrorCode::Unknown
        };
        Self::new(code, message)
    }

    pub fn retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.code.retryable())
    }
}
