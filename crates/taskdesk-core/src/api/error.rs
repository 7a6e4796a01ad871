use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Field name to messages, as returned by the server's validation layer.
pub type ValidationErrors = HashMap<String, Vec<String>>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request timeout")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("{message}")]
    ClientError {
        status: u16,
        message: String,
        errors: Option<ValidationErrors>,
    },

    #[error("{message}")]
    ServerError {
        status: u16,
        message: String,
        errors: Option<ValidationErrors>,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    errors: Option<ValidationErrors>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Classify a non-2xx response.
    ///
    /// The body is expected to be `{ message?, errors? }`; anything else falls
    /// back to an `HTTP <status>: <reason>` message.
    pub fn from_status(status: reqwest::StatusCode, body: &[u8]) -> Self {
        let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
        let message = parsed.message.unwrap_or_else(|| {
            let reason = status.canonical_reason().unwrap_or("Unknown");
            let text = String::from_utf8_lossy(body);
            if text.trim().is_empty() || text.trim_start().starts_with('{') {
                format!("HTTP {}: {}", status.as_u16(), reason)
            } else {
                format!("HTTP {}: {}", status.as_u16(), Self::truncate_body(text.trim()))
            }
        });

        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::Forbidden(message),
            429 => ApiError::RateLimited,
            400..=499 => ApiError::ClientError {
                status: status.as_u16(),
                message,
                errors: parsed.errors,
            },
            _ => ApiError::ServerError {
                status: status.as_u16(),
                message,
                errors: parsed.errors,
            },
        }
    }

    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized => Some(401),
            ApiError::Forbidden(_) => Some(403),
            ApiError::RateLimited => Some(429),
            ApiError::ClientError { status, .. } | ApiError::ServerError { status, .. } => {
                Some(*status)
            }
            ApiError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Server-side validation messages, keyed by field.
    pub fn errors(&self) -> Option<&ValidationErrors> {
        match self {
            ApiError::ClientError { errors, .. } | ApiError::ServerError { errors, .. } => {
                errors.as_ref()
            }
            _ => None,
        }
    }

    /// Whether the generic backoff loop may try this call again.
    ///
    /// Only transient failures qualify. Authentication failures go through the
    /// refresh path instead, and every other 4xx is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::NetworkError(_) | ApiError::ServerError { .. } | ApiError::RateLimited
        )
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized | ApiError::Forbidden(_))
    }
}
