//! Request and response shapes for the authenticated executor.

use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::ApiError;

/// Default per-call timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries after the first attempt for transient failures
pub const DEFAULT_RETRIES: u32 = 3;

/// Backoff unit; the wait before retry `n` is `n * DEFAULT_BACKOFF_STEP`.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Client-wide defaults applied when a call doesn't override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_step: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RequestPolicy {
    /// Linear backoff before the given retry (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_step * retry
    }
}

/// A file part for multipart uploads.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

impl FileUpload {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
            mime: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }
}

/// Multipart form contents. Kept as plain data so the form can be rebuilt for
/// every attempt.
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    pub file: Option<FileUpload>,
    pub fields: Vec<(String, String)>,
}

impl MultipartBody {
    pub(crate) fn to_form(&self) -> Result<reqwest::multipart::Form, ApiError> {
        let mut form = reqwest::multipart::Form::new();
        if let Some(ref file) = self.file {
            let mut part = reqwest::multipart::Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone());
            if let Some(ref mime) = file.mime {
                part = part
                    .mime_str(mime)
                    .map_err(|e| ApiError::Config(format!("invalid mime type {}: {}", mime, e)))?;
            }
            form = form.part("file", part);
        }
        for (key, value) in &self.fields {
            form = form.text(key.clone(), value.clone());
        }
        Ok(form)
    }
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartBody),
}

impl RequestBody {
    pub fn json<B: Serialize + ?Sized>(body: &B) -> Result<Self, ApiError> {
        Ok(RequestBody::Json(serde_json::to_value(body)?))
    }

    pub fn is_json(&self) -> bool {
        matches!(self, RequestBody::Json(_))
    }
}

/// Method, path relative to the API base, and body of one call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    /// Send without a bearer credential and never trigger a refresh.
    pub skip_auth: bool,
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Normalized result handed to callers, whether or not the server wrapped
/// its payload in a `{ data, message }` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T = Value> {
    pub data: T,
    pub message: Option<String>,
    pub status: u16,
    pub success: bool,
}

impl ApiResponse<Value> {
    /// Build a response from a 2xx body.
    pub fn from_body(status: u16, body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self {
                data: Value::Null,
                message: None,
                status,
                success: true,
            });
        }

        let raw: Value = serde_json::from_slice(body).map_err(|e| {
            ApiError::InvalidResponse(format!("expected JSON body (status {}): {}", status, e))
        })?;

        let message = raw
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        let data = match raw {
            Value::Object(mut map) => match map.remove("data") {
                Some(inner) if !inner.is_null() => inner,
                Some(_) | None => Value::Object(map),
            },
            other => other,
        };

        Ok(Self {
            data,
            message,
            status,
            success: true,
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<ApiResponse<T>, ApiError> {
        Ok(ApiResponse {
            data: serde_json::from_value(self.data)?,
            message: self.message,
            status: self.status,
            success: self.success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_is_unwrapped() {
        let body = br#"{"data": [{"id": 1}], "message": "Tasks retrieved"}"#;
        let response = ApiResponse::from_body(200, body).unwrap();
        assert_eq!(response.data, json!([{"id": 1}]));
        assert_eq!(response.message.as_deref(), Some("Tasks retrieved"));
        assert!(response.success);
    }

    #[test]
    fn test_bare_payload_passes_through() {
        let response = ApiResponse::from_body(200, br#"[1, 2, 3]"#).unwrap();
        assert_eq!(response.data, json!([1, 2, 3]));
        assert_eq!(response.message, None);

        let response = ApiResponse::from_body(201, br#"{"id": 9, "title": "x"}"#).unwrap();
        assert_eq!(response.data, json!({"id": 9, "title": "x"}));
        assert_eq!(response.status, 201);
    }

    #[test]
    fn test_null_data_falls_back_to_body() {
        let response = ApiResponse::from_body(200, br#"{"data": null, "message": "Logged out"}"#).unwrap();
        assert_eq!(response.data, json!({"message": "Logged out"}));
        assert_eq!(response.message.as_deref(), Some("Logged out"));
    }

    #[test]
    fn test_empty_body_is_null() {
        let response = ApiResponse::from_body(204, b"").unwrap();
        assert_eq!(response.data, Value::Null);
    }

    #[test]
    fn test_non_json_body_is_invalid() {
        let err = ApiResponse::from_body(200, b"<html>").unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_into_typed() {
        let response = ApiResponse::from_body(200, br#"{"data": {"id": 4}}"#).unwrap();
        #[derive(serde::Deserialize)]
        struct Item {
            id: i64,
        }
        let typed: ApiResponse<Item> = response.into_typed().unwrap();
        assert_eq!(typed.data.id, 4);
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RequestPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3000));
    }
}
