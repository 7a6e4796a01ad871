//! Session-establishing endpoints.
//!
//! These calls bypass the request executor: they carry the anti-forgery token
//! instead of (or in addition to) a bearer credential and must never trigger
//! a refresh themselves.

use std::time::Duration;

use reqwest::{header, Client};
use serde::Deserialize;
use tracing::{debug, warn};

use super::session::Credential;
use crate::api::ApiError;
use crate::models::User;

/// Timeout for auth endpoint calls
const AUTH_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Header carrying the anti-forgery token
const CSRF_HEADER: &str = "X-CSRF-TOKEN";

#[derive(Debug, Deserialize)]
struct CsrfResponse {
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    user: User,
}

/// HTTP access to the auth endpoints of the API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthGateway {
    client: Client,
    base_url: String,
    origin: String,
}

impl AuthGateway {
    pub fn new(client: Client, base_url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            origin: origin.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .timeout(Duration::from_secs(AUTH_REQUEST_TIMEOUT_SECS))
            .header(header::ACCEPT, "application/json")
            .header(header::ORIGIN, &self.origin)
    }

    /// Check if response is successful, returning a classified error if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.bytes().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Fetch the anti-forgery token. Failures are logged and yield `None`;
    /// the server decides whether a call without one is acceptable.
    pub async fn csrf_token(&self) -> Option<String> {
        let result = async {
            let response = self.request(reqwest::Method::GET, "/csrf-cookie").send().await?;
            let response = Self::check_response(response).await?;
            let body: CsrfResponse = response.json().await?;
            Ok::<_, ApiError>(body.csrf_token)
        }
        .await;

        match result {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Failed to get CSRF token");
                None
            }
        }
    }

    /// Exchange the current session cookie for a new bearer credential.
    pub async fn refresh(&self) -> Result<Credential, ApiError> {
        let csrf = self.csrf_token().await;

        let mut request = self
            .request(reqwest::Method::POST, "/refresh-token")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(ref token) = csrf {
            request = request.header(CSRF_HEADER, token);
        }

        let response = Self::check_response(request.send().await?).await?;
        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("refresh response: {}", e)))?;

        if body.token.is_empty() {
            return Err(ApiError::InvalidResponse("refresh returned an empty token".to_string()));
        }
        debug!("Credential refreshed");
        Ok(Credential::new(body.token))
    }

    /// POST a JSON body to an auth endpoint with the anti-forgery token attached.
    async fn post_with_csrf(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ApiError> {
        let csrf = self.csrf_token().await;

        let mut request = self.request(reqwest::Method::POST, path).json(body);
        if let Some(ref token) = csrf {
            request = request.header(CSRF_HEADER, token);
        }
        Self::check_response(request.send().await?).await
    }

    /// Sign in with email and password.
    pub async fn login(&self, email: &str, password: &str) -> Result<(Credential, User), ApiError> {
        let response = self
            .post_with_csrf("/login", &serde_json::json!({ "email": email, "password": password }))
            .await?;
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)))?;

        Ok((Credential::new(body.token), body.user))
    }

    /// Create an account. The caller signs in afterwards.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> Result<(), ApiError> {
        self.post_with_csrf(
            "/register",
            &serde_json::json!({
                "name": name,
                "email": email,
                "password": password,
                "password_confirmation": password_confirmation,
            }),
        )
        .await?;
        debug!("Account registered");
        Ok(())
    }

    /// Ask the server to email a password reset link. Returns the server's message, if any.
    pub async fn forgot_password(&self, email: &str) -> Result<Option<String>, ApiError> {
        let response = self
            .post_with_csrf("/forgot-password", &serde_json::json!({ "email": email }))
            .await?;
        Ok(Self::message(response).await)
    }

    /// Set a new password using the token from a reset email.
    pub async fn reset_password(
        &self,
        token: &str,
        email: &str,
        password: &str,
        password_confirmation: &str,
    ) -> Result<(), ApiError> {
        self.post_with_csrf(
            "/reset-password",
            &serde_json::json!({
                "token": token,
                "email": email,
                "password": password,
                "password_confirmation": password_confirmation,
            }),
        )
        .await?;
        debug!("Password reset accepted");
        Ok(())
    }

    async fn message(response: reqwest::Response) -> Option<String> {
        let body: serde_json::Value = response.json().await.ok()?;
        body.get("message")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    }

    /// Tell the server the session is over.
    pub async fn logout(&self, credential: &Credential) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::POST, "/logout")
            .bearer_auth(credential.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, "0")
            .body("")
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    /// Fetch the user the credential belongs to. Used to verify a restored session.
    pub async fn user(&self, credential: &Credential) -> Result<User, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/user")
            .bearer_auth(credential.as_str())
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("user response: {}", e)))?;

        // Some deployments wrap the user in the standard envelope.
        let user = match body.get("data") {
            Some(inner) if inner.is_object() => inner.clone(),
            _ => body,
        };
        Ok(serde_json::from_value(user)?)
    }
}
