//! Authenticated request executor.
//!
//! Every API call goes through `ApiClient::execute`, which attaches the
//! credential, enforces the per-call timeout, retries transient failures,
//! and routes 401s through the single-flight refresh coordinator.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::request::{
    ApiRequest, ApiResponse, FileUpload, MultipartBody, RequestBody, RequestOptions, RequestPolicy,
};
use super::ApiError;
use crate::auth::{
    Credential, CredentialStore, PendingTicket, RefreshCoordinator, RefreshOutcome, Replay,
    SignInReason,
};

type CallResult = Result<ApiResponse, ApiError>;
type Call = BoxFuture<'static, CallResult>;

/// Whether an attempt is the caller's original request or the single replay
/// that follows a refresh. A 401 during a replay is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    AfterRefresh,
}

struct Inner {
    http: Client,
    base_url: String,
    origin: String,
    policy: RequestPolicy,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
}

/// API client for the task service.
/// Clone is cheap - all state lives behind one Arc.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

/// A call running in the background that can be aborted from outside.
pub struct CancellableRequest {
    handle: JoinHandle<CallResult>,
    token: CancellationToken,
}

impl CancellableRequest {
    /// Abort the call. It resolves with `ApiError::Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn response(self) -> CallResult {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ApiError::Cancelled),
            Err(e) => Err(ApiError::InvalidResponse(format!("request task failed: {}", e))),
        }
    }
}

impl ApiClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        origin: impl Into<String>,
        policy: RequestPolicy,
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                origin: origin.into(),
                policy,
                store,
                coordinator,
            }),
        }
    }

    pub fn policy(&self) -> RequestPolicy {
        self.inner.policy
    }

    // ========================================================================
    // Caller-facing methods
    // ========================================================================

    pub async fn get(&self, path: &str, options: RequestOptions) -> CallResult {
        self.execute(ApiRequest::get(path), options).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> CallResult {
        self.send_json(Method::POST, path, body, options).await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> CallResult {
        self.send_json(Method::PUT, path, body, options).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> CallResult {
        self.send_json(Method::PATCH, path, body, options).await
    }

    pub async fn del(&self, path: &str, options: RequestOptions) -> CallResult {
        self.execute(ApiRequest::delete(path), options).await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> CallResult {
        let request = ApiRequest::new(method, path).with_body(RequestBody::json(body)?);
        self.execute(request, options).await
    }

    /// POST a file as multipart form data, alongside plain text fields.
    pub async fn upload_file(
        &self,
        path: &str,
        file: FileUpload,
        fields: Vec<(String, String)>,
        options: RequestOptions,
    ) -> CallResult {
        let body = RequestBody::Multipart(MultipartBody {
            file: Some(file),
            fields,
        });
        let request = ApiRequest::new(Method::POST, path).with_body(body);
        self.execute(request, options).await
    }

    /// Run calls concurrently. Every result is returned, in input order,
    /// whether or not its neighbours failed.
    pub async fn batch(&self, requests: Vec<(ApiRequest, RequestOptions)>) -> Vec<CallResult> {
        let calls = requests
            .into_iter()
            .map(|(request, options)| self.execute(request, options));
        join_all(calls).await
    }

    /// Start a call in the background and hand back a handle that can cancel it.
    pub fn cancellable(&self, request: ApiRequest, options: RequestOptions) -> CancellableRequest {
        let token = options.cancel.clone().unwrap_or_default();
        let options = options.cancel_with(token.clone());
        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute(request, options).await });
        CancellableRequest { handle, token }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one call to completion under its timeout and cancellation token.
    pub async fn execute(&self, request: ApiRequest, options: RequestOptions) -> CallResult {
        let timeout = options.timeout.unwrap_or(self.inner.policy.timeout);
        let cancel = options.cancel.clone();
        let method = request.method.clone();
        let path = request.path.clone();

        let cancelled = async move {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = self.run(request, options) => result,
            _ = tokio::time::sleep(timeout) => {
                warn!(method = %method, path = %path, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(ApiError::Timeout)
            }
            _ = cancelled => {
                debug!(method = %method, path = %path, "Request cancelled");
                Err(ApiError::Cancelled)
            }
        }
    }

    fn run(&self, request: ApiRequest, options: RequestOptions) -> Call {
        let this = self.clone();
        async move {
            if !options.skip_auth {
                let (tx, rx) = oneshot::channel();
                let replay = this.replay(request.clone(), options.clone(), tx);
                if let Some(ticket) = this.inner.coordinator.park_if_refreshing(replay) {
                    return Self::await_replay(rx, ticket).await;
                }
            }
            this.attempt_loop(request, options, Phase::Initial).await
        }
        .boxed()
    }

    /// Send, retrying transient failures with linear backoff.
    fn attempt_loop(&self, request: ApiRequest, options: RequestOptions, phase: Phase) -> Call {
        let this = self.clone();
        async move {
            let max_retries = if request.method == Method::DELETE {
                0
            } else {
                options.retries.unwrap_or(this.inner.policy.retries)
            };

            let mut retry = 0;
            loop {
                let credential = if options.skip_auth {
                    None
                } else {
                    this.inner.store.credential()
                };

                match this.send_once(&request, &options, credential.as_ref()).await {
                    Ok(response) => return Ok(response),
                    Err(ApiError::Unauthorized) if !options.skip_auth => {
                        return this
                            .handle_unauthorized(request, options, phase, credential)
                            .await;
                    }
                    Err(e) if e.is_retryable() && retry < max_retries => {
                        retry += 1;
                        let delay = this.inner.policy.backoff(retry);
                        warn!(
                            method = %request.method,
                            path = %request.path,
                            retry,
                            max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        debug!(method = %request.method, path = %request.path, error = %e, "Request failed");
                        return Err(e);
                    }
                }
            }
        }
        .boxed()
    }

    async fn handle_unauthorized(
        &self,
        request: ApiRequest,
        options: RequestOptions,
        phase: Phase,
        used: Option<Credential>,
    ) -> CallResult {
        let stale = match (phase, used) {
            (Phase::Initial, Some(stale)) => stale,
            (Phase::AfterRefresh, _) => {
                warn!(path = %request.path, "Rejected again after refresh");
                self.inner.coordinator.invalidate(SignInReason::Unauthorized);
                return Err(ApiError::Unauthorized);
            }
            (Phase::Initial, None) => return Err(ApiError::Unauthorized),
        };

        let (tx, rx) = oneshot::channel();
        let replay = self.replay(request.clone(), options.clone(), tx);
        match self.inner.coordinator.park_for_refresh(&stale, replay) {
            Some(ticket) => Self::await_replay(rx, ticket).await,
            None if self.inner.store.credential().is_some() => {
                self.attempt_loop(request, options, Phase::AfterRefresh).await
            }
            None => Err(ApiError::Unauthorized),
        }
    }

    /// Continuation run by the refresh cycle for a parked call.
    fn replay(
        &self,
        request: ApiRequest,
        options: RequestOptions,
        tx: oneshot::Sender<CallResult>,
    ) -> Replay {
        let this = self.clone();
        Box::new(move |outcome| {
            async move {
                let mut tx = tx;
                if tx.is_closed() {
                    return;
                }
                let result = match outcome {
                    RefreshOutcome::Refreshed => {
                        tokio::select! {
                            result = this.attempt_loop(request, options, Phase::AfterRefresh) => result,
                            _ = tx.closed() => {
                                debug!("Caller gone, abandoning replay");
                                return;
                            }
                        }
                    }
                    RefreshOutcome::Failed(reason) => {
                        debug!(path = %request.path, reason = %reason, "Rejecting parked call");
                        Err(ApiError::Unauthorized)
                    }
                };
                let _ = tx.send(result);
            }
            .boxed()
        })
    }

    async fn await_replay(rx: oneshot::Receiver<CallResult>, ticket: PendingTicket) -> CallResult {
        // Held until the replay answers; dropping it early withdraws the call.
        let _ticket = ticket;
        rx.await.unwrap_or(Err(ApiError::Cancelled))
    }

    async fn send_once(
        &self,
        request: &ApiRequest,
        options: &RequestOptions,
        credential: Option<&Credential>,
    ) -> CallResult {
        let url = format!("{}{}", self.inner.base_url, request.path);
        let headers = self.headers(request, options, credential)?;

        let builder = self
            .inner
            .http
            .request(request.method.clone(), &url)
            .headers(headers);
        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(ref value) => builder.body(serde_json::to_vec(value)?),
            RequestBody::Multipart(ref multipart) => builder.multipart(multipart.to_form()?),
        };

        debug!(method = %request.method, url = %url, authenticated = credential.is_some(), "Sending request");
        let response = builder.send().await?;
        Self::classify(response).await
    }

    fn headers(
        &self,
        request: &ApiRequest,
        options: &RequestOptions,
        credential: Option<&Credential>,
    ) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&self.inner.origin)
                .map_err(|e| ApiError::Config(format!("invalid origin: {}", e)))?,
        );

        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.as_str()))
                .map_err(|_| ApiError::Config("credential is not a valid header value".to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        // Multipart bodies get their boundary-bearing content type from reqwest.
        if request.body.is_json() {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Config(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ApiError::Config(format!("invalid value for header {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn classify(response: reqwest::Response) -> CallResult {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            ApiResponse::from_body(status.as_u16(), &body)
        } else {
            Err(ApiError::from_status(status, &body))
        }
    }
}
