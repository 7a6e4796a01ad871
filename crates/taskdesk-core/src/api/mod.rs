//! REST API access for the task service.
//!
//! `ApiClient` is the single entry point for authenticated calls. It speaks
//! JSON, unwraps the server's `{ data, message }` envelope, and cooperates
//! with the auth module to refresh expired credentials transparently.

pub mod client;
pub mod error;
pub mod request;

pub use client::{ApiClient, CancellableRequest};
pub use error::{ApiError, ValidationErrors};
pub use request::{
    ApiRequest, ApiResponse, FileUpload, MultipartBody, RequestBody, RequestOptions,
    RequestPolicy,
};
