//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Seconds a client should wait before retrying a preview that is starting
pub const RETRY_AFTER_SECS: u64 = 2;

/// Errors raised while provisioning, supervising or routing to a preview
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// Request failed validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No record and no directory for this id
    #[error("preview '{0}' not found")]
    NotFound(String),

    /// Directory setup or dependency installation failed
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// No free port left in the allocator window
    #[error("no free port in window {base}..{end}")]
    PortExhaustion { base: u16, end: u32 },

    /// Backend never answered the readiness probe
    #[error("backend did not become ready within {timeout_secs}s")]
    ReadinessTimeout { timeout_secs: u64, logs: String },

    /// Backend exited after being started
    #[error("backend exited: {0}")]
    ProcessCrash(String),

    /// Backend unreachable while proxying
    #[error("upstream unavailable: {0}")]
    ProxyUnavailable(String),

    /// Missing or wrong management credential
    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// External deployment failed
    #[error("deployment failed: {0}")]
    DeployFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PreviewError {
    pub fn code(&self) -> PreviewErrorCode {
        match self {
            PreviewError::InvalidRequest(_) => PreviewErrorCode::InvalidRequest,
            PreviewError::NotFound(_) => PreviewErrorCode::PreviewNotFound,
            PreviewError::Provisioning(_) => PreviewErrorCode::ProvisioningFailed,
            PreviewError::PortExhaustion { .. } => PreviewErrorCode::PortExhausted,
            PreviewError::ReadinessTimeout { .. } => PreviewErrorCode::ReadinessTimeout,
            PreviewError::ProcessCrash(_) => PreviewErrorCode::ProvisioningFailed,
            PreviewError::ProxyUnavailable(_) => PreviewErrorCode::UpstreamUnavailable,
            PreviewError::Unauthorized => PreviewErrorCode::Unauthorized,
            PreviewError::DeployFailed(_) => PreviewErrorCode::DeployFailed,
            PreviewError::Io(_) => PreviewErrorCode::InternalError,
        }
    }

    /// Message shown to API clients, including the log tail for readiness timeouts
    pub fn client_message(&self) -> String {
        match self {
            PreviewError::ReadinessTimeout { logs, .. } if !logs.is_empty() => {
                format!("{}\n--- recent output ---\n{}", self, logs)
            }
            PreviewError::Io(_) => "internal I/O error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Convert into a JSON error response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.client_message())
    }
}

pub type PreviewResult<T> = Result<T, PreviewError>;

/// Error codes for gateway and management API errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreviewErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Malformed body, id or file path
    InvalidRequest,
    /// Unknown preview id
    PreviewNotFound,
    /// Template copy, install or spawn failed
    ProvisioningFailed,
    /// Port window exhausted
    PortExhausted,
    /// Backend never became ready
    ReadinessTimeout,
    /// Backend is (re)starting, retry shortly
    PreviewStarting,
    /// Failed to connect to backend
    UpstreamUnavailable,
    /// Backend did not respond in time
    RequestTimeout,
    /// External deployment failed
    DeployFailed,
    /// Route does not exist
    RouteNotFound,
    /// Internal gateway error
    InternalError,
}

impl PreviewErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PreviewErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            PreviewErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            PreviewErrorCode::PreviewNotFound => StatusCode::NOT_FOUND,
            PreviewErrorCode::ProvisioningFailed => StatusCode::INTERNAL_SERVER_ERROR,
            PreviewErrorCode::PortExhausted => StatusCode::SERVICE_UNAVAILABLE,
            PreviewErrorCode::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
            PreviewErrorCode::PreviewStarting => StatusCode::SERVICE_UNAVAILABLE,
            PreviewErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            PreviewErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            PreviewErrorCode::DeployFailed => StatusCode::BAD_GATEWAY,
            PreviewErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            PreviewErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Preview-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            PreviewErrorCode::Unauthorized => "UNAUTHORIZED",
            PreviewErrorCode::InvalidRequest => "INVALID_REQUEST",
            PreviewErrorCode::PreviewNotFound => "PREVIEW_NOT_FOUND",
            PreviewErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            PreviewErrorCode::PortExhausted => "PORT_EXHAUSTED",
            PreviewErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            PreviewErrorCode::PreviewStarting => "PREVIEW_STARTING",
            PreviewErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            PreviewErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            PreviewErrorCode::DeployFailed => "DEPLOY_FAILED",
            PreviewErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            PreviewErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: PreviewErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: PreviewErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Preview-Error header
pub fn json_error_response(
    code: PreviewErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Preview-Error", code.as_header_value());

    if code == PreviewErrorCode::PreviewStarting {
        builder = builder.header("Retry-After", RETRY_AFTER_SECS.to_string());
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
