//! Management API
//!
//! Served on the same listener as preview traffic. Everything under `/api/`
//! requires `Authorization: Bearer <token>`; `/health` and `/version` do not.

use crate::error::{json_error_response, PreviewError, PreviewErrorCode};
use crate::manager::{PreviewManager, UpsertRequest};
use http_body_util::{combinators::BoxBody, BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body (file sets are sent inline)
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const PREVIEWS_PATH: &str = "/api/previews";

type BoxResponse = Response<BoxBody<Bytes, hyper::Error>>;

#[derive(Debug, Deserialize)]
struct DeployRequest {
    platform: String,
}

/// Whether `path` is served by the management API rather than the gateway
pub fn is_management_path(path: &str) -> bool {
    path == "/health" || path == "/version" || path == "/api" || path.starts_with("/api/")
}

fn full(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Helper to create a plain-text response - infallible with valid StatusCode
fn text_response(status: StatusCode, body: impl Into<Bytes>) -> BoxResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response<T: Serialize>(status: StatusCode, value: &T) -> BoxResponse {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(full(body))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            json_error_response(PreviewErrorCode::InternalError, "failed to serialize response")
        }
    }
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim() == expected_token)
        .unwrap_or(false)
}

/// Split `/api/previews/{id}[/{action}]` into id and action
fn parse_preview_path(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix(PREVIEWS_PATH)?.strip_prefix('/')?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    match rest.split_once('/') {
        Some((id, action)) if !id.is_empty() && !action.contains('/') => Some((id, Some(action))),
        Some(_) => None,
        None if !rest.is_empty() => Some((rest, None)),
        None => None,
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, BoxResponse> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_error_response(
                PreviewErrorCode::InvalidRequest,
                format!("Failed to read request body: {}", e),
            ))
        }
    };

    serde_json::from_slice(&body).map_err(|e| {
        json_error_response(PreviewErrorCode::InvalidRequest, format!("Invalid JSON: {}", e))
    })
}

/// Serve one management request
pub async fn handle_management(
    req: Request<Incoming>,
    manager: Arc<PreviewManager>,
    auth_token: &str,
) -> BoxResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Management API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return json_response(StatusCode::OK, &version_info);
        }
        _ => {}
    }

    if !check_auth(&req, auth_token) {
        warn!(%method, %path, "Unauthorized management API request");
        return PreviewError::Unauthorized.into_response();
    }

    if path == PREVIEWS_PATH {
        return match method {
            Method::GET => match manager.list().await {
                Ok(list) => json_response(StatusCode::OK, &list),
                Err(e) => {
                    error!(error = %e, "Failed to list previews");
                    e.into_response()
                }
            },
            Method::POST => create_or_patch(req, manager).await,
            _ => method_not_allowed(),
        };
    }

    let Some((id, action)) = parse_preview_path(&path) else {
        return json_error_response(PreviewErrorCode::RouteNotFound, "no such endpoint");
    };

    match (method, action) {
        (Method::GET, None) => match manager.status(id) {
            Some(snapshot) => json_response(StatusCode::OK, &snapshot),
            None => json_error_response(
                PreviewErrorCode::PreviewNotFound,
                format!("preview '{}' not found", id),
            ),
        },
        (Method::DELETE, None) => match manager.delete(id).await {
            Ok(existed) => json_response(
                StatusCode::OK,
                &serde_json::json!({ "id": id, "deleted": existed }),
            ),
            Err(e) => {
                warn!(id, error = %e, "Failed to delete preview");
                e.into_response()
            }
        },
        (Method::GET, Some("logs")) => match manager.logs(id) {
            Some(logs) => text_response(StatusCode::OK, logs),
            None => json_error_response(
                PreviewErrorCode::PreviewNotFound,
                format!("no logs for preview '{}'", id),
            ),
        },
        (Method::POST, Some("deploy")) => {
            let request: DeployRequest = match read_json(req).await {
                Ok(request) => request,
                Err(response) => return response,
            };
            match manager.deploy(id, &request.platform).await {
                Ok(outcome) => json_response(StatusCode::OK, &outcome),
                Err(e) => {
                    warn!(id, platform = %request.platform, error = %e, "Deploy failed");
                    e.into_response()
                }
            }
        }
        (_, None) | (_, Some("logs")) | (_, Some("deploy")) => method_not_allowed(),
        _ => json_error_response(PreviewErrorCode::RouteNotFound, "no such endpoint"),
    }
}

async fn create_or_patch(req: Request<Incoming>, manager: Arc<PreviewManager>) -> BoxResponse {
    let request: UpsertRequest = match read_json(req).await {
        Ok(request) => request,
        Err(response) => return response,
    };
    let id = request.id.clone();

    match manager.upsert(request).await {
        Ok(outcome) => {
            let status = if outcome.created { StatusCode::CREATED } else { StatusCode::OK };
            info!(id = %id, status = ?outcome.status, port = ?outcome.port, "Preview upserted");
            json_response(status, &outcome)
        }
        Err(e) => {
            warn!(id = %id, error = %e, "Preview upsert failed");
            e.into_response()
        }
    }
}

fn method_not_allowed() -> BoxResponse {
    let mut response = json_error_response(PreviewErrorCode::InvalidRequest, "method not allowed");
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
}
