//! Error taxonomy, JSON error responses, and the CORS header set

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Response body type used throughout the gateway
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// CORS headers attached to every response the gateway produces.
/// Browsers silently drop cross-origin responses without these.
pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization";

/// Errors surfaced by the gateway at the routing boundary
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Instance failed to boot or exceeded the startup timeout
    #[error("instance startup failed: {reason}")]
    StartupFailure { reason: String },

    /// Instance could not be reached while forwarding
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    /// Forwarded request exceeded the per-request timeout
    #[error("request timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    /// No route matched the request path
    #[error("no route for {0}")]
    RouteNotFound(String),

    /// Anything unanticipated; details are logged, never sent to callers
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code this error maps to at the routing boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::StartupFailure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Merge the fixed CORS header set, overwriting any conflicting values
pub fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static(CORS_ALLOW_ORIGIN),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
}

/// Build a JSON response with the CORS header set attached
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<GatewayBody> {
    let body = body.to_string();
    let mut response = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers");
    apply_cors_headers(response.headers_mut());
    response
}

/// Build an empty response with the CORS header set attached (preflight)
pub fn empty_response(status: StatusCode) -> Response<GatewayBody> {
    let mut response = Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum");
    apply_cors_headers(response.headers_mut());
    response
}

/// Serialize a gateway error to its JSON error response.
///
/// Internal faults get a generic message; the detail stays in the logs.
pub fn error_response(err: &GatewayError) -> Response<GatewayBody> {
    let status = err.status_code();
    let body = match err {
        GatewayError::RouteNotFound(path) => serde_json::json!({
            "error": "Not Found",
            "path": path,
        }),
        GatewayError::Internal(_) => serde_json::json!({
            "error": "Internal Server Error",
            "message": "unexpected gateway error",
        }),
        _ => serde_json::json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": err.to_string(),
        }),
    };
    json_response(status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::StartupFailure { reason: "boot".into() }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Unreachable("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout(Duration::from_secs(30)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::RouteNotFound("/nope".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_not_found_body_names_path() {
        let response = error_response(&GatewayError::RouteNotFound("/missing".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_internal_fault_is_generic() {
        let err = GatewayError::Internal("lock poisoned at registry.rs:42".into());
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The detailed message must never reach the response body; it is
        // only carried by the error itself for logging.
        assert!(err.to_string().contains("lock poisoned"));
    }

    #[test]
    fn test_error_responses_carry_cors() {
        for err in [
            GatewayError::StartupFailure { reason: "t".into() },
            GatewayError::Unreachable("r".into()),
            GatewayError::Timeout(Duration::from_secs(1)),
            GatewayError::RouteNotFound("/x".into()),
            GatewayError::Internal("i".into()),
        ] {
            let response = error_response(&err);
            assert_eq!(
                response.headers().get("access-control-allow-origin").unwrap(),
                CORS_ALLOW_ORIGIN
            );
            assert_eq!(
                response.headers().get("access-control-allow-methods").unwrap(),
                CORS_ALLOW_METHODS
            );
            assert_eq!(
                response.headers().get("access-control-allow-headers").unwrap(),
                CORS_ALLOW_HEADERS
            );
        }
    }

    #[test]
    fn test_apply_cors_overwrites_existing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "access-control-allow-origin",
            HeaderValue::from_static("https://elsewhere.invalid"),
        );
        apply_cors_headers(&mut headers);
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            CORS_ALLOW_ORIGIN
        );
    }
}
