//! Top-level request dispatch and the gateway server loop
//!
//! The route table is small and fixed: CORS preflight, the API prefix
//! (forwarded to the session's instance), health checks, a status/debug
//! view, the root descriptor, and a JSON 404. Every branch, error paths
//! included, carries the fixed CORS header set.

use crate::config::{Config, GatewayConfig};
use crate::error::{
    apply_cors_headers, empty_response, error_response, json_response, GatewayBody, GatewayError,
};
use crate::forwarder::Forwarder;
use crate::registry::SessionRegistry;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum accepted session key length
const MAX_SESSION_KEY_LEN: usize = 64;

/// Everything the dispatch function needs, shared across connections
pub struct RouterContext {
    pub registry: Arc<SessionRegistry>,
    pub forwarder: Forwarder,
    pub gateway: GatewayConfig,
}

impl RouterContext {
    pub fn new(config: &Config, registry: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            forwarder: Forwarder::new(&config.gateway, &config.instance),
            gateway: config.gateway.clone(),
            registry,
        })
    }
}

/// The gateway HTTP server
pub struct GatewayServer {
    bind_addr: SocketAddr,
    context: Arc<RouterContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<RouterContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    context: Arc<RouterContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2 (h2c)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// The outermost request boundary.
///
/// Maps every gateway error to its JSON response and stamps the CORS set
/// onto whatever came back, so no branch can produce a response without it.
pub async fn handle_request(
    req: Request<Incoming>,
    context: Arc<RouterContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = match dispatch(req, &context, client_addr).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                GatewayError::RouteNotFound(path) => {
                    debug!(%method, path = %path, "no matching route");
                }
                GatewayError::Internal(detail) => {
                    error!(%method, path = %path, %detail, "request failed with internal fault");
                }
                other => {
                    warn!(%method, path = %path, error = %other, "request failed");
                }
            }
            error_response(&err)
        }
    };

    apply_cors_headers(response.headers_mut());
    Ok(response)
}

/// Pure dispatch over the fixed route table, most specific first
async fn dispatch(
    req: Request<Incoming>,
    context: &RouterContext,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, GatewayError> {
    // CORS preflight is answered immediately; it never resolves an instance
    if req.method() == Method::OPTIONS {
        return Ok(empty_response(StatusCode::NO_CONTENT));
    }

    let path = req.uri().path().to_string();

    if is_api_path(&path, &context.gateway.api_prefix) {
        return forward_api(req, context, client_addr).await;
    }

    match path.as_str() {
        "/health" | "/_health" => Ok(health_response(context)),
        "/_container/status" => container_status(context).await,
        "/" => Ok(root_response(context)),
        _ => Err(GatewayError::RouteNotFound(path)),
    }
}

/// Forward an API-prefixed request to the session's instance
async fn forward_api(
    mut req: Request<Incoming>,
    context: &RouterContext,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, GatewayError> {
    let Some(key) = session_key(req.headers(), &context.gateway) else {
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({
                "error": "Bad Request",
                "message": "invalid session key",
            }),
        ));
    };

    // Generate or propagate the request ID, and overwrite (never append)
    // the forwarding headers: this gateway is the first trusted hop.
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(key = %key, method = %req.method(), uri = %req.uri(), request_id, "forwarding api request");

    let resolved = context.registry.resolve(&key).await?;

    // Counting the request also re-verifies the instance is still routable;
    // it can have been selected for eviction since resolve returned
    if !context.registry.begin_request(&key) {
        return Ok(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "error": "Service Unavailable",
                "message": "instance is shutting down, please retry",
            }),
        ));
    }

    let result = context.forwarder.forward(req, resolved.endpoint).await;
    context.registry.end_request(&key);
    result
}

/// Health payload for the gateway process itself; no instance involved
fn health_response(context: &RouterContext) -> Response<GatewayBody> {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "healthy",
            "service": PKG_NAME,
            "environment": context.gateway.environment,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

/// Instance health plus coarse registry state, for debugging
async fn container_status(context: &RouterContext) -> Result<Response<GatewayBody>, GatewayError> {
    let key = &context.gateway.session_key;

    let endpoint = if context.gateway.status_probe_starts_instance {
        match context.registry.resolve(key).await {
            Ok(resolved) => Some(resolved.endpoint),
            Err(err) => return Ok(status_unavailable(&err.to_string(), context)),
        }
    } else {
        context.registry.routable_endpoint(key)
    };

    let Some(endpoint) = endpoint else {
        return Ok(status_unavailable("no instance running", context));
    };

    match context.forwarder.probe(endpoint).await {
        Ok(backend) => Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({
                "container": "running",
                "backend": backend,
                "instances": context.registry.snapshot(),
            }),
        )),
        Err(err) => Ok(status_unavailable(&err.to_string(), context)),
    }
}

fn status_unavailable(error: &str, context: &RouterContext) -> Response<GatewayBody> {
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &serde_json::json!({
            "container": "starting_or_error",
            "error": error,
            "instances": context.registry.snapshot(),
        }),
    )
}

/// Static descriptor of the route surface
fn root_response(context: &RouterContext) -> Response<GatewayBody> {
    let prefix = &context.gateway.api_prefix;
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "description": PKG_DESCRIPTION,
            "endpoints": {
                "health": "/health",
                "api": format!("{prefix}/*"),
                "containerStatus": "/_container/status",
            },
            "docs": format!("{prefix}/docs"),
        }),
    )
}

/// Whether `path` falls under the API prefix (exact or a subpath)
fn is_api_path(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Pick the session key for a request.
///
/// Without a configured key header every request shares the default key.
/// With one, a well-formed header value selects a per-caller instance; a
/// malformed value is rejected rather than silently mapped to the default.
fn session_key(headers: &HeaderMap, gateway: &GatewayConfig) -> Option<String> {
    let Some(header_name) = &gateway.session_key_header else {
        return Some(gateway.session_key.clone());
    };

    match headers.get(header_name.as_str()) {
        None => Some(gateway.session_key.clone()),
        Some(value) => value
            .to_str()
            .ok()
            .filter(|key| is_valid_session_key(key))
            .map(String::from),
    }
}

/// Keys are opaque but bounded: alphanumeric plus `-`, `_`, `.`, at most
/// 64 bytes. This keeps keys safe to log and to embed in process state.
fn is_valid_session_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_SESSION_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
