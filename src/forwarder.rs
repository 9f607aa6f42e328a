//! Request forwarding to backend instances
//!
//! Rewrites the routing prefix off the inbound path, proxies the request to
//! the resolved instance endpoint over pooled connections, and merges the
//! fixed CORS header set into every proxied response. Transport failures map
//! to the gateway error taxonomy; retrying is the caller's decision.

use crate::config::{GatewayConfig, InstanceConfig};
use crate::error::{apply_cors_headers, GatewayBody, GatewayError};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

/// Proxies requests to instance endpoints over pooled HTTP connections
pub struct Forwarder {
    /// Main client for proxying requests
    client: Client<HttpConnector, Incoming>,
    /// Dedicated client for health probes (uses Empty body type)
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    api_prefix: String,
    health_path: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl Forwarder {
    pub fn new(gateway: &GatewayConfig, instance: &InstanceConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(gateway.pool_max_idle_per_host)
            .pool_idle_timeout(gateway.pool_idle_timeout())
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(gateway.pool_max_idle_per_host)
            .pool_idle_timeout(gateway.pool_idle_timeout())
            .build(connector);

        debug!(
            max_idle = gateway.pool_max_idle_per_host,
            idle_timeout_secs = gateway.pool_idle_timeout_secs,
            "forwarder connection pool initialized"
        );

        Self {
            client,
            probe_client,
            api_prefix: gateway.api_prefix.clone(),
            health_path: instance.health_path.clone(),
            request_timeout: instance.request_timeout(),
            probe_timeout: instance.probe_timeout(),
        }
    }

    /// Forward `req` to the instance at `endpoint`.
    ///
    /// The routing prefix is stripped from the path; method, body, query,
    /// and headers pass through unchanged. The response keeps the instance's
    /// status and body verbatim with the CORS set merged over its headers.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        endpoint: SocketAddr,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let target = rewrite_path(req.uri().path(), req.uri().query(), &self.api_prefix);
        let uri = format!("http://{}{}", endpoint, target);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        let outbound = builder
            .body(body)
            .map_err(|e| GatewayError::Internal(format!("failed to build forwarded request: {e}")))?;

        let result = tokio::time::timeout(self.request_timeout, self.client.request(outbound)).await;

        match result {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                apply_cors_headers(&mut parts.headers);
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => Err(GatewayError::Unreachable(e.to_string())),
            Err(_) => Err(GatewayError::Timeout(self.request_timeout)),
        }
    }

    /// Fetch the instance health payload, for the status route
    pub async fn probe(&self, endpoint: SocketAddr) -> Result<serde_json::Value, GatewayError> {
        let uri = format!("http://{}{}", endpoint, self.health_path);
        let request = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| GatewayError::Internal(format!("failed to build probe request: {e}")))?;

        let response = tokio::time::timeout(self.probe_timeout, self.probe_client.request(request))
            .await
            .map_err(|_| GatewayError::Timeout(self.probe_timeout))?
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Unreachable(format!(
                "health probe returned {status}"
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?
            .to_bytes();

        serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Unreachable(format!("health payload is not JSON: {e}")))
    }
}

/// Strip the routing prefix from `path`, preserving the query string.
/// An exact prefix match forwards as the instance's root path.
pub fn rewrite_path(path: &str, query: Option<&str>, prefix: &str) -> String {
    let stripped = path.strip_prefix(prefix).unwrap_or(path);
    let stripped = if stripped.is_empty() { "/" } else { stripped };
    match query {
        Some(query) => format!("{stripped}?{query}"),
        None => stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_rewrite_strips_prefix() {
        assert_eq!(rewrite_path("/api/widgets", None, "/api"), "/widgets");
        assert_eq!(
            rewrite_path("/api/widgets/7/parts", None, "/api"),
            "/widgets/7/parts"
        );
    }

    #[test]
    fn test_rewrite_bare_prefix_becomes_root() {
        assert_eq!(rewrite_path("/api", None, "/api"), "/");
        assert_eq!(rewrite_path("/api/", None, "/api"), "/");
    }

    #[test]
    fn test_rewrite_preserves_query() {
        assert_eq!(
            rewrite_path("/api/widgets", Some("limit=10&after=3"), "/api"),
            "/widgets?limit=10&after=3"
        );
        assert_eq!(rewrite_path("/api", Some("x=1"), "/api"), "/?x=1");
    }

    #[test]
    fn test_rewrite_leaves_unprefixed_paths_alone() {
        assert_eq!(rewrite_path("/health", None, "/api"), "/health");
    }

    #[tokio::test]
    async fn test_probe_parses_health_payload() {
        let listener = TcpListener::bind(("127.0.0.1", 19210)).await.unwrap();
        let stub = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = r#"{"status":"healthy","message":"ok"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        let forwarder = Forwarder::new(&GatewayConfig::default(), &InstanceConfig::default());
        let health = forwarder
            .probe(([127, 0, 0, 1], 19210).into())
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");

        stub.abort();
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint() {
        let forwarder = Forwarder::new(&GatewayConfig::default(), &InstanceConfig::default());
        let err = forwarder
            .probe(([127, 0, 0, 1], 19219).into())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
    }
}
