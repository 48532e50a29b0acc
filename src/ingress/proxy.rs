//! Per-request reverse proxying to a resolved sandbox endpoint.
//!
//! The upstream target is rebuilt for every request from the resolution
//! result; there is no proxy object bound to a single upstream. The request
//! rewrite is a pure function so it can be checked without any sockets.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, Uri, Version, header},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::routing::INGRESS_HEADER;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_REAL_IP: &str = "x-real-ip";

/// Hop-by-hop headers dropped from ordinary (non-upgrade) requests.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream URI {0:?}")]
    InvalidTarget(String),
}

/// Where a single request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// Best available client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header_value(X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_value(X_REAL_IP))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// Rewrite an inbound request for `target`.
pub fn rewrite_request<B>(
    mut req: Request<B>,
    target: &ProxyTarget,
    peer: Option<SocketAddr>,
) -> Result<Request<B>, ProxyError> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}{}", target.authority(), path_and_query);
    *req.uri_mut() = uri
        .parse::<Uri>()
        .map_err(|_| ProxyError::InvalidTarget(uri.clone()))?;
    *req.version_mut() = Version::HTTP_11;

    let websocket = is_websocket_upgrade(req.headers());
    let client = client_address(req.headers(), peer);
    let headers = req.headers_mut();

    headers.remove(INGRESS_HEADER);
    headers.remove(X_FORWARDED_HOST);

    if let Some(client) = client.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(X_FORWARDED_FOR, client);
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    if websocket {
        // Sec-WebSocket-Key and the rest of the handshake pass through as-is.
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    } else {
        let listed: Vec<String> = headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        for name in &listed {
            headers.remove(name.as_str());
        }
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
    }

    Ok(req)
}

/// Pooled HTTP/1.1 client that forwards requests and splices upgrades.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
}

impl ReverseProxy {
    pub fn new(idle_timeout: Duration, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .build(connector);
        Self { client }
    }

    /// Forward `req` to `target`. I/O failures become 502.
    ///
    /// Dropping the returned future drops the upstream request, which closes
    /// its connection.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
        target: &ProxyTarget,
        peer: Option<SocketAddr>,
    ) -> Response {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let websocket = is_websocket_upgrade(req.headers());
        let client_upgrade = websocket.then(|| hyper::upgrade::on(&mut req));

        let req = match rewrite_request(req, target, peer) {
            Ok(req) => req,
            Err(e) => {
                warn!(%method, %uri, %target, websocket, "proxy rewrite failed: {}", e);
                return bad_gateway();
            }
        };

        let mut response = match self.client.request(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%method, %uri, %target, websocket, "proxy request failed: {}", e);
                return bad_gateway();
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS
            && let Some(client_upgrade) = client_upgrade
        {
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(splice(client_upgrade, upstream_upgrade, target.clone()));
        }

        response.into_response()
    }
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "sandbox endpoint unreachable").into_response()
}

/// Copy bytes both ways between the upgraded client and upstream connections
/// until either side closes.
async fn splice(client: OnUpgrade, upstream: OnUpgrade, target: ProxyTarget) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%target, "upgrade failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => {
            debug!(%target, sent, received, "upgraded connection closed")
        }
        Err(e) => debug!(%target, "upgraded connection ended: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ProxyTarget {
        ProxyTarget {
            host: "10.0.0.5".into(),
            port: 44772,
        }
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.0.2.10:51000".parse().unwrap())
    }

    #[test]
    fn test_target_uri_built_per_request() {
        let req = Request::builder()
            .uri("http://box-8080.sandbox.local/files/a.txt?download=1")
            .body(())
            .unwrap();
        let out = rewrite_request(req, &target(), peer()).unwrap();
        assert_eq!(
            out.uri().to_string(),
            "http://10.0.0.5:44772/files/a.txt?download=1"
        );

        let v6 = ProxyTarget {
            host: "fd00::5".into(),
            port: 80,
        };
        let out = rewrite_request(Request::builder().uri("/").body(()).unwrap(), &v6, None).unwrap();
        assert_eq!(out.uri().to_string(), "http://[fd00::5]:80/");
    }

    #[test]
    fn test_forwarding_headers() {
        let req = Request::builder()
            .uri("/")
            .header("open-sandbox-ingress", "mybox")
            .header("x-forwarded-host", "evil.example")
            .header("x-forwarded-for", "203.0.113.1, 10.0.0.1")
            .body(())
            .unwrap();
        let out = rewrite_request(req, &target(), peer()).unwrap();
        let headers = out.headers();
        assert!(headers.get("open-sandbox-ingress").is_none());
        assert!(headers.get("x-forwarded-host").is_none());
        assert_eq!(headers["x-forwarded-for"], "203.0.113.1");
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_client_address_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_address(&headers, peer()).as_deref(), Some("192.0.2.10"));
        assert_eq!(client_address(&headers, None), None);

        headers.insert(X_REAL_IP, HeaderValue::from_static("198.51.100.7"));
        assert_eq!(client_address(&headers, peer()).as_deref(), Some("198.51.100.7"));

        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static(" 203.0.113.9 ,10.0.0.1"));
        assert_eq!(client_address(&headers, peer()).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn test_existing_forwarded_proto_kept() {
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap();
        let out = rewrite_request(req, &target(), peer()).unwrap();
        assert_eq!(out.headers()["x-forwarded-proto"], "https");
    }

    #[test]
    fn test_hop_by_hop_headers_stripped() {
        let req = Request::builder()
            .uri("/")
            .header("connection", "keep-alive, x-trace-hop")
            .header("keep-alive", "timeout=5")
            .header("x-trace-hop", "1")
            .header("te", "trailers")
            .header("x-app", "kept")
            .body(())
            .unwrap();
        let out = rewrite_request(req, &target(), peer()).unwrap();
        let headers = out.headers();
        for name in ["connection", "keep-alive", "x-trace-hop", "te"] {
            assert!(headers.get(name).is_none(), "{} should be stripped", name);
        }
        assert_eq!(headers["x-app"], "kept");
    }

    #[test]
    fn test_websocket_handshake_passthrough() {
        let req = Request::builder()
            .uri("/ws")
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "WebSocket")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("sec-websocket-protocol", "chat")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(req.headers()));

        let out = rewrite_request(req, &target(), peer()).unwrap();
        let headers = out.headers();
        assert_eq!(headers["connection"], "Upgrade");
        assert_eq!(headers["upgrade"], "websocket");
        assert_eq!(headers["sec-websocket-version"], "13");
        assert_eq!(headers["sec-websocket-key"], "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(headers["sec-websocket-protocol"], "chat");
    }

    #[test]
    fn test_non_websocket_upgrade_not_treated_as_websocket() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }
}
