//! Routing key extraction and endpoint resolution.
//!
//! A request names its sandbox either through the `OPEN-SANDBOX-INGRESS`
//! header or through its `Host`, shaped `<sandbox-name>-<port>.<rest>`.
//! Host parsing splits the first DNS label at its rightmost hyphen and
//! requires a decimal port after it, so sandbox names may contain hyphens:
//! `my-box-8080.sandbox.example.com` is sandbox `my-box`, port 8080.

use axum::http::{HeaderMap, StatusCode, Uri, header};
use tracing::debug;

use super::registry::{RegistryError, SandboxEndpoint, SandboxRegistry};

/// Control-plane routing header. Never forwarded to the sandbox.
pub const INGRESS_HEADER: &str = "open-sandbox-ingress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Header,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub sandbox: String,
    /// Port inside the sandbox, when the routing scheme encodes one.
    pub port: Option<u16>,
    pub source: KeySource,
}

/// Derive the routing key; `None` means the request is malformed. Sandbox
/// names are lowercased whichever source they come from.
pub fn extract_routing_key(headers: &HeaderMap, uri: &Uri) -> Option<RoutingKey> {
    if let Some(value) = headers.get(INGRESS_HEADER).and_then(|v| v.to_str().ok()) {
        let sandbox = value.trim();
        if !sandbox.is_empty() {
            return Some(RoutingKey {
                sandbox: sandbox.to_ascii_lowercase(),
                port: None,
                source: KeySource::Header,
            });
        }
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())?;

    let (sandbox, port) = parse_host(host)?;
    Some(RoutingKey {
        sandbox,
        port: Some(port),
        source: KeySource::Host,
    })
}

/// Parse `<sandbox-name>-<port>.<rest>[:<listen-port>]`.
pub fn parse_host(host: &str) -> Option<(String, u16)> {
    if host.starts_with('[') {
        return None;
    }
    let host = host.split_once(':').map_or(host, |(name, _)| name);
    let (label, rest) = host.split_once('.')?;
    if rest.is_empty() {
        return None;
    }

    let (name, port) = label.rsplit_once('-')?;
    if name.is_empty() || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((name.to_ascii_lowercase(), port))
}

#[derive(Debug)]
pub enum Resolution {
    Found(SandboxEndpoint),
    NotFound,
    NotReady(String),
    Error(String),
}

impl Resolution {
    pub fn from_lookup(result: Result<SandboxEndpoint, RegistryError>) -> Self {
        match result {
            Ok(endpoint) => Resolution::Found(endpoint),
            Err(RegistryError::NotFound(_)) => Resolution::NotFound,
            Err(RegistryError::NotReady { reason, .. }) => Resolution::NotReady(reason),
            Err(RegistryError::Lookup { reason, .. }) => Resolution::Error(reason),
        }
    }

    /// HTTP status for the outcome. 404 needs an operator, 503 is worth
    /// retrying, 502 is a platform fault.
    pub fn status(&self) -> StatusCode {
        match self {
            Resolution::Found(_) => StatusCode::OK,
            Resolution::NotFound => StatusCode::NOT_FOUND,
            Resolution::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Resolution::Error(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Per-request routing outcome. Never cached across requests.
#[derive(Debug)]
pub struct RoutingDecision {
    pub key: RoutingKey,
    pub resolution: Resolution,
}

pub async fn resolve(registry: &dyn SandboxRegistry, key: RoutingKey) -> RoutingDecision {
    let resolution = Resolution::from_lookup(registry.lookup(&key.sandbox).await);
    debug!(
        "Resolved sandbox {} ({:?}) -> {:?}",
        key.sandbox, key.source, resolution
    );
    RoutingDecision { key, resolution }
}
