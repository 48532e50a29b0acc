//! Ingress HTTP server.
//!
//! Every path except the health check is routed: the routing key is taken
//! from the request, resolved against the sandbox registry, and the request
//! is proxied to the resolved endpoint. Requests are handled concurrently
//! with no shared mutable state.

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::proxy::{ProxyTarget, ReverseProxy};
use super::registry::{self, SandboxRegistry};
use super::routing::{Resolution, extract_routing_key, resolve};
use crate::config::{Config, ServerConfig};

/// Health check path; always 200, never routed.
pub const HEALTH_PATH: &str = "/status.ok";

pub struct IngressState {
    registry: Arc<dyn SandboxRegistry>,
    proxy: ReverseProxy,
    /// Port used when the routing key carries none (header routing).
    default_port: u16,
}

impl IngressState {
    pub fn new(registry: Arc<dyn SandboxRegistry>, proxy: ReverseProxy, default_port: u16) -> Self {
        Self {
            registry,
            proxy,
            default_port,
        }
    }
}

pub fn router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .fallback(route_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct IngressServer {
    config: Config,
}

impl IngressServer {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let registry = registry::from_config(&self.config.registry)?;
        let proxy = ReverseProxy::new(
            Duration::from_secs(self.config.ingress.idle_timeout_secs),
            Duration::from_secs(self.config.ingress.connect_timeout_secs),
        );
        let state = Arc::new(IngressState::new(
            registry,
            proxy,
            self.config.ingress.default_port,
        ));

        let addr = listen_addr(&self.config.server)?;

        info!("Starting ingress gateway on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("Ingress gateway stopped");
        Ok(())
    }
}

fn listen_addr(server: &ServerConfig) -> Result<SocketAddr> {
    let bind: IpAddr = server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind {:?}", server.bind))?;
    Ok(SocketAddr::new(bind, server.port))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn route_request(State(state): State<Arc<IngressState>>, req: Request) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let Some(key) = extract_routing_key(req.headers(), req.uri()) else {
        debug!("No routing key for {} {}", req.method(), req.uri());
        return (StatusCode::BAD_REQUEST, "missing sandbox routing key").into_response();
    };

    let decision = resolve(state.registry.as_ref(), key).await;
    let status = decision.resolution.status();
    let sandbox = &decision.key.sandbox;
    match decision.resolution {
        Resolution::Found(endpoint) => {
            let target = ProxyTarget {
                host: endpoint.host,
                port: decision.key.port.unwrap_or(state.default_port),
            };
            state.proxy.forward(req, &target, peer).await
        }
        Resolution::NotFound => {
            info!("Sandbox {} not found", sandbox);
            (status, format!("sandbox {} not found", sandbox)).into_response()
        }
        Resolution::NotReady(reason) => {
            info!("Sandbox {} not ready: {}", sandbox, reason);
            (
                status,
                format!("sandbox {} is not ready: {}", sandbox, reason),
            )
                .into_response()
        }
        Resolution::Error(reason) => {
            warn!("Sandbox {} lookup failed: {}", sandbox, reason);
            (status, format!("sandbox {} lookup failed", sandbox)).into_response()
        }
    }
}
