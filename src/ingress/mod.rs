//! Inbound routing from the public edge to sandbox instances.
//!
//! Nothing is statically configured per sandbox: each request carries its
//! routing key, the key is resolved through the sandbox registry, and the
//! request is proxied to whatever endpoint that resolution returns.

pub mod proxy;
pub mod registry;
pub mod routing;
pub mod server;

pub use proxy::{ProxyTarget, ReverseProxy, rewrite_request};
pub use registry::{KubernetesRegistry, RegistryError, SandboxEndpoint, SandboxRegistry, StaticRegistry};
pub use routing::{INGRESS_HEADER, Resolution, RoutingDecision, RoutingKey, extract_routing_key};
pub use server::{HEALTH_PATH, IngressServer, IngressState, router};
