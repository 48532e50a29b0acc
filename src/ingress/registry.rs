//! Sandbox registry lookups.
//!
//! The registry answers "where is sandbox `name` reachable right now". In a
//! cluster this is the `BatchSandbox` custom resource maintained by the
//! sandbox controller: pod IPs are published as a JSON array in the
//! `sandbox.opensandbox.io/endpoints` annotation once replicas are ready.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{RegistryConfig, RegistryKind, StaticSandboxConfig};

pub const ENDPOINTS_ANNOTATION: &str = "sandbox.opensandbox.io/endpoints";
const API_GROUP: &str = "sandbox.opensandbox.io";
const API_VERSION: &str = "v1alpha1";
const RESOURCE_PLURAL: &str = "batchsandboxes";

/// Network location of a running sandbox instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEndpoint {
    pub host: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sandbox {0:?} not found")]
    NotFound(String),

    #[error("sandbox {name:?} is not ready: {reason}")]
    NotReady { name: String, reason: String },

    #[error("lookup of sandbox {name:?} failed: {reason}")]
    Lookup { name: String, reason: String },
}

#[async_trait]
pub trait SandboxRegistry: Send + Sync {
    async fn lookup(&self, name: &str) -> Result<SandboxEndpoint, RegistryError>;
}

/// Build the registry selected in the config.
pub fn from_config(config: &RegistryConfig) -> Result<Arc<dyn SandboxRegistry>> {
    match config.kind {
        RegistryKind::Kubernetes => Ok(Arc::new(KubernetesRegistry::from_config(config)?)),
        RegistryKind::Static => {
            info!(
                "Using static sandbox registry ({} entries)",
                config.sandboxes.len()
            );
            Ok(Arc::new(StaticRegistry::new(config.sandboxes.clone())))
        }
    }
}

/// Fixed name → endpoint table.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    sandboxes: BTreeMap<String, StaticSandboxConfig>,
}

impl StaticRegistry {
    pub fn new(sandboxes: BTreeMap<String, StaticSandboxConfig>) -> Self {
        Self { sandboxes }
    }
}

#[async_trait]
impl SandboxRegistry for StaticRegistry {
    async fn lookup(&self, name: &str) -> Result<SandboxEndpoint, RegistryError> {
        let entry = self
            .sandboxes
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if !entry.ready {
            return Err(RegistryError::NotReady {
                name: name.to_string(),
                reason: "marked not ready".to_string(),
            });
        }
        Ok(SandboxEndpoint {
            host: entry.host.clone(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchSandbox {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BatchSandboxSpec,
    #[serde(default)]
    pub status: Option<BatchSandboxStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchSandboxSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchSandboxStatus {
    #[serde(default)]
    pub ready: i32,
}

/// Decide readiness and pick the endpoint of a fetched `BatchSandbox`.
pub fn endpoint_from_resource(
    name: &str,
    resource: &BatchSandbox,
) -> Result<SandboxEndpoint, RegistryError> {
    let not_ready = |reason: String| RegistryError::NotReady {
        name: name.to_string(),
        reason,
    };

    let ready = resource.status.as_ref().map_or(0, |s| s.ready);
    if ready < 1 {
        return Err(not_ready(format!(
            "{} of {} replicas ready",
            ready,
            resource.spec.replicas.unwrap_or(1)
        )));
    }

    let raw = resource
        .metadata
        .annotations
        .get(ENDPOINTS_ANNOTATION)
        .ok_or_else(|| not_ready(format!("missing {} annotation", ENDPOINTS_ANNOTATION)))?;

    let endpoints: Vec<String> = serde_json::from_str(raw)
        .map_err(|e| not_ready(format!("invalid {} annotation: {}", ENDPOINTS_ANNOTATION, e)))?;

    endpoints
        .into_iter()
        .map(|ip| ip.trim().to_string())
        .find(|ip| !ip.is_empty())
        .map(|host| SandboxEndpoint { host })
        .ok_or_else(|| not_ready("no endpoints published".to_string()))
}

/// Reads `BatchSandbox` resources from the Kubernetes API server.
pub struct KubernetesRegistry {
    client: reqwest::Client,
    api_server: String,
    namespace: String,
    token: Option<String>,
}

impl KubernetesRegistry {
    pub fn new(api_server: &str, namespace: &str, token: Option<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            api_server: api_server.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token,
        }
    }

    /// In-cluster defaults: API server from `KUBERNETES_SERVICE_HOST`/`PORT`,
    /// service-account token, CA and namespace from their mounted files.
    pub fn from_config(config: &RegistryConfig) -> Result<Self> {
        let api_server = match &config.api_server {
            Some(url) => url.clone(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").context(
                    "registry.api_server not set and KUBERNETES_SERVICE_HOST is not defined",
                )?;
                let port =
                    std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
                if host.contains(':') {
                    format!("https://[{}]:{}", host, port)
                } else {
                    format!("https://{}:{}", host, port)
                }
            }
        };

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        let ca_path = expand(&config.ca_path);
        if Path::new(&ca_path).exists() {
            let pem = std::fs::read(&ca_path)
                .with_context(|| format!("reading cluster CA {}", ca_path))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parsing cluster CA {}", ca_path))?;
            builder = builder.add_root_certificate(cert);
        }

        let token_path = expand(&config.token_path);
        let token = std::fs::read_to_string(&token_path)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if token.is_none() {
            debug!("No service account token at {}", token_path);
        }

        let namespace = match &config.namespace {
            Some(ns) => ns.clone(),
            None => std::fs::read_to_string(expand(&config.namespace_path))
                .ok()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| "default".to_string()),
        };

        info!(
            "Using Kubernetes sandbox registry at {} (namespace {})",
            api_server, namespace
        );
        Ok(Self::new(&api_server, &namespace, token, builder.build()?))
    }

    pub fn resource_url(&self, name: &str) -> String {
        format!(
            "{}/apis/{}/{}/namespaces/{}/{}/{}",
            self.api_server, API_GROUP, API_VERSION, self.namespace, RESOURCE_PLURAL, name
        )
    }
}

#[async_trait]
impl SandboxRegistry for KubernetesRegistry {
    async fn lookup(&self, name: &str) -> Result<SandboxEndpoint, RegistryError> {
        let lookup_failed = |reason: String| RegistryError::Lookup {
            name: name.to_string(),
            reason,
        };

        let mut request = self.client.get(self.resource_url(name));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| lookup_failed(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(lookup_failed(format!(
                "API server returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let resource: BatchSandbox = response
            .json()
            .await
            .map_err(|e| lookup_failed(format!("decoding BatchSandbox: {}", e)))?;

        endpoint_from_resource(name, &resource)
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(json: serde_json::Value) -> BatchSandbox {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_ready_resource_yields_first_endpoint() {
        let res = resource(serde_json::json!({
            "metadata": {"annotations": {ENDPOINTS_ANNOTATION: "[\"10.0.0.7\", \"10.0.0.8\"]"}},
            "spec": {"replicas": 2},
            "status": {"ready": 2}
        }));
        assert_eq!(
            endpoint_from_resource("box", &res).unwrap(),
            SandboxEndpoint {
                host: "10.0.0.7".into()
            }
        );
    }

    #[test]
    fn test_not_ready_conditions() {
        let cases = [
            serde_json::json!({"metadata": {"annotations": {ENDPOINTS_ANNOTATION: "[\"10.0.0.7\"]"}}}),
            serde_json::json!({"status": {"ready": 1}}),
            serde_json::json!({
                "metadata": {"annotations": {ENDPOINTS_ANNOTATION: "not json"}},
                "status": {"ready": 1}
            }),
            serde_json::json!({
                "metadata": {"annotations": {ENDPOINTS_ANNOTATION: "[]"}},
                "status": {"ready": 1}
            }),
        ];
        for case in cases {
            let err = endpoint_from_resource("box", &resource(case.clone())).unwrap_err();
            assert!(
                matches!(err, RegistryError::NotReady { .. }),
                "{} gave {:?}",
                case,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_static_registry() {
        let mut sandboxes = BTreeMap::new();
        sandboxes.insert(
            "ready-box".to_string(),
            StaticSandboxConfig {
                host: "127.0.0.1".into(),
                ready: true,
            },
        );
        sandboxes.insert(
            "warming-box".to_string(),
            StaticSandboxConfig {
                host: "127.0.0.2".into(),
                ready: false,
            },
        );
        let registry = StaticRegistry::new(sandboxes);

        assert_eq!(registry.lookup("ready-box").await.unwrap().host, "127.0.0.1");
        assert!(matches!(
            registry.lookup("warming-box").await,
            Err(RegistryError::NotReady { .. })
        ));
        assert!(matches!(
            registry.lookup("missing").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_resource_url() {
        let registry = KubernetesRegistry::new(
            "https://10.96.0.1:443/",
            "sandboxes",
            None,
            reqwest::Client::new(),
        );
        assert_eq!(
            registry.resource_url("box-1"),
            "https://10.96.0.1:443/apis/sandbox.opensandbox.io/v1alpha1/namespaces/sandboxes/batchsandboxes/box-1"
        );
    }

    #[tokio::test]
    async fn test_kubernetes_lookup_maps_api_responses() {
        use axum::{Router, extract::Path as UrlPath, http::StatusCode, response::IntoResponse, routing::get};

        async fn batch_sandbox(UrlPath((_ns, name)): UrlPath<(String, String)>) -> axum::response::Response {
            match name.as_str() {
                "live" => axum::Json(serde_json::json!({
                    "metadata": {"annotations": {ENDPOINTS_ANNOTATION: "[\"10.1.2.3\"]"}},
                    "status": {"ready": 1}
                }))
                .into_response(),
                "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "etcd unavailable").into_response(),
                "garbage" => "not json".into_response(),
                _ => StatusCode::NOT_FOUND.into_response(),
            }
        }

        let app = Router::new().route(
            "/apis/sandbox.opensandbox.io/v1alpha1/namespaces/{ns}/batchsandboxes/{name}",
            get(batch_sandbox),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let registry = KubernetesRegistry::new(
            &format!("http://{}", addr),
            "default",
            Some("token".into()),
            reqwest::Client::new(),
        );

        assert_eq!(registry.lookup("live").await.unwrap().host, "10.1.2.3");
        assert!(matches!(
            registry.lookup("gone").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            registry.lookup("broken").await,
            Err(RegistryError::Lookup { .. })
        ));
        assert!(matches!(
            registry.lookup("garbage").await,
            Err(RegistryError::Lookup { .. })
        ));
    }
}
