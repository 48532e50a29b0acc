use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sandgate/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Port inside the sandbox for header-routed requests (no port in the key)
    #[serde(default = "default_sandbox_port")]
    pub default_port: u16,

    /// Idle upstream connections are kept this long; long enough for
    /// quiet WebSocket sessions
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    #[default]
    Kubernetes,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry backend: "kubernetes" | "static"
    #[serde(default)]
    pub kind: RegistryKind,

    /// API server URL (default: in-cluster service env vars)
    #[serde(default)]
    pub api_server: Option<String>,

    /// Namespace holding BatchSandbox resources (default: pod namespace)
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_ca_path")]
    pub ca_path: String,

    #[serde(default = "default_namespace_path")]
    pub namespace_path: String,

    /// Per-lookup timeout in seconds
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Fixed sandboxes for the static registry
    #[serde(default)]
    pub sandboxes: BTreeMap<String, StaticSandboxConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSandboxConfig {
    pub host: String,

    #[serde(default = "default_true")]
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Address the DNS filter binds
    #[serde(default = "default_egress_listen")]
    pub listen: String,

    /// Port DNS traffic is redirected to
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    /// Upstream resolver "ip:port" (default: first nameserver in resolv.conf)
    #[serde(default)]
    pub upstream: Option<String>,

    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,

    /// Firewall mark on upstream queries, exempt from the redirect (0 = off)
    #[serde(default = "default_mark")]
    pub mark: u32,

    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    /// Environment variable holding the policy JSON
    #[serde(default = "default_policy_env")]
    pub policy_env: String,

    /// Install iptables/ip6tables rules for IP targets
    #[serde(default = "default_true")]
    pub install_ip_rules: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" | "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    28888
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_sandbox_port() -> u16 {
    44772 // execd
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}
fn default_ca_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}
fn default_namespace_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace".to_string()
}
fn default_registry_timeout() -> u64 {
    5
}
fn default_egress_listen() -> String {
    "127.0.0.1".to_string()
}
fn default_dns_port() -> u16 {
    15353
}
fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}
fn default_mark() -> u32 {
    0x1
}
fn default_upstream_timeout() -> u64 {
    2000
}
fn default_policy_env() -> String {
    "SANDGATE_EGRESS_POLICY".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            default_port: default_sandbox_port(),
            idle_timeout_secs: default_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: RegistryKind::default(),
            api_server: None,
            namespace: None,
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            namespace_path: default_namespace_path(),
            timeout_secs: default_registry_timeout(),
            sandboxes: BTreeMap::new(),
        }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            listen: default_egress_listen(),
            dns_port: default_dns_port(),
            upstream: None,
            resolv_conf: default_resolv_conf(),
            mark: default_mark(),
            upstream_timeout_ms: default_upstream_timeout(),
            policy_env: default_policy_env(),
            install_ip_rules: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_PATH`] when it exists,
    /// falling back to built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).into_owned()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !default.exists() {
                    return Ok(Config::default());
                }
                default
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
