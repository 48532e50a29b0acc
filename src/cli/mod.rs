pub mod egress;
pub mod ingress;
pub mod policy;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{info, warn};

use sandgate::egress::PolicyDocument;

#[derive(Parser)]
#[command(name = "sandgate")]
#[command(author, version, about = "Ingress routing and egress policy for code-execution sandboxes")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SANDGATE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ingress gateway
    Ingress(ingress::IngressArgs),

    /// Run the egress DNS filter inside a sandbox network namespace
    Egress(egress::EgressArgs),

    /// Inspect and evaluate an egress policy
    Policy(policy::PolicyArgs),
}

/// Policy from `file` if given, else from the `env_var` environment
/// variable. `None` means egress control is not configured.
pub fn load_policy(file: Option<&Path>, env_var: &str) -> Result<Option<PolicyDocument>> {
    match file {
        Some(path) => {
            let policy = PolicyDocument::load(path)
                .with_context(|| format!("invalid egress policy in {}", path.display()))?;
            Ok(Some(policy))
        }
        None => PolicyDocument::from_env(env_var)
            .with_context(|| format!("invalid egress policy in ${}", env_var)),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
