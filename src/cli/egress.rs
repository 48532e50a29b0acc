use anyhow::{Context, Result};
use clap::Args;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use sandgate::Config;
use sandgate::config::EgressConfig;
use sandgate::egress::dns::upstream_from_resolv_conf;
use sandgate::egress::redirect::DNS_PORT;
use sandgate::egress::{DnsFilter, IptablesRunner, install_egress_rules};

use super::{load_policy, shutdown_signal};

#[derive(Args)]
pub struct EgressArgs {
    /// Read the policy from a file instead of the environment
    #[arg(long)]
    pub policy_file: Option<PathBuf>,

    /// Serve DNS without installing packet-filter rules
    #[arg(long)]
    pub skip_redirect: bool,
}

pub async fn run(args: EgressArgs, config: &Config) -> Result<()> {
    let egress = &config.egress;

    let Some(policy) = load_policy(args.policy_file.as_deref(), &egress.policy_env)? else {
        warn!(
            "No egress policy configured (${} unset); outbound traffic is unrestricted",
            egress.policy_env
        );
        return Ok(());
    };

    let targets = policy.classify_targets();
    info!(
        "Loaded egress policy: {} rule(s), default {}, IP targets allow v4/v6 {}/{}, deny v4/v6 {}/{}",
        policy.rules().len(),
        policy.default_action(),
        targets.allow_v4.len(),
        targets.allow_v6.len(),
        targets.deny_v4.len(),
        targets.deny_v6.len()
    );

    let upstream = resolve_upstream(egress)?;
    info!("Upstream resolver: {}", upstream);

    // Bind before redirecting so no query is sent to a closed port.
    let listen_ip: IpAddr = egress
        .listen
        .parse()
        .with_context(|| format!("invalid egress.listen {:?}", egress.listen))?;
    let listen = SocketAddr::new(listen_ip, egress.dns_port);
    let udp = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("binding udp {}", listen))?;
    let tcp = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding tcp {}", listen))?;

    if args.skip_redirect {
        warn!("Skipping packet-filter installation; DNS is only filtered for clients using {}", listen);
    } else {
        let ip_policy = egress.install_ip_rules.then_some(&policy);
        install_egress_rules(&IptablesRunner, egress.dns_port, egress.mark, ip_policy)
            .context("installing egress rules")?;
    }

    let filter = Arc::new(DnsFilter::new(
        Some(Arc::new(policy)),
        upstream,
        egress.mark,
        Duration::from_millis(egress.upstream_timeout_ms),
    ));

    tokio::select! {
        result = filter.clone().serve_udp(udp) => result,
        result = filter.serve_tcp(tcp) => result,
        _ = shutdown_signal() => {
            info!("Egress filter stopped");
            Ok(())
        }
    }
}

fn resolve_upstream(egress: &EgressConfig) -> Result<SocketAddr> {
    if let Some(upstream) = &egress.upstream {
        return upstream
            .parse::<SocketAddr>()
            .or_else(|_| upstream.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
            .with_context(|| format!("invalid egress.upstream {:?}", upstream));
    }

    let contents = std::fs::read_to_string(&egress.resolv_conf)
        .with_context(|| format!("reading {}", egress.resolv_conf))?;
    upstream_from_resolv_conf(&contents)
        .with_context(|| format!("no usable nameserver in {}", egress.resolv_conf))
}
