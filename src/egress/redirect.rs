//! Packet-filter rules for egress enforcement.
//!
//! Two rule sets are installed in the sandbox's own network namespace:
//!
//! - DNS capture: IPv4 UDP and TCP traffic to port 53 is rewritten in the
//!   `nat` table's `OUTPUT` chain to a local port, where the DNS filter
//!   answers or refuses each query. IPv6 port 53 is dropped outright.
//!   Packets carrying the filter's firewall mark are exempt so its own
//!   upstream queries leave the namespace.
//! - IP rules: literal/CIDR targets from the policy become `OUTPUT` filter
//!   rules (`ACCEPT`/`DROP`) in declared order.
//!
//! Installing these needs only `CAP_NET_ADMIN` inside the namespace, not
//! root on the host. There is no undo short of deleting the rules or tearing
//! down the namespace, so an install is all-or-nothing: on failure, every
//! rule this call already appended is deleted again and the error says so.

use std::fmt;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::policy::{Action, PolicyDocument, Target};

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("failed to install `{rule}` ({installed} earlier rule(s) rolled back{}): {source}", rollback_note(.rollback_failures))]
    Install {
        rule: String,
        installed: usize,
        rollback_failures: Vec<String>,
        #[source]
        source: Box<RedirectError>,
    },
}

fn rollback_note(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!("; rollback FAILED, left in place: {}", failures.join(", "))
    }
}

/// Executes one packet-filter command.
#[cfg_attr(test, mockall::automock)]
pub trait RuleRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<(), RedirectError>;
}

/// Runs `iptables`/`ip6tables` from `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IptablesRunner;

impl RuleRunner for IptablesRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<(), RedirectError> {
        debug!("Running {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RedirectError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(RedirectError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn program(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// One rule appended to a table/chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub family: Family,
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FirewallRule {
    pub fn program(&self) -> &'static str {
        self.family.program()
    }

    fn args(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            op.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }

    pub fn append_args(&self) -> Vec<String> {
        self.args("-A")
    }

    pub fn delete_args(&self) -> Vec<String> {
        self.args("-D")
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program(), self.append_args().join(" "))
    }
}

/// DNS capture rules: IPv4 UDP and TCP port 53 are redirected to
/// `target_port`, IPv6 port 53 is dropped so it cannot bypass the filter.
/// A `mark` of 0 disables the loop exemption.
pub fn dns_redirect_rules(target_port: u16, mark: u32) -> Vec<FirewallRule> {
    let matcher = |proto: &str| {
        let mut spec = vec![
            "-p".to_string(),
            proto.to_string(),
            "--dport".to_string(),
            DNS_PORT.to_string(),
        ];
        if mark != 0 {
            spec.extend([
                "-m".to_string(),
                "mark".to_string(),
                "!".to_string(),
                "--mark".to_string(),
                format!("{:#x}", mark),
            ]);
        }
        spec
    };

    let redirect = ["udp", "tcp"].into_iter().map(|proto| {
        let mut spec = matcher(proto);
        spec.extend([
            "-j".to_string(),
            "REDIRECT".to_string(),
            "--to-ports".to_string(),
            target_port.to_string(),
        ]);
        FirewallRule {
            family: Family::V4,
            table: "nat",
            chain: "OUTPUT",
            spec,
        }
    });

    // The filter listens on IPv4 loopback only.
    let drop_v6 = ["udp", "tcp"].into_iter().map(|proto| {
        let mut spec = matcher(proto);
        spec.extend(["-j".to_string(), "DROP".to_string()]);
        FirewallRule {
            family: Family::V6,
            table: "filter",
            chain: "OUTPUT",
            spec,
        }
    });

    redirect.chain(drop_v6).collect()
}

/// Filter rules for the policy's IP targets, in rule order so the kernel's
/// first-match agrees with the engine's.
///
/// The default action is not installed here: names allowed through DNS
/// resolve to addresses no IP rule mentions.
pub fn ip_filter_rules(policy: &PolicyDocument) -> Vec<FirewallRule> {
    policy
        .rules()
        .iter()
        .filter_map(|rule| {
            let family = match rule.target {
                Target::Domain(_) => return None,
                Target::Ipv4(_) => Family::V4,
                Target::Ipv6(_) => Family::V6,
            };
            let verdict = match rule.action {
                Action::Allow => "ACCEPT",
                Action::Deny => "DROP",
            };
            Some(FirewallRule {
                family,
                table: "filter",
                chain: "OUTPUT",
                spec: vec![
                    "-d".to_string(),
                    rule.raw.clone(),
                    "-j".to_string(),
                    verdict.to_string(),
                ],
            })
        })
        .collect()
}

/// Append `rules` in order. On the first failure, delete what was appended
/// (newest first) and report both the failure and any rollback leftovers.
pub fn install_rules(
    runner: &dyn RuleRunner,
    rules: &[FirewallRule],
) -> Result<(), RedirectError> {
    for (index, rule) in rules.iter().enumerate() {
        if let Err(err) = runner.run(rule.program(), &rule.append_args()) {
            let mut rollback_failures = Vec::new();
            for installed in rules[..index].iter().rev() {
                if let Err(rollback_err) = runner.run(installed.program(), &installed.delete_args())
                {
                    warn!("Rollback of `{}` failed: {}", installed, rollback_err);
                    rollback_failures.push(installed.to_string());
                }
            }
            return Err(RedirectError::Install {
                rule: rule.to_string(),
                installed: index,
                rollback_failures,
                source: Box::new(err),
            });
        }
    }
    Ok(())
}

/// Redirect all DNS traffic leaving this namespace to `target_port` on
/// loopback.
pub fn install_redirect(
    runner: &dyn RuleRunner,
    target_port: u16,
    mark: u32,
) -> Result<(), RedirectError> {
    let rules = dns_redirect_rules(target_port, mark);
    install_rules(runner, &rules)?;
    info!("DNS capture installed: udp/tcp port {} -> {}", DNS_PORT, target_port);
    Ok(())
}

pub fn install_ip_rules(
    runner: &dyn RuleRunner,
    policy: &PolicyDocument,
) -> Result<usize, RedirectError> {
    let rules = ip_filter_rules(policy);
    install_rules(runner, &rules)?;
    if !rules.is_empty() {
        info!("Installed {} IP egress rule(s)", rules.len());
    }
    Ok(rules.len())
}

/// DNS capture plus, when `policy` is given, its IP rules, as one
/// all-or-nothing install. Returns the number of IP rules.
pub fn install_egress_rules(
    runner: &dyn RuleRunner,
    target_port: u16,
    mark: u32,
    policy: Option<&PolicyDocument>,
) -> Result<usize, RedirectError> {
    let mut rules = dns_redirect_rules(target_port, mark);
    let capture = rules.len();
    if let Some(policy) = policy {
        rules.extend(ip_filter_rules(policy));
    }
    install_rules(runner, &rules)?;

    let ip_rules = rules.len() - capture;
    info!(
        "Egress rules installed: DNS port {} -> {}, {} IP rule(s)",
        DNS_PORT, target_port, ip_rules
    );
    Ok(ip_rules)
}
