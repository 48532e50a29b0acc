//! First-match evaluation of DNS names and IP addresses against a policy.
//!
//! Rules are scanned in declared order and the first matching rule decides.
//! Unmatched queries get the policy's default action. An absent policy
//! (`None`) means egress control is not configured and everything is allowed;
//! an explicitly empty policy denies everything.

use std::net::IpAddr;

use super::policy::{Action, PolicyDocument, Target, normalize_name};

/// Outcome of an evaluation, with the index of the deciding rule if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub rule: Option<usize>,
}

impl Decision {
    fn unconfigured() -> Self {
        Self {
            action: Action::Allow,
            rule: None,
        }
    }

    fn fallback(policy: &PolicyDocument) -> Self {
        Self {
            action: policy.default_action(),
            rule: None,
        }
    }
}

pub fn match_domain(policy: Option<&PolicyDocument>, domain: &str) -> Decision {
    let Some(policy) = policy else {
        return Decision::unconfigured();
    };
    let name = normalize_name(domain);

    policy
        .rules()
        .iter()
        .position(|rule| matches!(&rule.target, Target::Domain(pattern) if pattern.matches(&name)))
        .map(|index| Decision {
            action: policy.rules()[index].action,
            rule: Some(index),
        })
        .unwrap_or_else(|| Decision::fallback(policy))
}

pub fn match_ip(policy: Option<&PolicyDocument>, ip: IpAddr) -> Decision {
    let Some(policy) = policy else {
        return Decision::unconfigured();
    };

    policy
        .rules()
        .iter()
        .position(|rule| match (&rule.target, ip) {
            (Target::Ipv4(net), IpAddr::V4(addr)) => net.contains(addr),
            (Target::Ipv6(net), IpAddr::V6(addr)) => net.contains(addr),
            _ => false,
        })
        .map(|index| Decision {
            action: policy.rules()[index].action,
            rule: Some(index),
        })
        .unwrap_or_else(|| Decision::fallback(policy))
}

/// Verdict for a DNS name.
pub fn evaluate_domain(policy: Option<&PolicyDocument>, domain: &str) -> Action {
    match_domain(policy, domain).action
}

/// Verdict for an IP address. Families never cross-match.
pub fn evaluate_ip(policy: Option<&PolicyDocument>, ip: IpAddr) -> Action {
    match_ip(policy, ip).action
}

/// Evaluate a free-form target: IP addresses by address, anything else as a
/// DNS name.
pub fn evaluate_target(policy: Option<&PolicyDocument>, raw: &str) -> Decision {
    match raw.trim().parse::<IpAddr>() {
        Ok(ip) => match_ip(policy, ip),
        Err(_) => match_domain(policy, raw.trim()),
    }
}
