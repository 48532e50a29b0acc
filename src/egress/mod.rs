//! Outbound network control for a sandbox.
//!
//! The policy document is loaded once at process start and shared read-only.
//! Domain rules are enforced by redirecting all DNS traffic in the sandbox's
//! network namespace to a local filtering resolver; IP rules are installed as
//! packet-filter rules.

pub mod dns;
pub mod engine;
pub mod policy;
pub mod redirect;

pub use dns::DnsFilter;
pub use engine::{Decision, evaluate_domain, evaluate_ip, evaluate_target};
pub use policy::{Action, ClassifiedTargets, PolicyDocument, PolicyError};
pub use redirect::{
    IptablesRunner, RedirectError, RuleRunner, install_egress_rules, install_ip_rules,
    install_redirect,
};
