//! sandgate - network boundary control plane for code-execution sandboxes
//!
//! This crate provides:
//! - Ingress routing: per-request resolution of a sandbox name to its live
//!   endpoint, with HTTP/WebSocket reverse proxying
//! - Egress policy: allow/deny rules over DNS names and IP ranges, enforced
//!   by redirecting DNS through a filtering resolver
//! - Packet-filter installation for the DNS redirect and IP rules

pub mod config;
pub mod egress;
pub mod ingress;

pub use config::Config;
