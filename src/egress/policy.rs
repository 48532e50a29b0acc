//! Egress policy document.
//!
//! A policy is an ordered list of `{action, target}` rules plus a default
//! verdict. Targets are classified once, at parse time, into domain patterns
//! or IPv4/IPv6 literals and CIDR ranges. The parsed document is immutable
//! and is shared read-only by every evaluation.
//!
//! ```json
//! {
//!   "egress": [
//!     {"action": "allow", "target": "*.pypi.org"},
//!     {"action": "deny",  "target": "10.0.0.0/8"}
//!   ],
//!   "default_action": "deny"
//! }
//! ```

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Verdict of a rule or of the whole policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            other => Err(format!("unknown action {:?}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("malformed policy JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rule {index}: invalid action {action:?} (expected \"allow\" or \"deny\")")]
    InvalidAction { index: usize, action: String },

    #[error("invalid default_action {0:?} (expected \"allow\" or \"deny\")")]
    InvalidDefaultAction(String),

    #[error("rule {index}: target is empty")]
    EmptyTarget { index: usize },

    #[error("rule {index}: malformed IP/CIDR target {target:?}: {reason}")]
    InvalidAddress {
        index: usize,
        target: String,
        reason: String,
    },

    #[error("rule {index}: unsupported wildcard in {target:?} (only a single leading \"*.\" is allowed)")]
    UnsupportedWildcard { index: usize, target: String },

    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Domain half of a rule target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    /// Matches exactly one name.
    Exact(String),
    /// `*.<suffix>`: matches names strictly below `suffix`, never the apex.
    Wildcard(String),
}

impl DomainPattern {
    /// `name` must already be normalized with [`normalize_name`].
    pub fn matches(&self, name: &str) -> bool {
        match self {
            DomainPattern::Exact(pattern) => pattern == name,
            DomainPattern::Wildcard(suffix) => name
                .strip_suffix(suffix.as_str())
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
        }
    }
}

/// A rule target after structural classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Domain(DomainPattern),
    Ipv4(Ipv4Network),
    Ipv6(Ipv6Network),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    /// Target as written in the document (trimmed).
    pub raw: String,
    pub target: Target,
}

/// IP targets split by (action × address family), in rule order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassifiedTargets {
    pub allow_v4: Vec<String>,
    pub allow_v6: Vec<String>,
    pub deny_v4: Vec<String>,
    pub deny_v6: Vec<String>,
}

impl ClassifiedTargets {
    pub fn is_empty(&self) -> bool {
        self.allow_v4.is_empty()
            && self.allow_v6.is_empty()
            && self.deny_v4.is_empty()
            && self.deny_v6.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    rules: Vec<Rule>,
    default_action: Action,
}

#[derive(Debug, Default, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    egress: Option<Vec<RawRule>>,
    #[serde(default)]
    default_action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    action: String,
    #[serde(default)]
    target: String,
}

impl Default for PolicyDocument {
    /// The empty policy: no rules, everything denied.
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: Action::Deny,
        }
    }
}

impl PolicyDocument {
    /// Parse a policy from its JSON form.
    ///
    /// Empty input, `null` and `{}` all yield the empty deny-all policy. A
    /// missing or empty `default_action` is normalized to `deny`.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        let Some(doc) = serde_json::from_str::<Option<RawPolicy>>(raw)? else {
            return Ok(Self::default());
        };

        let default_action = match doc.default_action.as_deref().map(str::trim) {
            None | Some("") => Action::Deny,
            Some(value) => value
                .parse()
                .map_err(|_| PolicyError::InvalidDefaultAction(value.to_string()))?,
        };

        let mut rules = Vec::new();
        for (index, rule) in doc.egress.unwrap_or_default().into_iter().enumerate() {
            let action = rule
                .action
                .trim()
                .parse()
                .map_err(|_| PolicyError::InvalidAction {
                    index,
                    action: rule.action.clone(),
                })?;

            let raw = rule.target.trim();
            if raw.is_empty() {
                return Err(PolicyError::EmptyTarget { index });
            }

            rules.push(Rule {
                action,
                raw: raw.to_string(),
                target: classify(index, raw)?,
            });
        }

        Ok(Self {
            rules,
            default_action,
        })
    }

    /// Read a policy from the given environment variable.
    ///
    /// Returns `Ok(None)` when the variable is unset, meaning egress control
    /// is not configured. A set-but-empty variable is the deny-all policy.
    pub fn from_env(var: &str) -> Result<Option<Self>, PolicyError> {
        match std::env::var(var) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn default_action(&self) -> Action {
        self.default_action
    }

    /// Split IP literal/CIDR targets by action and family, preserving rule
    /// order. Domain patterns are left out; they are enforced through DNS.
    pub fn classify_targets(&self) -> ClassifiedTargets {
        let mut out = ClassifiedTargets::default();
        for rule in &self.rules {
            let bucket = match (&rule.target, rule.action) {
                (Target::Domain(_), _) => continue,
                (Target::Ipv4(_), Action::Allow) => &mut out.allow_v4,
                (Target::Ipv6(_), Action::Allow) => &mut out.allow_v6,
                (Target::Ipv4(_), Action::Deny) => &mut out.deny_v4,
                (Target::Ipv6(_), Action::Deny) => &mut out.deny_v6,
            };
            bucket.push(rule.raw.clone());
        }
        out
    }
}

/// Lowercase a DNS name and strip one trailing root dot.
pub fn normalize_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    match lower.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}

fn classify(index: usize, raw: &str) -> Result<Target, PolicyError> {
    let invalid = |reason: String| PolicyError::InvalidAddress {
        index,
        target: raw.to_string(),
        reason,
    };

    if raw.contains(':') {
        return raw
            .parse::<Ipv6Network>()
            .map(Target::Ipv6)
            .map_err(|e| invalid(e.to_string()));
    }

    if looks_like_ipv4(raw) {
        return raw
            .parse::<Ipv4Network>()
            .map(Target::Ipv4)
            .map_err(|e| invalid(e.to_string()));
    }

    domain_pattern(index, raw).map(Target::Domain)
}

/// Digits and dots only before an optional `/prefix`.
fn looks_like_ipv4(raw: &str) -> bool {
    let host = raw.split_once('/').map_or(raw, |(host, _)| host);
    host.bytes().any(|b| b.is_ascii_digit()) && host.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

fn domain_pattern(index: usize, raw: &str) -> Result<DomainPattern, PolicyError> {
    let name = normalize_name(raw);
    let unsupported = || PolicyError::UnsupportedWildcard {
        index,
        target: raw.to_string(),
    };

    if let Some(suffix) = name.strip_prefix("*.") {
        if suffix.is_empty() || suffix.contains('*') {
            return Err(unsupported());
        }
        return Ok(DomainPattern::Wildcard(suffix.to_string()));
    }
    if name.contains('*') {
        return Err(unsupported());
    }
    Ok(DomainPattern::Exact(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_inputs_deny_everything() {
        for raw in ["", "   ", "null", "{}"] {
            let policy = PolicyDocument::parse(raw).unwrap();
            assert!(policy.rules().is_empty(), "input {:?}", raw);
            assert_eq!(policy.default_action(), Action::Deny, "input {:?}", raw);
        }
    }

    #[test]
    fn test_missing_default_action_falls_back_to_deny() {
        let policy =
            PolicyDocument::parse(r#"{"egress":[{"action":"allow","target":"example.com"}]}"#)
                .unwrap();
        assert_eq!(policy.rules().len(), 1);
        assert_eq!(policy.default_action(), Action::Deny);

        let policy = PolicyDocument::parse(r#"{"egress":[],"default_action":""}"#).unwrap();
        assert_eq!(policy.default_action(), Action::Deny);
    }

    #[test]
    fn test_explicit_default_allow() {
        let policy = PolicyDocument::parse(r#"{"default_action":"allow"}"#).unwrap();
        assert_eq!(policy.default_action(), Action::Allow);
    }

    #[test]
    fn test_invalid_action_rejected() {
        let err = PolicyDocument::parse(r#"{"egress":[{"action":"foo","target":"a.com"}]}"#)
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidAction { index: 0, .. }));

        let err = PolicyDocument::parse(r#"{"egress":[{"target":"a.com"}]}"#).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidAction { .. }));

        let err = PolicyDocument::parse(r#"{"default_action":"maybe"}"#).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidDefaultAction(_)));
    }

    #[test]
    fn test_empty_target_rejected() {
        let err = PolicyDocument::parse(
            r#"{"egress":[{"action":"allow","target":"a.com"},{"action":"deny","target":"  "}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::EmptyTarget { index: 1 }));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            PolicyDocument::parse("{\"egress\": [").unwrap_err(),
            PolicyError::Json(_)
        ));
    }

    #[test]
    fn test_target_classification() {
        let policy = PolicyDocument::parse(
            r#"{"egress":[
                {"action":"allow","target":"Example.COM."},
                {"action":"allow","target":"*.pypi.org"},
                {"action":"allow","target":"1.1.1.1"},
                {"action":"deny","target":"10.0.0.0/8"},
                {"action":"deny","target":"2001:db8::/32"}
            ]}"#,
        )
        .unwrap();

        let targets: Vec<_> = policy.rules().iter().map(|r| r.target.clone()).collect();
        assert_eq!(
            targets[0],
            Target::Domain(DomainPattern::Exact("example.com".into()))
        );
        assert_eq!(
            targets[1],
            Target::Domain(DomainPattern::Wildcard("pypi.org".into()))
        );
        assert!(matches!(targets[2], Target::Ipv4(net) if net.prefix() == 32));
        assert!(matches!(targets[3], Target::Ipv4(net) if net.prefix() == 8));
        assert!(matches!(targets[4], Target::Ipv6(net) if net.prefix() == 32));
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        for target in ["300.1.1.1", "10.0.0.0/33", "1..2", "2001:db8::zz", "example.com:443"] {
            let raw = format!(r#"{{"egress":[{{"action":"deny","target":"{}"}}]}}"#, target);
            let err = PolicyDocument::parse(&raw).unwrap_err();
            assert!(
                matches!(err, PolicyError::InvalidAddress { .. }),
                "target {:?} gave {:?}",
                target,
                err
            );
        }
    }

    #[test]
    fn test_unsupported_wildcards_rejected() {
        for target in ["*", "*.", "a.*.com", "*.*.com", "*example.com"] {
            let raw = format!(r#"{{"egress":[{{"action":"allow","target":"{}"}}]}}"#, target);
            let err = PolicyDocument::parse(&raw).unwrap_err();
            assert!(
                matches!(err, PolicyError::UnsupportedWildcard { .. }),
                "target {:?} gave {:?}",
                target,
                err
            );
        }
    }

    #[test]
    fn test_classify_targets_by_family_and_action() {
        let policy = PolicyDocument::parse(
            r#"{"egress":[
                {"action":"allow","target":"1.1.1.1"},
                {"action":"allow","target":"example.com"},
                {"action":"allow","target":"2.2.0.0/16"},
                {"action":"deny","target":"2001:db8::/32"},
                {"action":"deny","target":"2001:db8::1"}
            ]}"#,
        )
        .unwrap();

        let classified = policy.classify_targets();
        assert_eq!(classified.allow_v4, vec!["1.1.1.1", "2.2.0.0/16"]);
        assert_eq!(classified.deny_v6.len(), 2);
        assert!(classified.allow_v6.is_empty());
        assert!(classified.deny_v4.is_empty());
    }

    #[test]
    fn test_wildcard_matching() {
        let pattern = DomainPattern::Wildcard("example.com".into());
        assert!(pattern.matches("a.example.com"));
        assert!(pattern.matches("a.b.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("badexample.com"));
        assert!(!pattern.matches(".example.com"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"egress":[{{"action":"allow","target":"github.com"}}],"default_action":"deny"}}"#
        )
        .unwrap();

        let policy = PolicyDocument::load(file.path()).unwrap();
        assert_eq!(policy.rules().len(), 1);
        assert_eq!(policy.rules()[0].raw, "github.com");

        let missing = PolicyDocument::load(Path::new("/nonexistent/policy.json"));
        assert!(matches!(missing, Err(PolicyError::Io { .. })));
    }

    #[test]
    fn test_action_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Action::Allow).unwrap(), "\"allow\"");
        assert_eq!("deny".parse::<Action>().unwrap(), Action::Deny);
        assert!("Deny".parse::<Action>().is_err());
    }
}
