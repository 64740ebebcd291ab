//! Scope policy: which domains, IPs, and URLs a target is permitted to probe.
//!
//! Every target carries a scope record (stored as `jsonb` on the row). The
//! pipeline and the agent-facing trigger surface consult this module before
//! any external probe is invoked; an out-of-scope request is a well-formed
//! error, never a probe.
//!
//! Matching rules:
//! - domains match `allowed_domains` entries as case-insensitive shell globs
//! - IPs match when `allowed_cidrs` is empty (discovered from in-scope
//!   domains) or when contained in any listed CIDR
//! - URLs match an `allowed_url_prefixes` entry, else fall back to the
//!   domain/IP check on their host

use std::net::IpAddr;

use globset::{GlobBuilder, GlobMatcher};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Scope policy record for one target.
///
/// `parse_scope` applies the defaults; deserializing this struct directly
/// from a target's raw `scope` JSON leaves the domain allow-list empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    #[serde(default)]
    pub root_domain: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    #[serde(default)]
    pub allowed_url_prefixes: Vec<String>,
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default = "default_max_http_targets")]
    pub max_http_targets: usize,
    /// Per-target running-job cap; `None` falls back to the global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<i64>,
}

fn default_max_hosts() -> usize {
    50
}

fn default_max_http_targets() -> usize {
    200
}

/// Kind of value being checked against scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Domain,
    Ip,
    Url,
}

/// Build a `ScopeConfig` from a target's scope JSON, applying defaults.
///
/// Defaults: `allowed_domains = [root_domain, "*.<root_domain>"]` when the
/// record does not list any.
pub fn parse_scope(scope_json: Option<&Value>, root_domain: &str) -> ScopeConfig {
    let mut cfg: ScopeConfig = scope_json
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(ScopeConfig {
            root_domain: root_domain.to_string(),
            allowed_domains: Vec::new(),
            allowed_cidrs: Vec::new(),
            allowed_url_prefixes: Vec::new(),
            max_hosts: default_max_hosts(),
            max_http_targets: default_max_http_targets(),
            max_concurrent_jobs: None,
        });

    if cfg.root_domain.is_empty() {
        cfg.root_domain = root_domain.to_string();
    }
    if cfg.allowed_domains.is_empty() {
        cfg.allowed_domains = vec![
            cfg.root_domain.clone(),
            format!("*.{}", cfg.root_domain),
        ];
    }
    cfg
}

/// True iff `domain` matches any `allowed_domains` entry as a shell glob.
pub fn domain_in_scope(scope: &ScopeConfig, domain: &str) -> bool {
    let d = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    scope
        .allowed_domains
        .iter()
        .filter_map(|p| glob_for(p))
        .any(|m| m.is_match(&d))
}

/// True iff `allowed_cidrs` is empty or `ip` is contained in any CIDR.
pub fn ip_in_scope(scope: &ScopeConfig, ip: &str) -> bool {
    if scope.allowed_cidrs.is_empty() {
        return true;
    }
    let addr: IpAddr = match ip.trim().parse() {
        Ok(a) => a,
        Err(_) => return false,
    };
    scope
        .allowed_cidrs
        .iter()
        .filter_map(|c| c.parse::<IpNetwork>().ok())
        .any(|net| net.contains(addr))
}

/// True iff `url` starts with an allowed prefix, or its host passes the
/// domain/IP check.
pub fn url_in_scope(scope: &ScopeConfig, url: &str) -> bool {
    if scope
        .allowed_url_prefixes
        .iter()
        .any(|p| !p.is_empty() && url.starts_with(p.as_str()))
    {
        return true;
    }
    let host = match Url::parse(url) {
        Ok(u) => u.host_str().map(unbracket_owned).unwrap_or_default(),
        Err(_) => return false,
    };
    if host.parse::<IpAddr>().is_ok() {
        ip_in_scope(scope, &host)
    } else {
        domain_in_scope(scope, &host)
    }
}

/// Unified check used by the pipeline and the trigger surface.
pub fn in_scope(scope: &ScopeConfig, value: &str, kind: ScopeKind) -> bool {
    match kind {
        ScopeKind::Domain => domain_in_scope(scope, value),
        ScopeKind::Ip => ip_in_scope(scope, value),
        ScopeKind::Url => url_in_scope(scope, value),
    }
}

fn glob_for(pattern: &str) -> Option<GlobMatcher> {
    let p = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    GlobBuilder::new(&p)
        .literal_separator(false)
        .build()
        .ok()
        .map(|g| g.compile_matcher())
}

fn unbracket_owned(host: &str) -> String {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(v: Value) -> ScopeConfig {
        parse_scope(Some(&v), "acme.test")
    }

    #[test]
    fn defaults_allow_root_and_wildcard_subdomains() {
        let s = parse_scope(None, "acme.test");
        assert_eq!(s.allowed_domains, vec!["acme.test", "*.acme.test"]);
        assert!(domain_in_scope(&s, "acme.test"));
        assert!(domain_in_scope(&s, "www.acme.test"));
        assert!(domain_in_scope(&s, "a.b.acme.test"));
        assert!(!domain_in_scope(&s, "evil.test"));
        assert!(!domain_in_scope(&s, "acme.test.evil.test"));
    }

    #[test]
    fn domain_match_is_case_insensitive_and_dot_tolerant() {
        let s = parse_scope(None, "acme.test");
        assert!(domain_in_scope(&s, "WWW.ACME.TEST."));
    }

    #[test]
    fn explicit_allowed_domains_replace_defaults() {
        let s = scope(json!({"root_domain": "acme.test", "allowed_domains": ["acme.test"]}));
        assert!(domain_in_scope(&s, "acme.test"));
        assert!(!domain_in_scope(&s, "www.acme.test"));
    }

    #[test]
    fn empty_cidrs_allow_all_ips() {
        let s = parse_scope(None, "acme.test");
        assert!(ip_in_scope(&s, "1.2.3.4"));
        assert!(ip_in_scope(&s, "2001:db8::1"));
    }

    #[test]
    fn cidr_containment() {
        let s = scope(json!({"root_domain": "acme.test", "allowed_cidrs": ["10.0.0.0/8"]}));
        assert!(ip_in_scope(&s, "10.1.2.3"));
        assert!(!ip_in_scope(&s, "192.168.0.1"));
        assert!(!ip_in_scope(&s, "not-an-ip"));
    }

    #[test]
    fn url_prefix_allowlist_wins() {
        let s = scope(json!({
            "root_domain": "acme.test",
            "allowed_domains": ["never.test"],
            "allowed_url_prefixes": ["https://portal.other.test/app"]
        }));
        assert!(url_in_scope(&s, "https://portal.other.test/app/login"));
        assert!(!url_in_scope(&s, "https://portal.other.test/admin"));
    }

    #[test]
    fn url_falls_back_to_host_check() {
        let s = parse_scope(None, "acme.test");
        assert!(url_in_scope(&s, "http://www.acme.test/"));
        assert!(!url_in_scope(&s, "http://evil.test/"));
        assert!(!url_in_scope(&s, "not a url"));
    }

    #[test]
    fn url_with_ip_host_uses_cidr_check() {
        let s = scope(json!({"root_domain": "acme.test", "allowed_cidrs": ["10.0.0.0/8"]}));
        assert!(url_in_scope(&s, "http://10.1.2.3:8080/"));
        assert!(!url_in_scope(&s, "http://192.168.0.1/"));
    }

    #[test]
    fn per_target_job_cap_is_optional() {
        let s = scope(json!({"root_domain": "acme.test", "max_concurrent_jobs": 1}));
        assert_eq!(s.max_concurrent_jobs, Some(1));
        assert_eq!(parse_scope(None, "acme.test").max_concurrent_jobs, None);
    }
}
