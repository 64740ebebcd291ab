//! Canonical forms for domains, URLs, and IP literals.
//!
//! The normalized string produced here is the sole deduplication key for the
//! inventory graph: two observations with equal normalized forms are the same
//! artifact, whatever raw spelling a scanner emitted. The raw spelling is
//! preserved separately for display.
//!
//! This module does **not**:
//! - touch the database
//! - decide asset lifecycle (that is the inventory store)
//! - enforce scope (that is `dsc-scope`)
//!
//! All functions are pure and total: bad input yields an empty string, never
//! an error.

use std::net::IpAddr;

use url::Url;

/// Asset kind guessed from a bare host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    Ip,
    Host,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Ip => "ip",
            HostKind::Host => "host",
        }
    }
}

/// True iff `value` parses as an IPv4 or IPv6 literal.
pub fn is_ip(value: &str) -> bool {
    value.trim().parse::<IpAddr>().is_ok()
}

/// Canonical lower-case domain form.
///
/// Strips a surrounding scheme, any path, any port, IPv6 brackets, and a
/// trailing dot. Empty input (or input with no extractable host) yields `""`.
pub fn normalize_domain(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }

    let host = if v.contains("://") {
        match Url::parse(v) {
            Ok(u) => u.host_str().unwrap_or("").to_string(),
            Err(_) => String::new(),
        }
    } else {
        let mut h = v.split('/').next().unwrap_or("").to_string();
        if let Some(rest) = h.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                h = rest[..end].to_string();
            }
        }
        // host:port, but leave bare IPv6 (multiple colons) alone.
        if h.matches(':').count() == 1 {
            h = h.split(':').next().unwrap_or("").to_string();
        }
        h
    };

    unbracket(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Canonical URL form: `scheme://host[:port]/path`.
///
/// A bare host is interpreted as `http://`. Default ports (80/http, 443/https)
/// are dropped, query and fragment are discarded, and a trailing `/` on a
/// non-root path is collapsed. Unparseable input yields `""`.
pub fn normalize_url(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }

    let candidate = if v.contains("://") {
        v.to_string()
    } else {
        format!("http://{v}")
    };

    let parsed = match Url::parse(&candidate) {
        Ok(u) => u,
        Err(_) => return String::new(),
    };

    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = match parsed.host_str() {
        Some(h) => h.to_ascii_lowercase(),
        None => return String::new(),
    };

    // `Url` already drops the default port for http/https during parsing.
    let port = match parsed.port() {
        Some(p) => format!(":{p}"),
        None => String::new(),
    };

    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path = "/".to_string();
    }
    if path != "/" && path.ends_with('/') {
        path.pop();
    }

    format!("{scheme}://{host}{port}{path}")
}

/// `ip` for IP literals, `host` for anything else.
pub fn guess_asset_type_from_host(host: &str) -> HostKind {
    let h = normalize_domain(host);
    if is_ip(&h) {
        HostKind::Ip
    } else {
        HostKind::Host
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- normalize_domain ---

    #[test]
    fn domain_lowercases_and_strips_trailing_dot() {
        assert_eq!(normalize_domain("WWW.Example.COM."), "www.example.com");
    }

    #[test]
    fn domain_strips_scheme_path_and_port() {
        assert_eq!(
            normalize_domain("https://api.example.com:8443/v1/users"),
            "api.example.com"
        );
        assert_eq!(normalize_domain("example.com/login"), "example.com");
        assert_eq!(normalize_domain("example.com:8080"), "example.com");
    }

    #[test]
    fn domain_unbrackets_ipv6() {
        assert_eq!(normalize_domain("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(normalize_domain("[2001:db8::1]/path"), "2001:db8::1");
        assert_eq!(normalize_domain("http://[2001:db8::1]:8080/"), "2001:db8::1");
    }

    #[test]
    fn domain_leaves_bare_ipv6_alone() {
        assert_eq!(normalize_domain("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn domain_empty_input_is_empty() {
        assert_eq!(normalize_domain(""), "");
        assert_eq!(normalize_domain("   "), "");
    }

    #[test]
    fn domain_is_idempotent() {
        for s in ["WWW.Example.COM.", "https://a.b.c:443/x", "[::1]:80"] {
            let once = normalize_domain(s);
            assert_eq!(normalize_domain(&once), once);
        }
    }

    // --- normalize_url ---

    #[test]
    fn url_assumes_http_for_bare_host() {
        assert_eq!(normalize_url("example.com"), "http://example.com/");
    }

    #[test]
    fn url_drops_default_ports() {
        assert_eq!(normalize_url("http://example.com:80/"), "http://example.com/");
        assert_eq!(
            normalize_url("https://example.com:443/login"),
            "https://example.com/login"
        );
    }

    #[test]
    fn url_keeps_non_default_ports() {
        assert_eq!(
            normalize_url("https://example.com:8443"),
            "https://example.com:8443/"
        );
    }

    #[test]
    fn url_drops_query_and_fragment() {
        assert_eq!(
            normalize_url("http://example.com/a?b=1#frag"),
            "http://example.com/a"
        );
    }

    #[test]
    fn url_collapses_trailing_slash_on_non_root_path() {
        assert_eq!(normalize_url("http://example.com/a/"), "http://example.com/a");
        assert_eq!(normalize_url("http://example.com/"), "http://example.com/");
    }

    #[test]
    fn url_lowercases_host_not_path() {
        assert_eq!(
            normalize_url("HTTP://EXAMPLE.com/Login"),
            "http://example.com/Login"
        );
    }

    #[test]
    fn url_is_idempotent() {
        for s in [
            "example.com",
            "HTTPS://Example.com:443/a/?q=1",
            "http://example.com:8080/x/",
        ] {
            let once = normalize_url(s);
            assert_eq!(normalize_url(&once), once);
        }
    }

    #[test]
    fn url_garbage_is_empty() {
        assert_eq!(normalize_url("http://"), "");
        assert_eq!(normalize_url(""), "");
    }

    // --- is_ip / guess_asset_type_from_host ---

    #[test]
    fn ip_literals() {
        assert!(is_ip("1.2.3.4"));
        assert!(is_ip("2001:db8::1"));
        assert!(!is_ip("example.com"));
        assert!(!is_ip(""));
    }

    #[test]
    fn host_kind_guess() {
        assert_eq!(guess_asset_type_from_host("1.2.3.4"), HostKind::Ip);
        assert_eq!(guess_asset_type_from_host("[2001:db8::1]"), HostKind::Ip);
        assert_eq!(guess_asset_type_from_host("www.example.com"), HostKind::Host);
    }
}
