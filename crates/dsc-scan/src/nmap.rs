//! Service discovery via `nmap` greppable output (`-oG -`).
//!
//! Greppable lines look like:
//!
//! ```text
//! Host: 1.2.3.4 (www.acme.test)	Ports: 80/open/tcp//http//nginx 1.25.3/, 443/open/tcp//https//nginx 1.25.3/	Ignored State: closed (998)
//! ```
//!
//! Only `open` ports become service artifacts. The host itself is emitted as
//! an `ip`/`host` asset so the ingest step can attach services to it.

use std::time::Duration;

use async_trait::async_trait;

use dsc_normalize::{guess_asset_type_from_host, normalize_domain, HostKind};

use crate::{
    AssetArtifact, AssetType, FindingArtifact, LineSink, Proto, ScanConfig, ScanResult, Scanner,
    ServiceArtifact, ToolExec,
};

const TIMEOUT: Duration = Duration::from_secs(600);

pub struct NmapScanner {
    exec: ToolExec,
}

impl NmapScanner {
    pub fn new(exec: ToolExec) -> Self {
        Self { exec }
    }

    fn parse(result: &mut ScanResult, stdout: &str) {
        for line in stdout.lines() {
            let Some(host_raw) = field(line, "Host: ") else {
                continue;
            };
            let Some(ports_raw) = field(line, "Ports: ") else {
                continue;
            };

            let addr = host_raw.split_whitespace().next().unwrap_or("");
            let host_norm = normalize_domain(addr);
            if host_norm.is_empty() {
                continue;
            }
            let host_type = match guess_asset_type_from_host(&host_norm) {
                HostKind::Ip => AssetType::Ip,
                HostKind::Host => AssetType::Host,
            };
            result
                .assets
                .push(AssetArtifact::new(host_type, addr, host_norm.clone()));

            for spec in ports_raw.split(',') {
                let Some(svc) = parse_port_spec(spec.trim(), host_type, addr, &host_norm) else {
                    continue;
                };
                result.findings.push(FindingArtifact {
                    severity: "info".to_string(),
                    title: format!(
                        "Open port {}/{} - {}",
                        svc.port,
                        svc.proto.as_str(),
                        svc.name.as_deref().unwrap_or("unknown")
                    ),
                    url: format!("{}:{}", host_norm, svc.port),
                    ..Default::default()
                });
                result.services.push(svc);
            }
        }
    }
}

/// `80/open/tcp//http//nginx 1.25.3/` → a service artifact, or `None` for
/// non-open states and malformed specs.
fn parse_port_spec(
    spec: &str,
    host_type: AssetType,
    host_value: &str,
    host_normalized: &str,
) -> Option<ServiceArtifact> {
    let parts: Vec<&str> = spec.split('/').collect();
    if parts.len() < 3 || parts[1] != "open" {
        return None;
    }

    let port: u16 = parts[0].trim().parse().ok()?;
    let proto = Proto::parse(parts[2]).ok()?;
    let name = parts.get(4).map(|s| s.trim()).filter(|s| !s.is_empty());
    let product_version = parts.get(6).map(|s| s.trim()).filter(|s| !s.is_empty());

    // nmap packs "product version" into one field; split on the last space
    // when the tail looks like a version number.
    let (product, version) = match product_version {
        Some(pv) => match pv.rsplit_once(' ') {
            Some((p, v)) if v.chars().next().is_some_and(|c| c.is_ascii_digit()) => {
                (Some(p.to_string()), Some(v.to_string()))
            }
            _ => (Some(pv.to_string()), None),
        },
        None => (None, None),
    };

    Some(ServiceArtifact {
        host_type,
        host_value: host_value.to_string(),
        host_normalized: host_normalized.to_string(),
        port,
        proto,
        name: name.map(|s| s.to_string()),
        product,
        version,
    })
}

fn field<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let start = line.find(tag)? + tag.len();
    let rest = &line[start..];
    Some(rest.split('\t').next().unwrap_or(rest).trim())
}

#[async_trait]
impl Scanner for NmapScanner {
    fn name(&self) -> &'static str {
        "nmap"
    }

    async fn run(&self, target: &str, config: &ScanConfig, stream: Option<LineSink>) -> ScanResult {
        let mut result = ScanResult::started(self.name(), target);

        let mut argv: Vec<&str> = vec!["nmap", "-sV", "-T4"];
        if let Some(ports) = config.ports.as_deref() {
            argv.push("-p");
            argv.push(ports);
        }
        argv.extend(["-oG", "-", target]);

        match self.exec.run(&argv, TIMEOUT, stream).await {
            Ok(out) if out.exit_code == 0 => {
                result.raw_output = out.stdout.clone();
                Self::parse(&mut result, &out.stdout);
                result.finish()
            }
            Ok(out) => {
                result.raw_output = out.stdout;
                result.fail(format!("nmap exit {}: {}", out.exit_code, out.stderr.trim()))
            }
            Err(e) => result.fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "Host: 1.2.3.4 (www.acme.test)\tPorts: 80/open/tcp//http//nginx 1.25.3/, 22/closed/tcp//ssh///, 443/open/tcp//https//nginx 1.25.3/\tIgnored State: filtered (997)";

    #[test]
    fn parses_open_ports_only() {
        let mut r = ScanResult::started("nmap", "1.2.3.4");
        NmapScanner::parse(&mut r, LINE);

        assert_eq!(r.assets.len(), 1);
        assert_eq!(r.assets[0].asset_type, AssetType::Ip);
        assert_eq!(r.assets[0].normalized, "1.2.3.4");

        let ports: Vec<u16> = r.services.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![80, 443]);
        assert_eq!(r.services[0].name.as_deref(), Some("http"));
        assert_eq!(r.services[0].product.as_deref(), Some("nginx"));
        assert_eq!(r.services[0].version.as_deref(), Some("1.25.3"));
    }

    #[test]
    fn hostname_target_yields_host_asset() {
        let line = "Host: www.acme.test ()\tPorts: 8080/open/tcp//http-proxy///";
        let mut r = ScanResult::started("nmap", "www.acme.test");
        NmapScanner::parse(&mut r, line);
        assert_eq!(r.assets[0].asset_type, AssetType::Host);
        assert_eq!(r.services[0].port, 8080);
        assert_eq!(r.services[0].product, None);
    }

    #[test]
    fn non_port_lines_are_ignored() {
        let mut r = ScanResult::started("nmap", "1.2.3.4");
        NmapScanner::parse(&mut r, "# Nmap 7.94 scan initiated\nHost: 1.2.3.4 ()\tStatus: Up");
        assert!(r.services.is_empty());
        assert!(r.assets.is_empty());
    }
}
