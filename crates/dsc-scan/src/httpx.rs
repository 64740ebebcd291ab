//! Live-URL probing via `httpx -json -silent`.
//!
//! Each JSONL line describing a responsive URL becomes a `url` asset, its
//! host becomes a `host`/`ip` asset, and a `serves` edge ties them together.
//! Lines that are not valid JSON are skipped; httpx interleaves warnings on
//! stdout in some configurations.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use dsc_normalize::{guess_asset_type_from_host, normalize_domain, normalize_url, HostKind};

use crate::{
    AssetArtifact, AssetType, EdgeArtifact, LineSink, RelType, ScanConfig, ScanResult, Scanner,
    ToolExec,
};

const TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpxScanner {
    exec: ToolExec,
}

impl HttpxScanner {
    pub fn new(exec: ToolExec) -> Self {
        Self { exec }
    }

    fn parse(result: &mut ScanResult, stdout: &str) {
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(data) = serde_json::from_str::<Value>(line) else {
                continue;
            };

            let url_raw = data
                .get("url")
                .and_then(Value::as_str)
                .or_else(|| data.get("input").and_then(Value::as_str))
                .unwrap_or("");
            let url_norm = normalize_url(url_raw);
            if url_norm.is_empty() {
                continue;
            }

            result
                .assets
                .push(AssetArtifact::new(AssetType::Url, url_raw, url_norm.clone()));

            let Some(host) = Url::parse(&url_norm)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
            else {
                continue;
            };
            let host_norm = normalize_domain(&host);
            if host_norm.is_empty() {
                continue;
            }
            let host_type = match guess_asset_type_from_host(&host_norm) {
                HostKind::Ip => AssetType::Ip,
                HostKind::Host => AssetType::Host,
            };

            result
                .assets
                .push(AssetArtifact::new(host_type, host.clone(), host_norm.clone()));
            result.edges.push(EdgeArtifact {
                from_type: host_type,
                from_value: host,
                from_normalized: host_norm,
                to_type: AssetType::Url,
                to_value: url_raw.to_string(),
                to_normalized: url_norm,
                rel_type: RelType::Serves,
            });
        }
    }
}

#[async_trait]
impl Scanner for HttpxScanner {
    fn name(&self) -> &'static str {
        "httpx"
    }

    async fn run(&self, target: &str, config: &ScanConfig, stream: Option<LineSink>) -> ScanResult {
        let mut result = ScanResult::started(self.name(), target);

        let targets: Vec<&str> = if config.targets.is_empty() {
            vec![target]
        } else {
            config.targets.iter().map(String::as_str).collect()
        };
        let joined = targets.join(",");

        let argv = [
            "httpx",
            "-json",
            "-silent",
            "-status-code",
            "-title",
            "-tech-detect",
            "-follow-redirects",
            "-web-server",
            "-u",
            joined.as_str(),
        ];

        match self.exec.run(&argv, TIMEOUT, stream).await {
            Ok(out) if out.exit_code == 0 => {
                result.raw_output = out.stdout.clone();
                Self::parse(&mut result, &out.stdout);
                result.finish()
            }
            Ok(out) => {
                result.raw_output = out.stdout;
                result.fail(format!("httpx exit {}: {}", out.exit_code, out.stderr.trim()))
            }
            Err(e) => result.fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_url_host_and_serves_edge() {
        let mut r = ScanResult::started("httpx", "acme.test");
        let line = r#"{"url":"http://www.acme.test","status_code":200,"tech":["Nginx"]}"#;
        HttpxScanner::parse(&mut r, line);

        assert_eq!(r.assets.len(), 2);
        assert_eq!(r.assets[0].asset_type, AssetType::Url);
        assert_eq!(r.assets[0].normalized, "http://www.acme.test/");
        assert_eq!(r.assets[1].asset_type, AssetType::Host);
        assert_eq!(r.assets[1].normalized, "www.acme.test");

        assert_eq!(r.edges.len(), 1);
        assert_eq!(r.edges[0].rel_type, RelType::Serves);
        assert_eq!(r.edges[0].from_normalized, "www.acme.test");
        assert_eq!(r.edges[0].to_normalized, "http://www.acme.test/");
    }

    #[test]
    fn skips_non_json_lines() {
        let mut r = ScanResult::started("httpx", "acme.test");
        HttpxScanner::parse(&mut r, "some warning\n{\"url\":\"https://a.acme.test:8443\"}");
        assert_eq!(r.assets.len(), 2);
        assert_eq!(r.assets[0].normalized, "https://a.acme.test:8443/");
    }

    #[test]
    fn ip_hosts_yield_ip_assets() {
        let mut r = ScanResult::started("httpx", "acme.test");
        HttpxScanner::parse(&mut r, "{\"url\":\"http://1.2.3.4:8080\"}");
        assert_eq!(r.assets[1].asset_type, AssetType::Ip);
        assert_eq!(r.edges[0].from_type, AssetType::Ip);
    }
}
