//! Vulnerability probing via `nuclei -jsonl` over a URL batch.
//!
//! Each matched template line becomes a finding; the matched URL is also
//! emitted as a `url` asset when it normalizes, so findings can be linked to
//! inventory rows downstream.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use dsc_normalize::normalize_url;

use crate::{
    AssetArtifact, AssetType, FindingArtifact, LineSink, ScanConfig, ScanResult, Scanner, ToolExec,
};

const TIMEOUT: Duration = Duration::from_secs(600);

const KNOWN_SEVERITIES: [&str; 5] = ["critical", "high", "medium", "low", "info"];

pub struct NucleiScanner {
    exec: ToolExec,
}

impl NucleiScanner {
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
            let Some(template_id) = data.get("template-id").and_then(Value::as_str) else {
                // Stats lines carry no template-id.
                continue;
            };

            let info = data.get("info").cloned().unwrap_or(Value::Null);
            let severity_raw = info
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_ascii_lowercase();
            let severity = if KNOWN_SEVERITIES.contains(&severity_raw.as_str()) {
                severity_raw
            } else {
                "info".to_string()
            };

            let matched_at = data
                .get("matched-at")
                .and_then(Value::as_str)
                .or_else(|| data.get("host").and_then(Value::as_str))
                .unwrap_or("");
            let name = info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(template_id);
            let description = info
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let remediation = info
                .get("remediation")
                .and_then(Value::as_str)
                .unwrap_or("");
            let cve = info
                .get("classification")
                .and_then(|c| c.get("cve-id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let cvss = info
                .get("classification")
                .and_then(|c| c.get("cvss-score"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            result.findings.push(FindingArtifact {
                severity,
                title: format!("{name} [{template_id}]"),
                description: description.to_string(),
                evidence: data
                    .get("extracted-results")
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                remediation: remediation.to_string(),
                url: matched_at.to_string(),
                cve: cve.to_string(),
                cvss_score: cvss,
            });

            let url_norm = normalize_url(matched_at);
            if !url_norm.is_empty() {
                result
                    .assets
                    .push(AssetArtifact::new(AssetType::Url, matched_at, url_norm));
            }
        }
    }
}

#[async_trait]
impl Scanner for NucleiScanner {
    fn name(&self) -> &'static str {
        "nuclei"
    }

    async fn run(&self, target: &str, config: &ScanConfig, stream: Option<LineSink>) -> ScanResult {
        let mut result = ScanResult::started(self.name(), target);

        let targets: Vec<&str> = if config.targets.is_empty() {
            vec![target]
        } else {
            config.targets.iter().map(String::as_str).collect()
        };
        let joined = targets.join(",");

        let argv = ["nuclei", "-jsonl", "-silent", "-u", joined.as_str()];

        match self.exec.run(&argv, TIMEOUT, stream).await {
            Ok(out) if out.exit_code == 0 => {
                result.raw_output = out.stdout.clone();
                Self::parse(&mut result, &out.stdout);
                result.finish()
            }
            Ok(out) => {
                result.raw_output = out.stdout;
                result.fail(format!("nuclei exit {}: {}", out.exit_code, out.stderr.trim()))
            }
            Err(e) => result.fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_finding_and_url_asset() {
        let line = r#"{"template-id":"tech-detect","info":{"name":"Tech Detect","severity":"low"},"matched-at":"http://www.acme.test/login"}"#;
        let mut r = ScanResult::started("nuclei", "acme.test");
        NucleiScanner::parse(&mut r, line);

        assert_eq!(r.findings.len(), 1);
        assert_eq!(r.findings[0].severity, "low");
        assert_eq!(r.findings[0].title, "Tech Detect [tech-detect]");
        assert_eq!(r.findings[0].url, "http://www.acme.test/login");

        assert_eq!(r.assets.len(), 1);
        assert_eq!(r.assets[0].normalized, "http://www.acme.test/login");
    }

    #[test]
    fn stats_lines_are_skipped() {
        let mut r = ScanResult::started("nuclei", "acme.test");
        NucleiScanner::parse(&mut r, r#"{"percent":42,"requests":100}"#);
        assert!(r.findings.is_empty());
    }

    #[test]
    fn unknown_severity_downgrades_to_info() {
        let line = r#"{"template-id":"x","info":{"severity":"weird"},"matched-at":"http://a.test/"}"#;
        let mut r = ScanResult::started("nuclei", "acme.test");
        NucleiScanner::parse(&mut r, line);
        assert_eq!(r.findings[0].severity, "info");
    }
}
