//! Passive subdomain enumeration via `subfinder -silent`.

use std::time::Duration;

use async_trait::async_trait;

use dsc_normalize::normalize_domain;

use crate::{AssetArtifact, AssetType, LineSink, ScanConfig, ScanResult, Scanner, ToolExec};

const TIMEOUT: Duration = Duration::from_secs(120);

pub struct SubfinderScanner {
    exec: ToolExec,
}

impl SubfinderScanner {
    pub fn new(exec: ToolExec) -> Self {
        Self { exec }
    }

    fn parse(result: &mut ScanResult, stdout: &str) {
        for line in stdout.lines() {
            let sub = line.trim();
            if sub.is_empty() {
                continue;
            }
            let normalized = normalize_domain(sub);
            if normalized.is_empty() {
                continue;
            }
            result
                .assets
                .push(AssetArtifact::new(AssetType::Subdomain, sub, normalized));
        }
    }
}

#[async_trait]
impl Scanner for SubfinderScanner {
    fn name(&self) -> &'static str {
        "subfinder"
    }

    async fn run(&self, target: &str, _config: &ScanConfig, stream: Option<LineSink>) -> ScanResult {
        let mut result = ScanResult::started(self.name(), target);

        let argv = ["subfinder", "-d", target, "-silent"];
        match self.exec.run(&argv, TIMEOUT, stream).await {
            Ok(out) if out.exit_code == 0 => {
                result.raw_output = out.stdout.clone();
                Self::parse(&mut result, &out.stdout);
                result.finish()
            }
            Ok(out) => {
                result.raw_output = out.stdout;
                result.fail(format!("subfinder exit {}: {}", out.exit_code, out.stderr.trim()))
            }
            Err(e) => result.fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_one_subdomain_per_line() {
        let mut r = ScanResult::started("subfinder", "acme.test");
        SubfinderScanner::parse(&mut r, "www.acme.test\n\nAPI.Acme.Test.\n");
        let norms: Vec<_> = r.assets.iter().map(|a| a.normalized.as_str()).collect();
        assert_eq!(norms, vec!["www.acme.test", "api.acme.test"]);
        assert!(r.assets.iter().all(|a| a.asset_type == AssetType::Subdomain));
    }
}
