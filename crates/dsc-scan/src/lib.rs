//! Scan adapter contract and the subprocess adapters behind it.
//!
//! Every external probe (subfinder, nmap, httpx, nuclei, the verifier's
//! synthetic probes) produces one [`ScanResult`]: a uniform bundle of raw
//! output plus normalized asset/service/edge artifacts and findings. The
//! inventory store consumes artifacts as-is; normalization happens here, at
//! the adapter boundary, never downstream.
//!
//! A probe that exits non-zero or times out yields `status = failed` with the
//! captured stderr; it never returns `Err`. Pipeline stages treat a failed
//! probe as an empty observation, not an abort.

pub mod exec;
pub mod httpx;
pub mod nmap;
pub mod nuclei;
pub mod subfinder;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use exec::ToolExec;
pub use httpx::HttpxScanner;
pub use nmap::NmapScanner;
pub use nuclei::NucleiScanner;
pub use subfinder::SubfinderScanner;

// ---------------------------------------------------------------------------
// Artifact vocabulary
// ---------------------------------------------------------------------------

/// Node kinds of the inventory graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Subdomain,
    Host,
    Ip,
    Url,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Subdomain => "subdomain",
            AssetType::Host => "host",
            AssetType::Ip => "ip",
            AssetType::Url => "url",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "subdomain" => Ok(AssetType::Subdomain),
            "host" => Ok(AssetType::Host),
            "ip" => Ok(AssetType::Ip),
            "url" => Ok(AssetType::Url),
            other => Err(anyhow::anyhow!("invalid asset type: {}", other)),
        }
    }
}

/// Transport protocol of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "tcp" => Ok(Proto::Tcp),
            "udp" => Ok(Proto::Udp),
            other => Err(anyhow::anyhow!("invalid proto: {}", other)),
        }
    }
}

/// Edge kinds of the inventory graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelType {
    ResolvesTo,
    CnameTo,
    Serves,
    RedirectsTo,
}

impl RelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelType::ResolvesTo => "resolves_to",
            RelType::CnameTo => "cname_to",
            RelType::Serves => "serves",
            RelType::RedirectsTo => "redirects_to",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "resolves_to" => Ok(RelType::ResolvesTo),
            "cname_to" => Ok(RelType::CnameTo),
            "serves" => Ok(RelType::Serves),
            "redirects_to" => Ok(RelType::RedirectsTo),
            other => Err(anyhow::anyhow!("invalid rel type: {}", other)),
        }
    }
}

/// One observed node. `normalized` is the dedup key, `value` the raw spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetArtifact {
    pub asset_type: AssetType,
    pub value: String,
    pub normalized: String,
}

impl AssetArtifact {
    pub fn new(asset_type: AssetType, value: impl Into<String>, normalized: impl Into<String>) -> Self {
        Self {
            asset_type,
            value: value.into(),
            normalized: normalized.into(),
        }
    }
}

/// One observed open service, keyed by its host artifact plus `(port, proto)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceArtifact {
    pub host_type: AssetType,
    pub host_value: String,
    pub host_normalized: String,
    pub port: u16,
    pub proto: Proto,
    pub name: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

/// One observed relationship between two node artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeArtifact {
    pub from_type: AssetType,
    pub from_value: String,
    pub from_normalized: String,
    pub to_type: AssetType,
    pub to_value: String,
    pub to_normalized: String,
    pub rel_type: RelType,
}

/// A security observation. Opaque to the lifecycle machine; persisted for
/// consumers.
#[derive(Debug, Clone, Default)]
pub struct FindingArtifact {
    pub severity: String,
    pub title: String,
    pub description: String,
    pub evidence: String,
    pub remediation: String,
    pub url: String,
    pub cve: String,
    pub cvss_score: f64,
}

// ---------------------------------------------------------------------------
// ScanResult
// ---------------------------------------------------------------------------

/// Terminal status of one probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Failed,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Completed => "completed",
            ScanOutcome::Failed => "failed",
        }
    }
}

/// Uniform result bundle produced by every adapter.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub scanner: String,
    pub target: String,
    pub status: ScanOutcome,
    pub raw_output: String,
    pub findings: Vec<FindingArtifact>,
    pub assets: Vec<AssetArtifact>,
    pub services: Vec<ServiceArtifact>,
    pub edges: Vec<EdgeArtifact>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanResult {
    pub fn started(scanner: &str, target: &str) -> Self {
        Self {
            scanner: scanner.to_string(),
            target: target.to_string(),
            status: ScanOutcome::Completed,
            raw_output: String::new(),
            findings: Vec::new(),
            assets: Vec::new(),
            services: Vec::new(),
            edges: Vec::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark failed with the captured error, preserving any partial output.
    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = ScanOutcome::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn finish(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }
}

// ---------------------------------------------------------------------------
// Scanner trait
// ---------------------------------------------------------------------------

/// Per-invocation adapter configuration. Adapters read the fields they
/// understand and ignore the rest.
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// Explicit target list (httpx / nuclei batches). Empty means "use the
    /// single `target` argument".
    pub targets: Vec<String>,
    /// Port expression for port scans (e.g. `"80,443,8080"`).
    pub ports: Option<String>,
}

/// Optional per-line observer for raw tool output. The core neither caches
/// nor replays the stream.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Uniform probe interface. Implementations are object-safe so the pipeline
/// holds `Box<dyn Scanner>` per stage.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Execute the probe. Failures are encoded in the returned
    /// `ScanResult::status`, never as `Err`.
    async fn run(&self, target: &str, config: &ScanConfig, stream: Option<LineSink>) -> ScanResult;
}
