//! Bounded-concurrency A/AAAA resolution.
//!
//! One resolver instance is shared by the pipeline (stage 2) and the
//! verifier. Resolution of a batch preserves input order, dedupes addresses
//! per name in insertion order, and classifies failures into a small taxonomy
//! the inventory store records as `status_reason`.
//!
//! This module does **not** write to the database or consult scope; callers
//! filter names before resolving.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Semaphore;

/// Per-query timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-name ceiling across A + AAAA.
const LIFETIME: Duration = Duration::from_secs(3);

pub const DEFAULT_CONCURRENCY: usize = 50;

/// Why a name yielded no addresses.
///
/// `NoAnswer` is distinct from `Nxdomain`: the name exists but has no A/AAAA
/// records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    Nxdomain,
    Timeout,
    NoAnswer,
    Other(String),
}

impl DnsError {
    /// Stable code recorded as `status_reason` on unresolved assets.
    pub fn code(&self) -> String {
        match self {
            DnsError::Nxdomain => "NXDOMAIN".to_string(),
            DnsError::Timeout => "TIMEOUT".to_string(),
            DnsError::NoAnswer => "NO_ANSWER".to_string(),
            DnsError::Other(msg) => msg.clone(),
        }
    }
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

/// Outcome for one name. `ips` is empty iff `error` is set.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub name: String,
    pub ips: Vec<String>,
    pub error: Option<DnsError>,
}

/// Resolution seam: the pipeline and the verifier program against this
/// trait so tests can substitute a scripted resolver.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Batch resolution preserving input order; returns only when every
    /// name has settled.
    async fn resolve_many(&self, names: &[String], concurrency: usize)
        -> Result<Vec<ResolveOutcome>>;

    /// Single-name resolution.
    async fn resolve_one(&self, name: &str) -> ResolveOutcome;
}

/// Shared DNS resolver handle (cheap to clone).
#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<TokioAsyncResolver>,
}

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve_many(
        &self,
        names: &[String],
        concurrency: usize,
    ) -> Result<Vec<ResolveOutcome>> {
        DnsResolver::resolve_many(self, names, concurrency).await
    }

    async fn resolve_one(&self, name: &str) -> ResolveOutcome {
        DnsResolver::resolve_one(self, name).await
    }
}

impl DnsResolver {
    /// System resolv.conf when available, public recursors otherwise.
    pub fn from_system_or_default() -> Result<Self> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), Self::opts()),
        };
        Ok(Self {
            inner: Arc::new(resolver),
        })
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        Self {
            inner: Arc::new(TokioAsyncResolver::tokio(config, Self::opts())),
        }
    }

    fn opts() -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.timeout = QUERY_TIMEOUT;
        opts.attempts = 1;
        opts
    }

    /// Resolve a batch of names with at most `concurrency` in flight.
    ///
    /// Output order matches input order; the call returns only when every
    /// name has resolved or errored.
    pub async fn resolve_many(
        &self,
        names: &[String],
        concurrency: usize,
    ) -> Result<Vec<ResolveOutcome>> {
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));

        let futures = names
            .iter()
            .filter(|n| !n.is_empty())
            .map(|name| {
                let sem = Arc::clone(&sem);
                let this = self.clone();
                let name = name.clone();
                async move {
                    let _permit = sem
                        .acquire_owned()
                        .await
                        .context("resolver semaphore closed")?;
                    Ok::<ResolveOutcome, anyhow::Error>(this.resolve_one(&name).await)
                }
            })
            .collect::<Vec<_>>();

        join_all(futures).await.into_iter().collect()
    }

    /// Resolve a single name: A then AAAA, deduped in insertion order.
    pub async fn resolve_one(&self, name: &str) -> ResolveOutcome {
        match tokio::time::timeout(LIFETIME, self.lookup_both(name)).await {
            Ok(outcome) => outcome,
            Err(_) => ResolveOutcome {
                name: name.to_string(),
                ips: Vec::new(),
                error: Some(DnsError::Timeout),
            },
        }
    }

    async fn lookup_both(&self, name: &str) -> ResolveOutcome {
        let mut ips: Vec<String> = Vec::new();

        match self.inner.ipv4_lookup(name).await {
            Ok(lookup) => {
                for a in lookup.iter() {
                    push_deduped(&mut ips, a.to_string());
                }
            }
            Err(err) => match classify(&err) {
                // Name exists but has no A records; AAAA may still answer.
                DnsError::NoAnswer => {}
                other => {
                    return ResolveOutcome {
                        name: name.to_string(),
                        ips: Vec::new(),
                        error: Some(other),
                    }
                }
            },
        }

        match self.inner.ipv6_lookup(name).await {
            Ok(lookup) => {
                for aaaa in lookup.iter() {
                    push_deduped(&mut ips, aaaa.to_string());
                }
            }
            Err(err) => match classify(&err) {
                DnsError::NoAnswer => {}
                other => {
                    if ips.is_empty() {
                        return ResolveOutcome {
                            name: name.to_string(),
                            ips: Vec::new(),
                            error: Some(other),
                        };
                    }
                }
            },
        }

        let error = if ips.is_empty() {
            Some(DnsError::NoAnswer)
        } else {
            None
        };
        ResolveOutcome {
            name: name.to_string(),
            ips,
            error,
        }
    }
}

fn push_deduped(ips: &mut Vec<String>, ip: String) {
    if !ip.is_empty() && !ips.iter().any(|existing| *existing == ip) {
        ips.push(ip);
    }
}

fn classify(err: &ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            if *response_code == ResponseCode::NXDomain {
                DnsError::Nxdomain
            } else {
                DnsError::NoAnswer
            }
        }
        ResolveErrorKind::Timeout => DnsError::Timeout,
        _ => DnsError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(DnsError::Nxdomain.code(), "NXDOMAIN");
        assert_eq!(DnsError::Timeout.code(), "TIMEOUT");
        assert_eq!(DnsError::NoAnswer.code(), "NO_ANSWER");
        assert_eq!(DnsError::Other("boom".into()).code(), "boom");
    }

    #[test]
    fn dedup_preserves_insertion_order() {
        let mut ips = Vec::new();
        for ip in ["1.2.3.4", "5.6.7.8", "1.2.3.4", "9.9.9.9"] {
            push_deduped(&mut ips, ip.to_string());
        }
        assert_eq!(ips, vec!["1.2.3.4", "5.6.7.8", "9.9.9.9"]);
    }

    #[tokio::test]
    async fn resolve_many_preserves_input_order() {
        // An empty nameserver set fails fast for every name; ordering of the
        // outcome list is what is under test here.
        let resolver = DnsResolver::with_config(ResolverConfig::new());
        let names = vec![
            "a.invalid".to_string(),
            "b.invalid".to_string(),
            "c.invalid".to_string(),
        ];
        let out = resolver.resolve_many(&names, 2).await.unwrap();
        let got: Vec<_> = out.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(got, vec!["a.invalid", "b.invalid", "c.invalid"]);
        assert!(out.iter().all(|o| o.error.is_some()));
    }
}
