//! Exchange and address resolution for delivery.
//!
//! MX lookups fall back to A/AAAA per RFC 5321 section 5.1. Failures carry a
//! synthetic SMTP reply so the classifier upstream can treat DNS trouble
//! exactly like a deferring server.

use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
};
use posthaste_common::config::AddressFamily;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, warn};

/// One mail exchange for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub host: String,
    /// MX preference; lower wins. 0 for pinned hosts and A/AAAA fallback.
    pub priority: u16,
}

impl Exchange {
    pub const fn new(host: String, priority: u16) -> Self {
        Self { host, priority }
    }
}

/// A resolution failure, carrying the synthetic reply handed to the
/// classifier.
#[derive(Debug, Error)]
#[error("{reply}")]
pub struct DnsFailure {
    pub reply: String,
}

impl DnsFailure {
    pub fn no_mx(domain: &str) -> Self {
        Self {
            reply: format!("450 Can't find an MX server for {domain}"),
        }
    }
}

/// Name resolution as the delivery loop needs it. An empty address list is
/// an in-band result, not an error.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Exchanges for `domain`, ordered by ascending priority with ties
    /// randomised.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsFailure>;

    /// Addresses for one exchange, restricted to `family`.
    async fn resolve_ip(&self, host: &str, family: AddressFamily) -> Vec<IpAddr>;
}

/// Sort by ascending priority; equal priorities are shuffled so that load
/// spreads across same-preference exchanges.
pub(crate) fn order_exchanges(exchanges: &mut [Exchange]) {
    exchanges.sort_by_key(|e| e.priority);

    let mut rng = rand::rng();
    let mut start = 0;
    for end in 1..=exchanges.len() {
        if end == exchanges.len() || exchanges[end].priority != exchanges[start].priority {
            exchanges[start..end].shuffle(&mut rng);
            start = end;
        }
    }
}

/// Hickory-backed resolver using the system configuration.
pub struct DnsResolver {
    inner: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        Self {
            inner: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }

    /// A/AAAA fallback when the domain has no MX records: the domain itself
    /// becomes an implicit priority-0 exchange, if it resolves at all.
    async fn implicit_exchange(&self, domain: &str) -> Result<Vec<Exchange>, DnsFailure> {
        match self.inner.lookup_ip(domain).await {
            Ok(lookup) if lookup.iter().next().is_some() => {
                debug!(domain, "no MX records, using implicit A/AAAA exchange");
                Ok(vec![Exchange::new(domain.to_string(), 0)])
            }
            Ok(_) => Err(DnsFailure::no_mx(domain)),
            Err(e) => {
                warn!(domain, error = %e, "A/AAAA fallback lookup failed");
                Err(DnsFailure::no_mx(domain))
            }
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsFailure> {
        // An address literal is its own exchange.
        if domain.parse::<IpAddr>().is_ok() {
            return Ok(vec![Exchange::new(domain.to_string(), 0)]);
        }

        match self.inner.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut exchanges: Vec<Exchange> = lookup
                    .iter()
                    .map(|mx| {
                        Exchange::new(
                            mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                            mx.preference(),
                        )
                    })
                    .collect();

                if exchanges.is_empty() {
                    return self.implicit_exchange(domain).await;
                }

                order_exchanges(&mut exchanges);
                debug!(domain, count = exchanges.len(), "resolved exchanges");
                Ok(exchanges)
            }
            Err(e) => {
                if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    self.implicit_exchange(domain).await
                } else {
                    warn!(domain, error = %e, "MX lookup failed");
                    Err(DnsFailure::no_mx(domain))
                }
            }
        }
    }

    async fn resolve_ip(&self, host: &str, family: AddressFamily) -> Vec<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return if family.permits(&ip) { vec![ip] } else { Vec::new() };
        }

        match self.inner.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().filter(|ip| family.permits(ip)).collect(),
            Err(e) => {
                if !matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    warn!(host, error = %e, "address lookup failed");
                }
                Vec::new()
            }
        }
    }
}
