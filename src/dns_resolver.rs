//! Reverse DNS for remote peers.
//!
//! Each public address is looked up at most once per run; the answer, or the
//! lack of one, is cached and returned from then on. Private, loopback and
//! link-local peers are never sent to a resolver at all, which keeps internal
//! topology out of outbound queries and avoids slow timeouts on names nobody
//! publishes.

use ipnetwork::IpNetwork;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Ranges that are never resolved: private, loopback, link-local, documentation
/// and otherwise non-routable space.
const NON_RESOLVABLE: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "100::/64",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
];

/// PTR lookup against some name service.
pub trait PtrLookup: Send + Sync + 'static {
    /// `None` covers every kind of failure: NXDOMAIN, empty answer, network error.
    fn reverse_lookup(&self, ip: IpAddr) -> impl Future<Output = Option<String>> + Send;
}

pub struct TrustDnsLookup {
    resolver: TokioAsyncResolver,
}

impl TrustDnsLookup {
    pub fn new(timeout: Duration) -> Self {
        let (config, mut opts) = trust_dns_resolver::system_conf::read_system_conf()
            .unwrap_or_else(|e| {
                // Fallback to Google DNS if system config fails
                warn!("System resolver config unavailable ({}), using public resolvers", e);
                (ResolverConfig::google(), ResolverOpts::default())
            });
        opts.timeout = timeout;
        opts.attempts = 1;

        TrustDnsLookup {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl PtrLookup for TrustDnsLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(ip).await {
            Ok(lookup) => {
                let names: Vec<_> = lookup.into_iter().collect();
                names
                    .first()
                    .map(|name| name.to_string().trim_end_matches('.').to_string())
                    .filter(|name| !name.is_empty())
            }
            Err(e) => {
                debug!("DNS reverse lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}

/// `ip -> name` memo. An initialized cell holding `None` is a cached "no answer".
struct CacheMap {
    entries: HashMap<IpAddr, Arc<OnceCell<Option<String>>>>,
    order: VecDeque<IpAddr>,
    capacity: Option<usize>,
}

impl CacheMap {
    fn cell(&mut self, ip: IpAddr) -> Arc<OnceCell<Option<String>>> {
        if let Some(cell) = self.entries.get(&ip) {
            return cell.clone();
        }
        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        let cell = Arc::new(OnceCell::new());
        self.entries.insert(ip, cell.clone());
        self.order.push_back(ip);
        cell
    }
}

pub struct ReverseNameCache<L: PtrLookup> {
    lookup: L,
    enabled: bool,
    timeout: Duration,
    skip: Vec<IpNetwork>,
    cache: Mutex<CacheMap>,
}

impl<L: PtrLookup> ReverseNameCache<L> {
    pub fn new(lookup: L, enabled: bool, timeout: Duration, capacity: Option<usize>) -> Self {
        ReverseNameCache {
            lookup,
            enabled,
            timeout,
            skip: NON_RESOLVABLE.iter().filter_map(|net| net.parse().ok()).collect(),
            cache: Mutex::new(CacheMap {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// True for addresses that must never be looked up.
    pub fn is_local(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.skip.iter().any(|net| net.contains(ip))
    }

    /// Cached name for `ip`, resolving it on first sight within the configured timeout.
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        if !self.enabled || self.is_local(ip) {
            return None;
        }

        let cell = self.cache.lock().await.cell(ip);
        if let Some(cached) = cell.get() {
            debug!("DNS cache hit for {}: {:?}", ip, cached);
            return cached.clone();
        }

        cell.get_or_init(|| async {
            match tokio::time::timeout(self.timeout, self.lookup.reverse_lookup(ip)).await {
                Ok(name) => {
                    debug!("DNS resolved {} -> {:?}", ip, name);
                    name
                }
                Err(_) => {
                    debug!("DNS lookup timeout ({:?}) for {}", self.timeout, ip);
                    None
                }
            }
        })
        .await
        .clone()
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}
