//! Resolution policy: AAAA to A fallback for probe destinations, cached
//! reverse DNS and origin-AS lookups for traceroute hops.

use async_trait::async_trait;
use hickory_resolver::proto::rr::RecordType;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{DnsTransport, WhoisTransport, parse_origin_asn};
use crate::trace::HopLookup;

/// Address family forced on the command line (`-4` / `-6`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

struct CacheEntry<T> {
    value: T,
    cached_at: Instant,
}

/// Upper bound on entries per cache
const MAX_CACHE_ENTRIES: usize = 4096;

/// Cache of successful lookups. Failures are never stored.
///
/// Expired entries are pruned on every insert; when still full, the oldest
/// entry is evicted.
struct LookupCache<T> {
    entries: RwLock<HashMap<IpAddr, CacheEntry<T>>>,
    ttl: Duration,
    capacity: usize,
}

impl<T: Clone> LookupCache<T> {
    fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, MAX_CACHE_ENTRIES)
    }

    fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn get(&self, ip: IpAddr) -> Option<T> {
        let entries = self.entries.read();
        entries
            .get(&ip)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    fn insert(&self, ip: IpAddr, value: T) {
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.cached_at.elapsed() < self.ttl);

        if !entries.contains_key(&ip) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(ip, _)| *ip);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            ip,
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

pub struct NameResolver {
    dns: Arc<dyn DnsTransport>,
    whois: Arc<dyn WhoisTransport>,
    server: SocketAddr,
    hostnames: LookupCache<String>,
    asns: LookupCache<u32>,
}

impl NameResolver {
    pub fn new(
        dns: Arc<dyn DnsTransport>,
        whois: Arc<dyn WhoisTransport>,
        server: SocketAddr,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            dns,
            whois,
            server,
            hostnames: LookupCache::new(cache_ttl),
            asns: LookupCache::new(cache_ttl),
        }
    }

    /// Default DNS server
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn dns(&self) -> &Arc<dyn DnsTransport> {
        &self.dns
    }

    /// Resolve a probe destination.
    ///
    /// Queries AAAA (A when `-4` is forced). An empty or failed answer is
    /// retried once with A, unless the caller forced a family.
    pub async fn resolve_host(&self, name: &str, family: AddressFamily) -> Option<IpAddr> {
        let preferred = match family {
            AddressFamily::V4 => RecordType::A,
            AddressFamily::Any | AddressFamily::V6 => RecordType::AAAA,
        };

        if let Some(ip) = self.first_address(name, preferred).await {
            return Some(ip);
        }
        if family == AddressFamily::Any {
            debug!(name, "No AAAA answer, retrying with A");
            return self.first_address(name, RecordType::A).await;
        }
        None
    }

    async fn first_address(&self, name: &str, record_type: RecordType) -> Option<IpAddr> {
        match self.dns.query(self.server, name, record_type).await {
            Ok(answers) => answers
                .iter()
                .filter(|answer| answer.record_type == record_type)
                .find_map(|answer| answer.value.parse().ok()),
            Err(e) => {
                warn!(name, %record_type, error = %e, "Forward lookup failed");
                None
            }
        }
    }

    /// Reverse DNS, one attempt, cached on success
    pub async fn hostname(&self, ip: IpAddr) -> Option<String> {
        if let Some(hit) = self.hostnames.get(ip) {
            return Some(hit);
        }

        match self.dns.reverse(self.server, ip).await {
            Ok(Some(name)) => {
                self.hostnames.insert(ip, name.clone());
                Some(name)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%ip, error = %e, "Reverse lookup failed");
                None
            }
        }
    }

    /// Origin AS of the covering route object, cached on success
    pub async fn origin_asn(&self, ip: IpAddr) -> Option<u32> {
        if let Some(hit) = self.asns.get(ip) {
            return Some(hit);
        }

        match self.whois.query(ip).await {
            Ok(raw) => {
                let asn = parse_origin_asn(&raw);
                match asn {
                    Some(asn) => self.asns.insert(ip, asn),
                    None => debug!(%ip, "No route object in whois response"),
                }
                asn
            }
            Err(e) => {
                warn!(%ip, error = %e, "Whois lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl HopLookup for NameResolver {
    async fn hostname(&self, address: IpAddr) -> Option<String> {
        NameResolver::hostname(self, address).await
    }

    async fn origin_asn(&self, address: IpAddr) -> Option<u32> {
        NameResolver::origin_asn(self, address).await
    }
}
