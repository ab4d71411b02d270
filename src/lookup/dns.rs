use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::{DnsAnswer, DnsTransport, sanitize_display};
use crate::error::LookupError;

/// hickory-backed DNS transport.
///
/// Each query builds a fresh single-server resolver with hickory's own cache
/// disabled, so `nslookup -s <server>` always goes to the wire.
#[derive(Debug, Clone)]
pub struct HickoryDns {
    timeout: Duration,
}

impl HickoryDns {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn resolver(&self, server: SocketAddr) -> TokioAsyncResolver {
        let servers = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);

        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        opts.use_hosts_file = false;

        TokioAsyncResolver::tokio(config, opts)
    }
}

fn is_empty_answer(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn to_lookup_error(err: ResolveError) -> LookupError {
    match err.kind() {
        ResolveErrorKind::Timeout => LookupError::Timeout,
        _ => LookupError::Dns(err.to_string()),
    }
}

#[async_trait]
impl DnsTransport for HickoryDns {
    async fn query(
        &self,
        server: SocketAddr,
        name: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsAnswer>, LookupError> {
        match self.resolver(server).lookup(name, record_type).await {
            Ok(lookup) => Ok(lookup
                .records()
                .iter()
                .filter_map(|record| {
                    record.data().map(|data| DnsAnswer {
                        record_type: record.record_type(),
                        value: sanitize_display(&data.to_string()),
                    })
                })
                .collect()),
            Err(e) if is_empty_answer(&e) => Ok(Vec::new()),
            Err(e) => Err(to_lookup_error(e)),
        }
    }

    async fn reverse(
        &self,
        server: SocketAddr,
        address: IpAddr,
    ) -> Result<Option<String>, LookupError> {
        match self.resolver(server).reverse_lookup(address).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .next()
                .map(|name| sanitize_display(name.to_string().trim_end_matches('.')))),
            Err(e) if is_empty_answer(&e) => Ok(None),
            Err(e) => Err(to_lookup_error(e)),
        }
    }
}
