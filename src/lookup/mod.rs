//! Name and origin-AS resolution on top of pluggable DNS and whois transports.

pub mod asn;
pub mod dns;
pub mod resolver;

use async_trait::async_trait;
use hickory_resolver::proto::rr::RecordType;
use std::net::{IpAddr, SocketAddr};

use crate::error::LookupError;

pub use asn::{TcpWhois, parse_origin_asn};
pub use dns::HickoryDns;
pub use resolver::{AddressFamily, NameResolver};

/// One answer record, already rendered to text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub record_type: RecordType,
    pub value: String,
}

/// Wire-level DNS queries against an explicit server.
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Forward query. An empty answer section is `Ok(vec![])`.
    async fn query(
        &self,
        server: SocketAddr,
        name: &str,
        record_type: RecordType,
    ) -> Result<Vec<DnsAnswer>, LookupError>;

    /// PTR query for `address`; `Ok(None)` when no PTR exists
    async fn reverse(&self, server: SocketAddr, address: IpAddr)
    -> Result<Option<String>, LookupError>;
}

/// Registry ("whois") text query.
#[async_trait]
pub trait WhoisTransport: Send + Sync {
    async fn query(&self, address: IpAddr) -> Result<String, LookupError>;
}

/// Strip control characters from remote-supplied text before it is echoed
/// back into a chat message.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
