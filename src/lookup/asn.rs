//! Origin-AS extraction from whois route objects.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::WhoisTransport;
use crate::error::LookupError;

/// Cap on a whois response; route objects are tiny
const MAX_RESPONSE_BYTES: u64 = 256 * 1024;

/// Extract the origin ASN from raw whois output.
///
/// Takes the last `route:` object (or, failing that, the last `route6:`),
/// then the first `origin:` field after it. An `AS` prefix is optional.
pub fn parse_origin_asn(raw: &str) -> Option<u32> {
    let route_at = raw.rfind("route:").or_else(|| raw.rfind("route6:"))?;
    let origin_at = route_at + raw[route_at..].find("origin:")? + "origin:".len();
    let line = raw[origin_at..].lines().next().unwrap_or_default().trim();

    let digits = match line.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("AS") => &line[2..],
        _ => line,
    };
    digits.parse().ok()
}

/// Plain-text whois over TCP (RFC 3912)
#[derive(Debug, Clone)]
pub struct TcpWhois {
    server: SocketAddr,
    timeout: Duration,
}

impl TcpWhois {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn exchange(&self, address: IpAddr) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(self.server).await?;
        stream.write_all(format!("{}\r\n", address).as_bytes()).await?;

        let mut raw = Vec::new();
        (&mut stream)
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut raw)
            .await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[async_trait]
impl WhoisTransport for TcpWhois {
    async fn query(&self, address: IpAddr) -> Result<String, LookupError> {
        match tokio::time::timeout(self.timeout, self.exchange(address)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(source)) => Err(LookupError::Whois {
                server: self.server.to_string(),
                source,
            }),
            Err(_) => Err(LookupError::Timeout),
        }
    }
}
