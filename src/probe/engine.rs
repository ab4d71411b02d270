//! Single-shot echo probe over a raw socket.
//!
//! Each call opens its own socket, sends one Echo Request and waits for the
//! correlated reply, the per-probe timeout, or cancellation.

use async_trait::async_trait;
use pnet::packet::ipv4::{Ipv4Flags, Ipv4Packet};
use socket2::Socket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroU8;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Cancelled;
use crate::probe::icmp::{IcmpKind, IcmpPacket, Icmpv6Packet};
use crate::probe::socket::{
    Datagram, RECV_BUFFER_SIZE, create_probe_socket, enable_recv_hop_limit, recv_datagram,
    send_to, set_dont_fragment, set_hop_limit,
};
use crate::probe::status::ProbeStatus;

/// Upper bound on a single blocking read, so deadline and cancellation are
/// observed promptly while the receive runs on the blocking pool.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Per-probe IP options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    pub ttl: NonZeroU8,
    pub dont_fragment: bool,
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            ttl: NonZeroU8::new(64).unwrap_or(NonZeroU8::MAX),
            dont_fragment: false,
            timeout: Duration::from_millis(2000),
        }
    }
}

/// IP header details of the reply datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyOptions {
    pub ttl: u8,
    pub dont_fragment: bool,
}

/// Result of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReply {
    /// Responder; the unspecified address on internal failure
    pub address: IpAddr,
    pub payload: Vec<u8>,
    pub options: Option<ReplyOptions>,
    pub rtt: Duration,
    pub status: ProbeStatus,
}

impl ProbeReply {
    /// No answer before `waited` elapsed. Nobody responded, so the address is
    /// the unspecified address of the probed family.
    pub fn timed_out(host: IpAddr, waited: Duration) -> Self {
        Self {
            address: unspecified(host.is_ipv6()),
            payload: Vec::new(),
            options: None,
            rtt: waited,
            status: ProbeStatus::TimedOut,
        }
    }

    pub fn internal_error(ipv6: bool) -> Self {
        Self {
            address: unspecified(ipv6),
            payload: Vec::new(),
            options: None,
            rtt: Duration::ZERO,
            status: ProbeStatus::Unknown,
        }
    }

    /// True when some host actually answered (success or router error)
    pub fn has_responder(&self) -> bool {
        !matches!(self.status, ProbeStatus::TimedOut | ProbeStatus::Unknown)
    }
}

fn unspecified(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Anything that can send one echo probe.
///
/// Only cancellation escapes as `Err`; timeouts, router errors and socket
/// faults are all folded into [`ProbeReply::status`].
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        host: IpAddr,
        payload: &[u8],
        options: &ProbeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeReply, Cancelled>;
}

/// Outcome of matching one received IPv4 datagram against our request
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Correlation {
    Matched {
        status: ProbeStatus,
        options: ReplyOptions,
        payload: Vec<u8>,
    },
    /// Echo traffic or a quoted request that belongs to someone else
    Mismatch { identifier: u16, sequence: u16 },
    /// Not a reply at all (our own request looped back, unrelated types, junk)
    Ignored,
}

/// Match a raw IPv4 datagram (IP header included) to `(identifier, sequence)`.
///
/// Echo Replies carry the pair in their own header. Error replies (types
/// 3/11/12) quote the original IP header plus 8 bytes of our ICMP header, so
/// the pair is read from offsets 4 and 6 past the quoted IP header.
pub(crate) fn correlate_v4(data: &[u8], identifier: u16, sequence: u16) -> Correlation {
    let Some(ip) = Ipv4Packet::new(data) else {
        return Correlation::Ignored;
    };
    let header_len = ip.get_header_length() as usize * 4;
    let Some(icmp) = data.get(header_len..).and_then(|d| IcmpPacket::parse(d).ok()) else {
        return Correlation::Ignored;
    };

    let carried = if icmp.kind.icmp_type() == IcmpKind::ECHO_REPLY.icmp_type() {
        Some((icmp.identifier, icmp.sequence))
    } else if icmp.kind.is_v4_error() {
        quoted_echo_ids(icmp.payload())
    } else {
        None
    };

    match carried {
        Some((id, seq)) if id == identifier && seq == sequence => Correlation::Matched {
            status: ProbeStatus::from_icmpv4(icmp.kind),
            options: ReplyOptions {
                ttl: ip.get_ttl(),
                dont_fragment: ip.get_flags() & Ipv4Flags::DontFragment != 0,
            },
            payload: icmp.payload().to_vec(),
        },
        Some((id, seq)) => Correlation::Mismatch {
            identifier: id,
            sequence: seq,
        },
        None => Correlation::Ignored,
    }
}

/// Identifier and sequence of the Echo Request quoted inside an ICMP error
fn quoted_echo_ids(quoted: &[u8]) -> Option<(u16, u16)> {
    let inner = Ipv4Packet::new(quoted)?;
    let inner_len = inner.get_header_length() as usize * 4;
    let echo = quoted.get(inner_len..inner_len + 8)?;
    Some((
        u16::from_be_bytes([echo[4], echo[5]]),
        u16::from_be_bytes([echo[6], echo[7]]),
    ))
}

/// Raw-socket ICMP prober.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    identifier: u16,
}

impl IcmpProber {
    /// Prober whose echo identifier is derived from the process id
    pub fn new() -> Self {
        Self {
            identifier: (std::process::id() & 0xFFFF) as u16,
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    fn open(&self, host: IpAddr, options: &ProbeOptions) -> anyhow::Result<Socket> {
        let ipv6 = host.is_ipv6();
        let socket = create_probe_socket(ipv6, READ_SLICE)?;
        set_hop_limit(&socket, options.ttl.get(), ipv6)?;
        if options.dont_fragment {
            set_dont_fragment(&socket, ipv6)?;
        }
        if ipv6 {
            enable_recv_hop_limit(&socket, true)?;
        }
        Ok(socket)
    }

    fn build_request(&self, host: IpAddr, sequence: u16, payload: &[u8]) -> Vec<u8> {
        if host.is_ipv6() {
            // Echo id/seq live in the first four payload bytes of an ICMPv6 echo
            let mut body = Vec::with_capacity(4 + payload.len());
            body.extend_from_slice(&self.identifier.to_be_bytes());
            body.extend_from_slice(&sequence.to_be_bytes());
            body.extend_from_slice(payload);
            Icmpv6Packet::create(IcmpKind::V6_ECHO_REQUEST, &body)
                .as_bytes()
                .to_vec()
        } else {
            IcmpPacket::create(IcmpKind::ECHO_REQUEST, self.identifier, sequence, payload)
                .as_bytes()
                .to_vec()
        }
    }

    /// Turn one datagram into a reply, or `None` to keep listening
    fn accept(
        &self,
        host: IpAddr,
        sequence: u16,
        datagram: &Datagram,
        data: &[u8],
        rtt: Duration,
    ) -> Option<ProbeReply> {
        if host.is_ipv6() {
            // No id/sequence correlation on the v6 path: first parseable datagram wins
            let packet = match Icmpv6Packet::parse(data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(from = %datagram.source, error = %e, "Discarding ICMPv6 datagram");
                    return None;
                }
            };
            let status = ProbeStatus::from_icmpv6(packet.kind);
            let payload = if status == ProbeStatus::Success {
                packet.payload().get(4..).unwrap_or_default().to_vec()
            } else {
                packet.payload().to_vec()
            };
            return Some(ProbeReply {
                address: datagram.source,
                payload,
                options: datagram.hop_limit.map(|ttl| ReplyOptions {
                    ttl,
                    dont_fragment: false,
                }),
                rtt,
                status,
            });
        }

        match correlate_v4(data, self.identifier, sequence) {
            Correlation::Matched {
                status,
                options,
                payload,
            } => Some(ProbeReply {
                address: datagram.source,
                payload,
                options: Some(options),
                rtt,
                status,
            }),
            Correlation::Mismatch {
                identifier,
                sequence: seq,
            } => {
                if identifier == self.identifier {
                    warn!(
                        from = %datagram.source,
                        expected = sequence,
                        got = seq,
                        "ICMP sequence mismatch, still waiting"
                    );
                } else {
                    debug!(from = %datagram.source, identifier, "Reply for another prober");
                }
                None
            }
            Correlation::Ignored => None,
        }
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for IcmpProber {
    async fn probe(
        &self,
        host: IpAddr,
        payload: &[u8],
        options: &ProbeOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeReply, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let ipv6 = host.is_ipv6();
        let sequence: u16 = rand::random();
        let request = self.build_request(host, sequence, payload);

        let socket = match self.open(host, options) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!(%host, error = %e, "Failed to prepare probe socket");
                return Ok(ProbeReply::internal_error(ipv6));
            }
        };

        let start = Instant::now();
        if let Err(e) = send_to(&socket, &request, host) {
            error!(%host, error = %e, "Failed to send echo request");
            return Ok(ProbeReply::internal_error(ipv6));
        }
        let deadline = start + options.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ProbeReply::timed_out(host, options.timeout));
            }

            let sock = Arc::clone(&socket);
            let recv = tokio::task::spawn_blocking(move || {
                let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
                recv_datagram(&sock, &mut buffer, ipv6).map(|received| {
                    received.map(|datagram| {
                        buffer.truncate(datagram.len);
                        (datagram, buffer)
                    })
                })
            });

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = tokio::time::sleep(remaining) => {
                    return Ok(ProbeReply::timed_out(host, options.timeout));
                }
                joined = recv => joined,
            };

            match joined {
                Ok(Ok(Some((datagram, data)))) => {
                    let rtt = start.elapsed();
                    if let Some(reply) = self.accept(host, sequence, &datagram, &data, rtt) {
                        debug!(
                            %host,
                            from = %reply.address,
                            ttl = options.ttl.get(),
                            rtt_ms = rtt.as_secs_f64() * 1000.0,
                            status = %reply.status,
                            "Probe reply"
                        );
                        return Ok(reply);
                    }
                }
                // Read slice elapsed without traffic
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    error!(%host, error = %e, "Receive failed");
                    return Ok(ProbeReply::internal_error(ipv6));
                }
                Err(e) => {
                    error!(%host, error = %e, "Receive task failed");
                    return Ok(ProbeReply::internal_error(ipv6));
                }
            }
        }
    }
}
