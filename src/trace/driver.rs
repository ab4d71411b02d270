//! TTL ladder over the probe engine.

use async_trait::async_trait;
use std::net::IpAddr;
use std::num::NonZeroU8;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probe::{ProbeOptions, ProbeReply, ProbeStatus, Prober};

/// Reverse DNS and origin-AS lookups for a hop address.
///
/// Failures are `None`; the caller falls back to the literal address / `*`.
#[async_trait]
pub trait HopLookup: Send + Sync {
    async fn hostname(&self, address: IpAddr) -> Option<String>;
    async fn origin_asn(&self, address: IpAddr) -> Option<u32>;
}

/// Trace parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParams {
    pub destination: IpAddr,
    pub first_ttl: u8,
    pub max_ttl: u8,
    pub payload_size: usize,
    pub timeout: Duration,
    /// Probes per hop
    pub queries: u8,
    /// Delay between consecutive probes of one hop
    pub interval: Duration,
    pub dont_fragment: bool,
}

impl TraceParams {
    pub fn new(destination: IpAddr) -> Self {
        Self {
            destination,
            first_ttl: 1,
            max_ttl: 10,
            payload_size: 56,
            timeout: Duration::from_millis(2000),
            queries: 1,
            interval: Duration::from_millis(50),
            dont_fragment: false,
        }
    }
}

/// What one probe of a hop produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopToken {
    /// Answer (echo reply or TTL expired)
    Rtt(Duration),
    /// Answer with a status that ends the trace
    Terminal(Duration, ProbeStatus),
    TimedOut,
    /// Unmapped reply or internal fault
    Error,
}

impl HopToken {
    fn from_reply(reply: &ProbeReply) -> Self {
        match reply.status {
            ProbeStatus::Success | ProbeStatus::TtlExpired => Self::Rtt(reply.rtt),
            status if status.terminates_trace() => Self::Terminal(reply.rtt, status),
            ProbeStatus::TimedOut => Self::TimedOut,
            _ => Self::Error,
        }
    }
}

/// A distinct responder at one hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopName {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub asn: Option<u32>,
}

/// Aggregated result of one TTL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopReport {
    pub ttl: u8,
    /// Distinct responders in first-seen order; `None` is the silent placeholder
    pub responders: Vec<Option<HopName>>,
    /// One token per probe sent so far, in send order
    pub tokens: Vec<HopToken>,
}

impl HopReport {
    fn new(ttl: u8) -> Self {
        Self {
            ttl,
            responders: Vec::new(),
            tokens: Vec::new(),
        }
    }

    fn knows(&self, address: Option<IpAddr>) -> bool {
        self.responders
            .iter()
            .any(|r| r.as_ref().map(|n| n.address) == address)
    }

    /// Responders that actually answered
    pub fn named(&self) -> impl Iterator<Item = &HopName> {
        self.responders.iter().flatten()
    }
}

/// Receives every intermediate state so a UI can repaint after each probe.
#[async_trait]
pub trait TraceObserver: Send + Sync {
    async fn progress(&self, hops: &[HopReport]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOutcome {
    pub hops: Vec<HopReport>,
    /// Stopped because the destination answered or a terminal status arrived
    pub reached: bool,
    pub cancelled: bool,
}

pub struct Tracer<'a> {
    prober: &'a dyn Prober,
    lookup: &'a dyn HopLookup,
}

impl<'a> Tracer<'a> {
    pub fn new(prober: &'a dyn Prober, lookup: &'a dyn HopLookup) -> Self {
        Self { prober, lookup }
    }

    /// Walk `first_ttl..=max_ttl`, probing each hop sequentially.
    ///
    /// Cancellation stops the ladder and is reported in the outcome rather
    /// than as an error, so the partial result can still be rendered.
    pub async fn run(
        &self,
        params: &TraceParams,
        observer: &dyn TraceObserver,
        cancel: &CancellationToken,
    ) -> TraceOutcome {
        let payload = vec![0u8; params.payload_size];
        let mut hops: Vec<HopReport> = Vec::new();
        let mut reached = false;

        'ladder: for ttl in params.first_ttl.max(1)..=params.max_ttl {
            if cancel.is_cancelled() {
                break;
            }
            let Some(hop_ttl) = NonZeroU8::new(ttl) else {
                continue;
            };
            let options = ProbeOptions {
                ttl: hop_ttl,
                dont_fragment: params.dont_fragment,
                timeout: params.timeout,
            };
            hops.push(HopReport::new(ttl));
            let current = hops.len() - 1;

            for query in 0..params.queries {
                if query > 0 && !params.interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => break 'ladder,
                        _ = tokio::time::sleep(params.interval) => {}
                    }
                }

                let reply = match self
                    .prober
                    .probe(params.destination, &payload, &options, cancel)
                    .await
                {
                    Ok(reply) => reply,
                    Err(_) => break 'ladder,
                };
                debug!(
                    destination = %params.destination,
                    ttl,
                    from = %reply.address,
                    status = %reply.status,
                    rtt_ms = reply.rtt.as_secs_f64() * 1000.0,
                    "Trace probe"
                );

                let token = HopToken::from_reply(&reply);
                // Replies we cannot classify do not name the hop
                let address = match token {
                    HopToken::Error => None,
                    _ => reply.has_responder().then_some(reply.address),
                };
                if matches!(token, HopToken::Terminal(..))
                    || address == Some(params.destination)
                {
                    reached = true;
                }

                if !hops[current].knows(address) {
                    let name = match address {
                        Some(address) => match self.resolve(address, cancel).await {
                            Some(name) => Some(name),
                            None => break 'ladder,
                        },
                        None => None,
                    };
                    hops[current].responders.push(name);
                }
                hops[current].tokens.push(token);

                observer.progress(&hops).await;
            }

            if reached {
                break;
            }
        }

        TraceOutcome {
            hops,
            reached,
            cancelled: cancel.is_cancelled(),
        }
    }

    /// Hostname and ASN lookups run concurrently; `None` only on cancellation.
    async fn resolve(&self, address: IpAddr, cancel: &CancellationToken) -> Option<HopName> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            (hostname, asn) = async {
                tokio::join!(self.lookup.hostname(address), self.lookup.origin_asn(address))
            } => Some(HopName { address, hostname, asn }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Cancelled;
    use crate::probe::Unreachable;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(172, 20, 0, last))
    }

    /// Prober scripted per TTL
    struct Scripted<F>(F, Mutex<Vec<u8>>);

    #[async_trait]
    impl<F> Prober for Scripted<F>
    where
        F: Fn(u8, usize) -> ProbeReply + Send + Sync,
    {
        async fn probe(
            &self,
            _host: IpAddr,
            _payload: &[u8],
            options: &ProbeOptions,
            cancel: &CancellationToken,
        ) -> Result<ProbeReply, Cancelled> {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let mut sent = self.1.lock();
            let ttl = options.ttl.get();
            let nth = sent.iter().filter(|t| **t == ttl).count();
            sent.push(ttl);
            Ok((self.0)(ttl, nth))
        }
    }

    fn reply(address: IpAddr, status: ProbeStatus, rtt_ms: u64) -> ProbeReply {
        ProbeReply {
            address,
            payload: Vec::new(),
            options: None,
            rtt: Duration::from_millis(rtt_ms),
            status,
        }
    }

    struct NoLookup;

    #[async_trait]
    impl HopLookup for NoLookup {
        async fn hostname(&self, address: IpAddr) -> Option<String> {
            (address == ip(2)).then(|| "router2.dn42".to_string())
        }
        async fn origin_asn(&self, _address: IpAddr) -> Option<u32> {
            Some(4242420000)
        }
    }

    struct Quiet;

    #[async_trait]
    impl TraceObserver for Quiet {
        async fn progress(&self, _hops: &[HopReport]) {}
    }

    fn params() -> TraceParams {
        TraceParams {
            interval: Duration::ZERO,
            ..TraceParams::new(ip(5))
        }
    }

    #[tokio::test]
    async fn test_stops_when_destination_answers() {
        let prober = Scripted(
            |ttl, _| {
                if ttl == 5 {
                    reply(ip(5), ProbeStatus::Success, 5)
                } else {
                    reply(ip(ttl), ProbeStatus::TtlExpired, ttl as u64)
                }
            },
            Mutex::new(Vec::new()),
        );
        let outcome = Tracer::new(&prober, &NoLookup)
            .run(&params(), &Quiet, &CancellationToken::new())
            .await;

        assert!(outcome.reached);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.hops.len(), 5);
        assert_eq!(*prober.1.lock(), vec![1, 2, 3, 4, 5]);

        let hop2 = &outcome.hops[1];
        assert_eq!(
            hop2.responders,
            vec![Some(HopName {
                address: ip(2),
                hostname: Some("router2.dn42".into()),
                asn: Some(4242420000),
            })]
        );
    }

    #[tokio::test]
    async fn test_unreachable_terminates_early() {
        let prober = Scripted(
            |ttl, _| {
                if ttl == 3 {
                    reply(ip(3), ProbeStatus::Unreachable(Unreachable::Host), 3)
                } else {
                    reply(ip(ttl), ProbeStatus::TtlExpired, 1)
                }
            },
            Mutex::new(Vec::new()),
        );
        let outcome = Tracer::new(&prober, &NoLookup)
            .run(&params(), &Quiet, &CancellationToken::new())
            .await;

        assert!(outcome.reached);
        assert_eq!(outcome.hops.len(), 3);
        assert_eq!(
            outcome.hops[2].tokens,
            vec![HopToken::Terminal(
                Duration::from_millis(3),
                ProbeStatus::Unreachable(Unreachable::Host)
            )]
        );
    }

    #[tokio::test]
    async fn test_partial_hop_unions_addresses() {
        let prober = Scripted(
            |ttl, nth| match (ttl, nth) {
                (1, 0) => ProbeReply::timed_out(ip(5), Duration::from_millis(2000)),
                (1, 1) => reply(ip(1), ProbeStatus::TtlExpired, 1),
                (1, _) => reply(ip(9), ProbeStatus::TtlExpired, 2),
                _ => reply(ip(5), ProbeStatus::Success, 4),
            },
            Mutex::new(Vec::new()),
        );
        let trace = TraceParams {
            queries: 4,
            ..params()
        };
        let outcome = Tracer::new(&prober, &NoLookup)
            .run(&trace, &Quiet, &CancellationToken::new())
            .await;

        let hop1 = &outcome.hops[0];
        assert_eq!(hop1.tokens.len(), 4);
        assert_eq!(hop1.tokens[0], HopToken::TimedOut);
        let addresses: Vec<_> = hop1
            .responders
            .iter()
            .map(|r| r.as_ref().map(|n| n.address))
            .collect();
        assert_eq!(addresses, vec![None, Some(ip(1)), Some(ip(9))]);
        assert_eq!(outcome.hops.len(), 2);
    }

    #[tokio::test]
    async fn test_error_reply_has_no_responder() {
        let prober = Scripted(
            |ttl, _| match ttl {
                1 => reply(ip(1), ProbeStatus::ParameterProblem, 1),
                2 => reply(ip(2), ProbeStatus::SourceQuench, 1),
                _ => reply(ip(5), ProbeStatus::Success, 1),
            },
            Mutex::new(Vec::new()),
        );
        let outcome = Tracer::new(&prober, &NoLookup)
            .run(&params(), &Quiet, &CancellationToken::new())
            .await;

        for hop in &outcome.hops[..2] {
            assert_eq!(hop.tokens, vec![HopToken::Error]);
            assert_eq!(hop.responders, vec![None]);
            assert_eq!(hop.named().count(), 0);
        }
        assert!(outcome.reached);
        assert_eq!(outcome.hops.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_ladder() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let prober = Scripted(
            move |ttl, _| {
                if ttl == 2 {
                    trigger.cancel();
                }
                reply(ip(ttl), ProbeStatus::TtlExpired, 1)
            },
            Mutex::new(Vec::new()),
        );
        let outcome = Tracer::new(&prober, &NoLookup)
            .run(&params(), &Quiet, &cancel)
            .await;

        assert!(outcome.cancelled);
        assert!(!outcome.reached);
        assert_eq!(*prober.1.lock(), vec![1, 2]);
    }
}
