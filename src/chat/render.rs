//! Plain-text bodies for ping, traceroute and DNS lookup messages.

use hickory_resolver::proto::rr::RecordType;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::lookup::DnsAnswer;
use crate::probe::{ProbeReply, ProbeStatus, Unreachable};
use crate::trace::{HopReport, HopToken};

pub const CANCELLED_NOTICE: &str = "\nOperation had been cancelled by user";

/// Column where a hop's ASN starts, relative to the hostname
const TRACE_NAME_WIDTH: usize = 44;
/// Column where per-probe tokens start on a fresh line
const TRACE_RTT_COLUMN: usize = 48;
const TRACE_INDENT: &str = "    ";

pub const PING_USAGE: &str = "\
Usage:
    /ping [options] <dest>

Options:
    -c <count>    number of echo requests to send (default: 4)
    -s <size>     use <size> as number of data bytes to be sent
    -F            do not fragment packets
    -t <timeout>  time to wait for response (default: 2000ms)
    -i <interval> ms between sending each packet (default: 500ms)
    -4            use IPv4
    -6            use IPv6";

pub const TRACE_USAGE: &str = "\
Usage:
    /trace [options] <dest>

Options:
    -f <firstTTL>       start from the <firstTTL> hop (default: 1)
    -m <maxTTL>         set the max number of hops (default: 10)
    -s <size>           use <size> as number of data bytes to be sent
    -t <timeout>        time to wait for response (default: 2000ms)
    -q <queryCount>     set the number of probes per each hop (default: 1)
    -i <interval>       ms between sending each packet (default: 50ms)
    -F                  do not fragment packets
    -4                  use IPv4
    -6                  use IPv6";

pub const LOOKUP_USAGE: &str = "\
Usage:
    /dig      [options] <domain>
    /nslookup [options] <domain>

Options:
    -t <query type>        specify the DNS query type (e.g. A, AAAA, MX, NS, TXT)
    -s <IPv4|IPv6 addr>    specify the DNS server (IPv4 or IPv6 address) to query
    -p <port>              specify port number";

/// Error line followed by the usage text
pub fn with_usage(error: &str, usage: &str) -> String {
    if error.is_empty() {
        usage.to_string()
    } else {
        format!("{}\n{}", error, usage)
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Resolved probe target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name as typed, when the user gave one
    pub name: Option<String>,
    pub address: IpAddr,
}

impl Target {
    /// `name (address)` or just the address
    fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", name, self.address),
            None => self.address.to_string(),
        }
    }

    /// Name used in the statistics footer
    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

pub fn ping_header(target: &Target, size: usize) -> String {
    format!("PING {} with {} bytes of data", target.describe(), size)
}

pub fn ping_line(seq: u32, reply: &ProbeReply) -> String {
    match reply.status {
        ProbeStatus::Success => {
            let ttl = reply
                .options
                .map(|o| o.ttl.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!(
                "Reply from {}: Seq={} TTL={} Time={:.2}ms",
                reply.address,
                seq,
                ttl,
                ms(reply.rtt)
            )
        }
        ProbeStatus::TimedOut => "Request timed out".to_string(),
        ProbeStatus::Unknown => "Internal error".to_string(),
        status => format!("Reply from {}: {}", reply.address, status),
    }
}

/// Running ping statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingStats {
    pub sent: u32,
    pub lost: u32,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Duration,
}

impl PingStats {
    pub fn record(&mut self, reply: &ProbeReply) {
        self.sent += 1;
        self.total += reply.rtt;
        self.max = self.max.max(reply.rtt);

        match reply.status {
            ProbeStatus::Success => {}
            ProbeStatus::TimedOut => {
                self.lost += 1;
                // A timeout is no evidence of a minimum
                return;
            }
            _ => self.lost += 1,
        }
        self.min = Some(self.min.map_or(reply.rtt, |min| min.min(reply.rtt)));
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.lost as f64 / self.sent as f64 * 100.0
    }

    pub fn average(&self) -> Duration {
        if self.sent == 0 {
            return Duration::ZERO;
        }
        self.total / self.sent
    }

    pub fn footer(&self, target: &Target) -> String {
        format!(
            "--- {} Ping statistics ---\n\
             {:.2}% packet loss, time {:.2}ms\n\
             RTT min/avg/max = {:.2}/{:.2}/{:.2} ms",
            target.label(),
            self.loss_percent(),
            ms(self.total),
            ms(self.min.unwrap_or_default()),
            ms(self.average()),
            ms(self.max)
        )
    }
}

pub fn trace_header(target: &Target, max_ttl: u8, size: usize) -> String {
    format!(
        "traceroute to {}, {} hops max, with {} bytes of data",
        target.describe(),
        max_ttl,
        size
    )
}

fn status_suffix(status: ProbeStatus) -> &'static str {
    match status {
        ProbeStatus::PacketTooBig => "!F",
        ProbeStatus::Unreachable(Unreachable::Host) => "!H",
        ProbeStatus::Unreachable(Unreachable::Network) => "!N",
        ProbeStatus::Unreachable(Unreachable::Port | Unreachable::Protocol) => "!P",
        ProbeStatus::Unreachable(Unreachable::Prohibited) => "!X",
        _ => "!U",
    }
}

pub fn hop_token(token: &HopToken) -> String {
    match token {
        HopToken::Rtt(rtt) => format!("{:.2}ms", ms(*rtt)),
        HopToken::Terminal(rtt, status) => format!("{:.2}ms {}", ms(*rtt), status_suffix(*status)),
        HopToken::TimedOut => " * ".to_string(),
        HopToken::Error => " E ".to_string(),
    }
}

/// One hop: every distinct responder on its own line(s), then the
/// `/`-joined per-probe tokens aligned at the RTT column.
pub fn trace_hop(hop: &HopReport) -> String {
    let mut out = format!("{:<4}", hop.ttl);
    let mut pad = TRACE_RTT_COLUMN;

    let named: Vec<_> = hop.named().collect();
    if named.is_empty() {
        out.push_str("*\n");
    }
    for (index, name) in named.iter().enumerate() {
        if index > 0 {
            out.push_str(TRACE_INDENT);
        }
        let asn = name
            .asn
            .map(|asn| format!("AS{}", asn))
            .unwrap_or_else(|| "*".to_string());

        match &name.hostname {
            Some(hostname) => {
                let _ = writeln!(out, "{:<width$}{}", hostname, asn, width = TRACE_NAME_WIDTH);
                let literal = format!("({})", name.address);
                out.push_str(TRACE_INDENT);
                out.push_str(&literal);
                if index + 1 == named.len() {
                    pad = TRACE_RTT_COLUMN.saturating_sub(literal.len() + TRACE_INDENT.len());
                } else {
                    out.push('\n');
                }
            }
            None => {
                let _ = writeln!(
                    out,
                    "{:<width$}{}",
                    name.address,
                    asn,
                    width = TRACE_NAME_WIDTH
                );
                pad = TRACE_RTT_COLUMN;
            }
        }
    }

    out.push_str(&" ".repeat(pad));
    let tokens: Vec<String> = hop.tokens.iter().map(hop_token).collect();
    out.push_str(&tokens.join("/"));
    out
}

pub fn trace_body(header: &str, hops: &[HopReport]) -> String {
    let mut out = header.to_string();
    for hop in hops {
        out.push('\n');
        out.push_str(&trace_hop(hop));
    }
    out
}

pub fn lookup_header(server: SocketAddr) -> String {
    format!("Address: {}#{}", server.ip(), server.port())
}

fn record_prefix(record_type: RecordType) -> String {
    match record_type {
        RecordType::A => "IP".to_string(),
        RecordType::AAAA => "IP6".to_string(),
        other => other.to_string(),
    }
}

/// Records grouped by type in first-seen order, then one `can't find` line
/// per failed query.
pub fn lookup_body(header: &str, answers: &[DnsAnswer], failures: &[(String, String)]) -> String {
    let mut order: Vec<RecordType> = Vec::new();
    for answer in answers {
        if !order.contains(&answer.record_type) {
            order.push(answer.record_type);
        }
    }

    let mut out = format!("{}\n\nRecords:\n", header);
    for record_type in order {
        let prefix = record_prefix(record_type);
        for answer in answers.iter().filter(|a| a.record_type == record_type) {
            let _ = writeln!(out, "{}:{}", prefix, answer.value);
        }
    }
    for (domain, reason) in failures {
        let _ = writeln!(out, "\ncan't find {}: {}", domain, reason);
    }
    out.trim_end().to_string()
}
