//! Semantic probe outcome and the (type, code) tables that produce it.

use std::fmt;

use crate::probe::icmp::IcmpKind;

/// Destination Unreachable reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unreachable {
    /// Generic unreachable with no more specific code
    Destination,
    Network,
    Host,
    Protocol,
    Port,
    /// Administratively prohibited (ICMPv6 code 1)
    Prohibited,
}

/// Outcome of a single echo probe.
///
/// Timeouts and router errors are ordinary values here, never `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    Success,
    TimedOut,
    PacketTooBig,
    Unreachable(Unreachable),
    TtlExpired,
    ParameterProblem,
    SourceQuench,
    /// Unmapped reply type or internal socket fault
    Unknown,
}

impl ProbeStatus {
    /// Map an ICMPv4 reply.
    pub fn from_icmpv4(kind: IcmpKind) -> Self {
        match (kind.icmp_type(), kind.code()) {
            (0, _) => Self::Success,
            (3, 0) => Self::Unreachable(Unreachable::Network),
            (3, 1) => Self::Unreachable(Unreachable::Host),
            (3, 2) => Self::Unreachable(Unreachable::Protocol),
            (3, 3) => Self::Unreachable(Unreachable::Port),
            // Fragmentation needed and DF set
            (3, 4) => Self::PacketTooBig,
            (3, _) => Self::Unreachable(Unreachable::Destination),
            (4, _) => Self::SourceQuench,
            // Redirects are reported like an expired TTL
            (5, _) | (11, _) => Self::TtlExpired,
            (12, _) => Self::ParameterProblem,
            _ => Self::Unknown,
        }
    }

    /// Map an ICMPv6 reply.
    pub fn from_icmpv6(kind: IcmpKind) -> Self {
        match (kind.icmp_type(), kind.code()) {
            (1, 1) => Self::Unreachable(Unreachable::Prohibited),
            (1, _) => Self::Unreachable(Unreachable::Destination),
            (2, _) => Self::PacketTooBig,
            (3, _) => Self::TtlExpired,
            (4, _) => Self::ParameterProblem,
            (129, _) => Self::Success,
            _ => Self::Unknown,
        }
    }

    pub fn is_unreachable(self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    /// Statuses that end a traceroute even short of the destination
    pub fn terminates_trace(self) -> bool {
        matches!(self, Self::PacketTooBig | Self::Unreachable(_))
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Success => "Success",
            Self::TimedOut => "Timed out",
            Self::PacketTooBig => "Packet too big",
            Self::Unreachable(Unreachable::Destination) => "Destination unreachable",
            Self::Unreachable(Unreachable::Network) => "Network unreachable",
            Self::Unreachable(Unreachable::Host) => "Host unreachable",
            Self::Unreachable(Unreachable::Protocol) => "Protocol unreachable",
            Self::Unreachable(Unreachable::Port) => "Port unreachable",
            Self::Unreachable(Unreachable::Prohibited) => "Destination prohibited",
            Self::TtlExpired => "TTL expired",
            Self::ParameterProblem => "Parameter problem",
            Self::SourceQuench => "Source quench",
            Self::Unknown => "Unknown",
        };
        f.write_str(text)
    }
}
