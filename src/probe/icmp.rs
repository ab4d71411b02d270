//! ICMP and ICMPv6 echo / error packet codec.
//!
//! Both packet kinds carry the ICMP type and code as a single combined value
//! (`type << 8 | code`), see [`IcmpKind`].

use std::fmt;

use crate::error::PacketError;

/// ICMP header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Fixed ICMPv6 region (type, code, checksum); the rest is carried as payload
pub const ICMPV6_FIXED_SIZE: usize = 4;
/// Smallest ICMPv6 message accepted on the wire
pub const ICMPV6_MIN_SIZE: usize = 8;
/// Default payload size (standard ping)
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;

/// ICMP type and code packed into 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpKind(u16);

impl IcmpKind {
    pub const ECHO_REPLY: Self = Self::new(0, 0);
    pub const DEST_UNREACHABLE: Self = Self::new(3, 0);
    pub const ECHO_REQUEST: Self = Self::new(8, 0);
    pub const TIME_EXCEEDED: Self = Self::new(11, 0);
    pub const PARAMETER_PROBLEM: Self = Self::new(12, 0);

    pub const V6_DEST_UNREACHABLE: Self = Self::new(1, 0);
    pub const V6_PACKET_TOO_BIG: Self = Self::new(2, 0);
    pub const V6_TIME_EXCEEDED: Self = Self::new(3, 0);
    pub const V6_ECHO_REQUEST: Self = Self::new(128, 0);
    pub const V6_ECHO_REPLY: Self = Self::new(129, 0);

    pub const fn new(icmp_type: u8, code: u8) -> Self {
        Self(((icmp_type as u16) << 8) | code as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn icmp_type(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn code(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// True for the ICMPv4 error types that quote the original datagram
    /// (Destination Unreachable, Time Exceeded, Parameter Problem).
    pub const fn is_v4_error(self) -> bool {
        matches!(self.icmp_type(), 3 | 11 | 12)
    }
}

impl fmt::Display for IcmpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={} code={}", self.icmp_type(), self.code())
    }
}

/// Internet checksum (RFC 1071).
///
/// Sums big-endian 16-bit words, pads an odd trailing byte with a zero low
/// byte, folds carries and returns the ones' complement.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// True when a buffer with its checksum field filled in sums to zero.
pub fn verify_checksum(data: &[u8]) -> bool {
    checksum(data) == 0
}

/// ICMPv4 packet with echo identifier and sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
    pub kind: IcmpKind,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    raw: Vec<u8>,
}

impl IcmpPacket {
    /// Build a fully checksummed packet.
    pub fn create(kind: IcmpKind, identifier: u16, sequence: u16, payload: &[u8]) -> Self {
        let mut raw = vec![0u8; ICMP_HEADER_SIZE + payload.len()];
        raw[0..2].copy_from_slice(&kind.raw().to_be_bytes());
        raw[4..6].copy_from_slice(&identifier.to_be_bytes());
        raw[6..8].copy_from_slice(&sequence.to_be_bytes());
        raw[ICMP_HEADER_SIZE..].copy_from_slice(payload);

        let cksum = checksum(&raw);
        raw[2..4].copy_from_slice(&cksum.to_be_bytes());

        Self {
            kind,
            checksum: cksum,
            identifier,
            sequence,
            raw,
        }
    }

    /// Decode a packet. The carried checksum is reported verbatim, not verified.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err(PacketError::Malformed {
                expected: ICMP_HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            kind: IcmpKind::from_raw(u16::from_be_bytes([data[0], data[1]])),
            checksum: u16::from_be_bytes([data[2], data[3]]),
            identifier: u16::from_be_bytes([data[4], data[5]]),
            sequence: u16::from_be_bytes([data[6], data[7]]),
            raw: data.to_vec(),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[ICMP_HEADER_SIZE..]
    }

    /// Wire bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// ICMPv6 packet.
///
/// There is no top-level identifier or sequence: everything after the 4-byte
/// fixed region is payload. The checksum is left zero on [`create`] because the
/// kernel fills it in for raw ICMPv6 sockets (it covers the IPv6 pseudo-header).
///
/// [`create`]: Icmpv6Packet::create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv6Packet {
    pub kind: IcmpKind,
    pub checksum: u16,
    raw: Vec<u8>,
}

impl Icmpv6Packet {
    /// Build a packet. Short payloads are zero-padded to the 8-byte minimum.
    pub fn create(kind: IcmpKind, payload: &[u8]) -> Self {
        let len = (ICMPV6_FIXED_SIZE + payload.len()).max(ICMPV6_MIN_SIZE);
        let mut raw = vec![0u8; len];
        raw[0..2].copy_from_slice(&kind.raw().to_be_bytes());
        raw[ICMPV6_FIXED_SIZE..ICMPV6_FIXED_SIZE + payload.len()].copy_from_slice(payload);

        Self {
            kind,
            checksum: 0,
            raw,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < ICMPV6_MIN_SIZE {
            return Err(PacketError::Malformed {
                expected: ICMPV6_MIN_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            kind: IcmpKind::from_raw(u16::from_be_bytes([data[0], data[1]])),
            checksum: u16::from_be_bytes([data[2], data[3]]),
            raw: data.to_vec(),
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[ICMPV6_FIXED_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

/// Echo payload of `size` bytes filled with an incrementing pattern
pub fn echo_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}
