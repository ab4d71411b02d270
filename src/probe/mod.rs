pub mod engine;
pub mod icmp;
pub mod socket;
pub mod status;

pub use engine::{IcmpProber, ProbeOptions, ProbeReply, Prober, ReplyOptions};
pub use icmp::{IcmpKind, IcmpPacket, Icmpv6Packet, checksum, verify_checksum};
pub use socket::check_permissions;
pub use status::{ProbeStatus, Unreachable};
