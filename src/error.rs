//! Error types shared across the probe, lookup and chat layers.

use std::path::PathBuf;
use thiserror::Error;

use crate::chat::transport::ChatId;
use crate::chat::RequestId;

/// Decoding failures for ICMP / ICMPv6 packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Malformed packet: expected at least {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
}

/// The caller revoked the operation.
///
/// This is the only error that escapes a probe or a traceroute ladder; every
/// other fault is folded into a [`crate::probe::ProbeStatus`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled")]
pub struct Cancelled;

/// Chat room bookkeeping errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Controller {request} was never admitted to chat {chat}")]
    NotAdmitted { request: RequestId, chat: ChatId },
}

/// Resolver and registry transport errors.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("DNS query failed: {0}")]
    Dns(String),

    #[error("Whois query to {server} failed: {source}")]
    Whois {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Lookup timed out")]
    Timeout,
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid network {0:?} in address policy")]
    InvalidNetwork(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message() {
        let err = PacketError::Malformed {
            expected: 8,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Malformed packet: expected at least 8 bytes, got 3"
        );
    }

    #[test]
    fn test_lookup_error_source() {
        use std::error::Error as _;

        let err = LookupError::Whois {
            server: "172.22.137.116:43".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("Whois query to 172.22.137.116:43"));
    }
}
