//! Argument parsing for `ping`, `trace` and `nslookup`/`dig`, and the address
//! policy every destination must pass before it is probed.

use hickory_resolver::proto::rr::RecordType;
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::error::ConfigError;
use crate::lookup::AddressFamily;

/// Which diagnostic a command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Trace,
    Lookup,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ping" => Some(Self::Ping),
            "trace" | "traceroute" => Some(Self::Trace),
            "nslookup" | "dig" => Some(Self::Lookup),
            _ => None,
        }
    }
}

/// User input errors. `Display` is the text shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    #[error("Error: missing value for option \"-{0}\"")]
    MissingValue(String),

    #[error("Error: option \"-{0}\" specified multiple times")]
    Duplicate(String),

    #[error("Error: options \"-4\" and \"-6\" are mutually exclusive")]
    ConflictingFamily,

    #[error("Error: unexpected option \"{0}\"")]
    UnknownOption(String),

    #[error("Error: invalid {what} value \"{value}\"")]
    InvalidValue { what: &'static str, value: String },

    #[error("Error: invalid ip address format \"{0}\"")]
    InvalidServer(String),

    #[error("Error: invalid record type \"{0}\"")]
    InvalidRecordType(String),

    #[error("Error: invalid ns port \"{0}\"")]
    InvalidPort(String),

    #[error("Error: multiple destination specified")]
    MultipleDestinations,

    #[error("Error: IP address out of range")]
    OutOfRange,

    #[error("Error: invalid destination \"{0}\"")]
    InvalidDestination(String),

    #[error("Error: invalid domain \"{0}\"")]
    InvalidDomain(String),

    #[error("Error: missing destination")]
    MissingDestination,

    #[error("Error: missing domain")]
    MissingDomain,
}

impl ArgError {
    /// Whether the usage text should follow the error
    pub fn shows_usage(&self) -> bool {
        !matches!(self, Self::Duplicate(_) | Self::ConflictingFamily)
    }
}

/// Networks and domain suffixes that may be probed or queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPolicy {
    networks: Vec<IpNetwork>,
    suffixes: Vec<String>,
}

impl AddressPolicy {
    pub fn new(networks: Vec<IpNetwork>, suffixes: Vec<String>) -> Self {
        Self { networks, suffixes }
    }

    /// Build from textual CIDRs, as found in the config file
    pub fn parse<S: AsRef<str>>(networks: &[S], suffixes: &[S]) -> Result<Self, ConfigError> {
        let networks = networks
            .iter()
            .map(|n| {
                IpNetwork::from_str(n.as_ref())
                    .map_err(|_| ConfigError::InvalidNetwork(n.as_ref().to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let suffixes = suffixes.iter().map(|s| s.as_ref().to_string()).collect();
        Ok(Self::new(networks, suffixes))
    }

    pub fn permits(&self, address: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(address))
    }

    /// A permitted host name ends with one of the suffixes and has at least one
    /// label in front of it.
    pub fn permits_domain(&self, name: &str) -> bool {
        self.suffixes.iter().any(|suffix| {
            name.len() > suffix.len()
                && name
                    .get(name.len() - suffix.len()..)
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
        })
    }
}

impl Default for AddressPolicy {
    fn default() -> Self {
        let networks = ["172.20.0.0/14", "10.0.0.0/8", "fd00::/8"]
            .iter()
            .filter_map(|n| IpNetwork::from_str(n).ok())
            .collect();
        Self::new(networks, vec![".dn42".to_string()])
    }
}

/// A probe target as typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Address(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingRequest {
    pub destination: Destination,
    pub family: AddressFamily,
    pub count: u32,
    pub size: usize,
    pub dont_fragment: bool,
    pub timeout: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub destination: Destination,
    pub family: AddressFamily,
    pub first_ttl: u8,
    pub max_ttl: u8,
    pub size: usize,
    pub timeout: Duration,
    pub queries: u8,
    pub interval: Duration,
    pub dont_fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    pub domain: String,
    pub server: Option<IpAddr>,
    pub port: u16,
    /// Distinct, in the order given
    pub record_types: Vec<RecordType>,
}

enum Token<'a> {
    Flag(&'a str),
    Value(&'a str, &'a str),
    Positional(&'a str),
}

/// Split whitespace-separated arguments into flags, option/value pairs and
/// positionals. Options listed in `repeatable` may appear more than once.
fn scan<'a>(
    args: &'a str,
    flags: &[&str],
    valued: &[&str],
    repeatable: &[&str],
) -> Result<Vec<Token<'a>>, ArgError> {
    let mut tokens = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut pending: Option<&str> = None;

    for word in args.split_whitespace() {
        if let Some(name) = word.strip_prefix('-') {
            if let Some(waiting) = pending {
                return Err(ArgError::MissingValue(waiting.to_string()));
            }
            if !flags.contains(&name) && !valued.contains(&name) {
                return Err(ArgError::UnknownOption(word.to_string()));
            }
            if !seen.insert(name) && !repeatable.contains(&name) {
                return Err(ArgError::Duplicate(name.to_string()));
            }
            if flags.contains(&name) {
                tokens.push(Token::Flag(name));
            } else {
                pending = Some(name);
            }
            continue;
        }

        match pending.take() {
            Some(name) => tokens.push(Token::Value(name, word)),
            None => tokens.push(Token::Positional(word)),
        }
    }

    if let Some(waiting) = pending {
        return Err(ArgError::MissingValue(waiting.to_string()));
    }
    Ok(tokens)
}

fn number<T: FromStr + PartialOrd>(what: &'static str, value: &str, min: T) -> Result<T, ArgError> {
    value
        .parse::<T>()
        .ok()
        .filter(|v| *v >= min)
        .ok_or_else(|| ArgError::InvalidValue {
            what,
            value: value.to_string(),
        })
}

/// Echo data that fits one IPv4 datagram (65535 - 20 - 8); also within the
/// IPv6 limit
pub const MAX_PAYLOAD_SIZE: usize = 65507;

fn payload_size(value: &str, min: usize) -> Result<usize, ArgError> {
    number("size", value, min).and_then(|size| {
        if size > MAX_PAYLOAD_SIZE {
            Err(ArgError::InvalidValue {
                what: "size",
                value: value.to_string(),
            })
        } else {
            Ok(size)
        }
    })
}

fn millis(what: &'static str, value: &str, min: u64) -> Result<Duration, ArgError> {
    number(what, value, min).map(Duration::from_millis)
}

fn family(flag: &str, current: AddressFamily) -> Result<AddressFamily, ArgError> {
    let wanted = if flag == "4" {
        AddressFamily::V4
    } else {
        AddressFamily::V6
    };
    match current {
        AddressFamily::Any => Ok(wanted),
        _ => Err(ArgError::ConflictingFamily),
    }
}

fn destination(
    word: &str,
    policy: &AddressPolicy,
    current: &mut Option<Destination>,
) -> Result<(), ArgError> {
    let parsed = if let Ok(address) = word.parse::<IpAddr>() {
        if current.is_some() {
            return Err(ArgError::MultipleDestinations);
        }
        if !policy.permits(address) {
            return Err(ArgError::OutOfRange);
        }
        Destination::Address(address)
    } else if policy.permits_domain(word) {
        if current.is_some() {
            return Err(ArgError::MultipleDestinations);
        }
        Destination::Domain(word.to_string())
    } else {
        return Err(ArgError::InvalidDestination(word.to_string()));
    };
    *current = Some(parsed);
    Ok(())
}

/// `ping [-c count] [-s size] [-F] [-t timeoutMs] [-i intervalMs] [-4|-6] <dest>`
pub fn parse_ping(args: &str, policy: &AddressPolicy) -> Result<PingRequest, ArgError> {
    let tokens = scan(args, &["F", "4", "6"], &["c", "s", "t", "i"], &[])?;

    let mut dest = None;
    let mut request = PingRequest {
        destination: Destination::Domain(String::new()),
        family: AddressFamily::Any,
        count: 4,
        size: 56,
        dont_fragment: false,
        timeout: Duration::from_millis(2000),
        interval: Duration::from_millis(500),
    };

    for token in tokens {
        match token {
            Token::Flag("F") => request.dont_fragment = true,
            Token::Flag(flag) => request.family = family(flag, request.family)?,
            Token::Value("c", v) => request.count = number("count", v, 1)?,
            Token::Value("s", v) => request.size = payload_size(v, 1)?,
            Token::Value("t", v) => request.timeout = millis("timeout", v, 1)?,
            Token::Value(_, v) => request.interval = millis("interval", v, 0)?,
            Token::Positional(word) => destination(word, policy, &mut dest)?,
        }
    }

    request.destination = dest.ok_or(ArgError::MissingDestination)?;
    Ok(request)
}

/// `trace [-f firstTTL] [-m maxTTL] [-s size] [-t timeoutMs] [-q queries]
/// [-i intervalMs] [-F] [-4|-6] <dest>`
pub fn parse_trace(args: &str, policy: &AddressPolicy) -> Result<TraceRequest, ArgError> {
    let tokens = scan(
        args,
        &["F", "4", "6"],
        &["f", "m", "s", "t", "q", "i"],
        &[],
    )?;

    let mut dest = None;
    let mut request = TraceRequest {
        destination: Destination::Domain(String::new()),
        family: AddressFamily::Any,
        first_ttl: 1,
        max_ttl: 10,
        size: 56,
        timeout: Duration::from_millis(2000),
        queries: 1,
        interval: Duration::from_millis(50),
        dont_fragment: false,
    };

    for token in tokens {
        match token {
            Token::Flag("F") => request.dont_fragment = true,
            Token::Flag(flag) => request.family = family(flag, request.family)?,
            Token::Value("f", v) => request.first_ttl = number("firstTTL", v, 1)?,
            Token::Value("m", v) => request.max_ttl = number("maxTTL", v, 1)?,
            Token::Value("s", v) => request.size = payload_size(v, 0)?,
            Token::Value("t", v) => request.timeout = millis("timeout", v, 1)?,
            Token::Value("q", v) => request.queries = number("query count", v, 1)?,
            Token::Value(_, v) => request.interval = millis("interval", v, 0)?,
            Token::Positional(word) => destination(word, policy, &mut dest)?,
        }
    }

    request.destination = dest.ok_or(ArgError::MissingDestination)?;
    Ok(request)
}

/// `nslookup|dig [-t type]... [-s server] [-p port] <domain>`
pub fn parse_lookup(args: &str, policy: &AddressPolicy) -> Result<LookupRequest, ArgError> {
    let tokens = scan(args, &[], &["t", "s", "p"], &["t"])?;

    let mut request = LookupRequest {
        domain: String::new(),
        server: None,
        port: 53,
        record_types: Vec::new(),
    };

    for token in tokens {
        match token {
            Token::Value("s", v) => {
                request.server = Some(
                    v.parse()
                        .map_err(|_| ArgError::InvalidServer(v.to_string()))?,
                );
            }
            Token::Value("t", v) => {
                let record_type = RecordType::from_str(&v.to_ascii_uppercase())
                    .ok()
                    .filter(|t| !matches!(t, RecordType::Unknown(_)))
                    .ok_or_else(|| ArgError::InvalidRecordType(v.to_string()))?;
                if !request.record_types.contains(&record_type) {
                    request.record_types.push(record_type);
                }
            }
            Token::Value(_, v) => {
                request.port = v.parse().map_err(|_| ArgError::InvalidPort(v.to_string()))?;
            }
            Token::Positional(word) if policy.permits_domain(word) => {
                if !request.domain.is_empty() {
                    return Err(ArgError::MultipleDestinations);
                }
                request.domain = word.to_string();
            }
            Token::Positional(word) => return Err(ArgError::InvalidDomain(word.to_string())),
            Token::Flag(_) => {}
        }
    }

    if request.domain.is_empty() {
        return Err(ArgError::MissingDomain);
    }
    if request.record_types.is_empty() {
        request.record_types = vec![RecordType::A, RecordType::AAAA];
    }
    Ok(request)
}
