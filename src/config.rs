use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::chat::AddressPolicy;
use crate::cli::Args;
use crate::error::ConfigError;

/// Forward/reverse DNS settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Default name server for lookups and hop names
    pub server: SocketAddr,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([172, 20, 0, 53], 53)),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Registry queried for origin ASNs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WhoisConfig {
    pub server: SocketAddr,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for WhoisConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([172, 22, 137, 116], 43)),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Destinations users may probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// CIDR blocks
    pub networks: Vec<String>,
    pub domain_suffixes: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            networks: vec![
                "172.20.0.0/14".to_string(),
                "10.0.0.0/8".to_string(),
                "fd00::/8".to_string(),
            ],
            domain_suffixes: vec![".dn42".to_string()],
        }
    }
}

impl PolicyConfig {
    pub fn address_policy(&self) -> Result<AddressPolicy, ConfigError> {
        AddressPolicy::parse(self.networks.as_slice(), self.domain_suffixes.as_slice())
    }
}

/// Runtime configuration, loaded from TOML with every field defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often finished sessions are retired
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
    /// Lifetime of cached hop names and ASNs
    #[serde(with = "duration_serde")]
    pub lookup_cache_ttl: Duration,
    pub dns: DnsConfig,
    pub whois: WhoisConfig,
    pub policy: PolicyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            lookup_cache_ttl: Duration::from_secs(3600),
            dns: DnsConfig::default(),
            whois: WhoisConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `--config` when given, then apply command line overrides
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(interval) = args.sweep_interval_duration() {
            config.sweep_interval = interval;
        }
        Ok(config)
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
