use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Chat-driven ping, traceroute and DNS lookups for a restricted address space
#[derive(Parser, Debug, Clone)]
#[command(name = "netdiag")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Chat id used by the console transport
    #[arg(long = "chat", default_value = "0")]
    pub chat: i64,

    /// Sweep interval in seconds (overrides the config file)
    #[arg(long = "sweep-interval")]
    pub sweep_interval: Option<f64>,
}

impl Args {
    pub fn sweep_interval_duration(&self) -> Option<Duration> {
        self.sweep_interval.map(Duration::from_secs_f64)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if let Some(secs) = self.sweep_interval {
            if !secs.is_finite() || secs <= 0.0 {
                return Err("Sweep interval must be positive".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["netdiag"]);
        assert!(args.config.is_none());
        assert_eq!(args.log_level, "info");
        assert_eq!(args.chat, 0);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_sweep_override() {
        let args = Args::parse_from(["netdiag", "--sweep-interval", "2.5", "--chat", "-42"]);
        assert_eq!(args.sweep_interval_duration(), Some(Duration::from_millis(2500)));
        assert_eq!(args.chat, -42);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let args = Args::parse_from(["netdiag", "--sweep-interval", "0"]);
        assert!(args.validate().is_err());
    }
}
