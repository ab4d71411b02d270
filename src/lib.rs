//! Chat-driven ICMP ping/traceroute and DNS diagnostics.

pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod lookup;
pub mod probe;
pub mod trace;
