//! Proxy configuration.
//!
//! The binary deserializes this from YAML and hands it over fully
//! populated; the engine never touches the file itself.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport used toward DNSCrypt servers for queries arriving over UDP.
/// TCP clients always get TCP upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MainProto {
    Udp,
    Tcp,
}

/// Log line layout for query/block sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Tsv,
    Ltsv,
}

/// A statically configured upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticServer {
    pub name: String,
    pub stamp: String,
}

/// A remote server-list source mirrored to a local file by the
/// prefetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    pub cache_file: PathBuf,
    /// How long a fetched copy stays fresh.
    pub cache_duration: Duration,
}

/// Full proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local addresses serving plaintext DNS over UDP and TCP.
    pub listen_addresses: Vec<SocketAddr>,

    /// Upper bound on concurrently served client queries.
    pub max_clients: u32,

    /// Per-exchange deadline toward upstreams.
    pub timeout: Duration,

    /// Upstream transport for UDP clients.
    pub main_proto: MainProto,

    /// Certificate refresh cadence while at least one server is live.
    pub cert_refresh_delay: Duration,

    /// Refresh cadence while no server is live.
    pub cert_refresh_delay_after_failure: Duration,

    /// Accept certificates outside their validity window (only useful on
    /// systems without a trustworthy clock).
    pub cert_ignore_timestamp: bool,

    /// Statically configured servers.
    pub servers: Vec<StaticServer>,

    /// Remote sources mirrored by the prefetcher.
    pub sources: Vec<SourceConfig>,

    /// Shared response cache.
    pub cache: bool,
    pub cache_size: usize,
    pub cache_min_ttl: u32,
    pub cache_max_ttl: u32,
    pub cache_neg_ttl: u32,

    /// Answer AAAA queries locally with an empty response.
    pub block_ipv6: bool,

    /// Domain blocklist and its optional log.
    pub block_name_file: Option<PathBuf>,
    pub block_name_log_file: Option<PathBuf>,
    pub block_name_log_format: LogFormat,

    /// Response-IP blocklist and its optional log.
    pub block_ip_file: Option<PathBuf>,
    pub block_ip_log_file: Option<PathBuf>,
    pub block_ip_log_format: LogFormat,

    /// Domain-suffix forwarding rules.
    pub forward_file: Option<PathBuf>,

    /// Query log.
    pub query_log_file: Option<PathBuf>,
    pub query_log_format: LogFormat,
    pub query_log_ignored_qtypes: Vec<String>,

    /// NXDOMAIN log.
    pub nx_log_file: Option<PathBuf>,
    pub nx_log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addresses: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                53,
            )],
            max_clients: 250,
            timeout: Duration::from_millis(2500),
            main_proto: MainProto::Udp,
            cert_refresh_delay: Duration::from_secs(30 * 60),
            cert_refresh_delay_after_failure: Duration::from_secs(10),
            cert_ignore_timestamp: false,
            servers: Vec::new(),
            sources: Vec::new(),
            cache: true,
            cache_size: 512,
            cache_min_ttl: 60,
            cache_max_ttl: 8600,
            cache_neg_ttl: 60,
            block_ipv6: false,
            block_name_file: None,
            block_name_log_file: None,
            block_name_log_format: LogFormat::Tsv,
            block_ip_file: None,
            block_ip_log_file: None,
            block_ip_log_format: LogFormat::Tsv,
            forward_file: None,
            query_log_file: None,
            query_log_format: LogFormat::Tsv,
            query_log_ignored_qtypes: Vec::new(),
            nx_log_file: None,
            nx_log_format: LogFormat::Tsv,
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot start with.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addresses.is_empty() {
            return Err("no listen addresses configured".into());
        }
        if self.max_clients == 0 {
            return Err("max_clients must be at least 1".into());
        }
        if self.cache_min_ttl > self.cache_max_ttl {
            return Err("cache_min_ttl exceeds cache_max_ttl".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero".into());
        }
        Ok(())
    }
}
