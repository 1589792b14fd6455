//! Configuration loading and management.

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level daemon configuration.
///
/// Every section and field has a default, so an empty file (or a missing
/// optional section) yields a runnable configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Rule backend configuration.
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// Log-driven threshold detector configuration.
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Background maintenance configuration.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Local network discovery configuration.
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API listener to.
    #[serde(default = "default_api_bind")]
    pub bind: SocketAddr,
    /// Bearer token required on mutating and listing endpoints.
    #[serde(default = "default_api_token")]
    pub token: String,
    /// Optional file to append structured logs to, alongside stderr.
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            token: default_api_token(),
            log_path: None,
        }
    }
}

fn default_api_bind() -> SocketAddr {
    "0.0.0.0:8000".parse().expect("valid default bind address")
}

fn default_api_token() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    tracing::warn!(
        "No api token configured - using an ephemeral random token. Clients will not be able to authenticate across restarts. Set [api].token in config.toml for production use."
    );
    token
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "dynfw.db".to_string()
}

/// Rule backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    /// Path to the iptables binary (IPv4).
    #[serde(default = "default_iptables_path")]
    pub iptables_path: String,
    /// Path to the ip6tables binary (IPv6).
    #[serde(default = "default_ip6tables_path")]
    pub ip6tables_path: String,
    /// Netfilter table to operate in.
    #[serde(default = "default_table")]
    pub table: String,
    /// Dedicated chain owned by this daemon. Rules outside it are never
    /// touched.
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Built-in chain the dedicated chain is jumped to from.
    #[serde(default = "default_input_chain")]
    pub input_chain: String,
    /// Timeout for a single filter command invocation, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Rule comment used when a block carries no reason.
    #[serde(default = "default_comment")]
    pub default_comment: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables_path: default_iptables_path(),
            ip6tables_path: default_ip6tables_path(),
            table: default_table(),
            chain: default_chain(),
            input_chain: default_input_chain(),
            command_timeout_secs: default_command_timeout_secs(),
            default_comment: default_comment(),
        }
    }
}

fn default_iptables_path() -> String {
    "/usr/sbin/iptables".to_string()
}

fn default_ip6tables_path() -> String {
    "/usr/sbin/ip6tables".to_string()
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_chain() -> String {
    "DYN_BLOCK".to_string()
}

fn default_input_chain() -> String {
    "INPUT".to_string()
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_comment() -> String {
    "dynfw".to_string()
}

/// Log-driven threshold detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Enable the detector task (default: true, requires `log_path`).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log file to follow for authentication failures.
    #[serde(default)]
    pub log_path: Option<String>,
    /// Case-insensitive substrings marking a line as a failure event.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    /// Failures within the window required to trigger a block.
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// Sliding window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// TTL applied to detector-issued blocks, in seconds.
    #[serde(default = "default_block_ttl_secs")]
    pub block_ttl_secs: i64,
    /// Reason recorded on detector-issued blocks.
    #[serde(default = "default_detector_reason")]
    pub reason: String,
    /// Log poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: None,
            patterns: default_patterns(),
            threshold: default_threshold(),
            window_secs: default_window_secs(),
            block_ttl_secs: default_block_ttl_secs(),
            reason: default_detector_reason(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_patterns() -> Vec<String> {
    [
        "Unauthorized",
        "Invalid token",
        "authentication failed",
        "Failed password",
        "Invalid user",
        "AUTH_FAILED",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_threshold() -> usize {
    5
}

fn default_window_secs() -> i64 {
    300
}

fn default_block_ttl_secs() -> i64 {
    7200
}

fn default_detector_reason() -> String {
    "auth_bruteforce".to_string()
}

fn default_poll_interval_ms() -> u64 {
    200
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Seconds between full orphan reconciliation passes.
    #[serde(default = "default_orphan_interval_secs")]
    pub orphan_interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            orphan_interval_secs: default_orphan_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_orphan_interval_secs() -> u64 {
    300
}

/// Local network discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Path to the arp-scan binary.
    #[serde(default = "default_arp_scan_path")]
    pub arp_scan_path: String,
    /// Timeout for one scan invocation, in seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            arp_scan_path: default_arp_scan_path(),
            timeout_secs: default_scan_timeout_secs(),
        }
    }
}

fn default_arp_scan_path() -> String {
    "/usr/sbin/arp-scan".to_string()
}

fn default_scan_timeout_secs() -> u64 {
    15
}
