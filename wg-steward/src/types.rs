// Shared types between engine components

//! Shared data structures
//!
//! This module defines the small enums every component agrees on (protocol
//! variant, peer status) and the daemon settings structures deserialized
//! from the TOML settings file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Tunnel protocol variant of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Standard WireGuard (`wg`, `wg-quick`)
    Wg,
    /// Obfuscated AmneziaWG (`awg`, `awg-quick`), adds Jc/Jmin/Jmax/S1/S2/H1-H4
    Awg,
}

impl Protocol {
    /// Name of the peer-management utility
    pub fn tool(self) -> &'static str {
        match self {
            Protocol::Wg => "wg",
            Protocol::Awg => "awg",
        }
    }

    /// Name of the interface up/down/save utility
    pub fn quick_tool(self) -> &'static str {
        match self {
            Protocol::Wg => "wg-quick",
            Protocol::Awg => "awg-quick",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool())
    }
}

/// Liveness of a peer, derived from handshake recency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Handshake within the last two minutes
    Running,
    /// No recent handshake, or the peer is restricted
    #[default]
    Stopped,
}

impl PeerStatus {
    /// Lower-case name as stored and rendered
    pub fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Running => "running",
            PeerStatus::Stopped => "stopped",
        }
    }
}

/// Main settings structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub peers: PeerDefaults,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Paths, logging and start-up behaviour
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_wg_conf_path")]
    pub wg_conf_path: PathBuf,
    /// Directory of obfuscated-protocol configurations (skipped when unset)
    #[serde(default)]
    pub awg_conf_path: Option<PathBuf>,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Configurations brought up at daemon start
    #[serde(default)]
    pub autostart: Vec<String>,
    /// Per-invocation timeout for external commands (seconds)
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

/// Defaults applied to peers discovered in a config file or created without explicit settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PeerDefaults {
    #[serde(default = "default_dns")]
    pub dns: String,
    #[serde(default = "default_endpoint_allowed_ip")]
    pub endpoint_allowed_ip: String,
    #[serde(default = "default_mtu")]
    pub mtu: i64,
    #[serde(default = "default_keepalive")]
    pub keepalive: i64,
    /// Public host clients use to reach this server
    #[serde(default)]
    pub remote_endpoint: String,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            dns: default_dns(),
            endpoint_allowed_ip: default_endpoint_allowed_ip(),
            mtu: default_mtu(),
            keepalive: default_keepalive(),
            remote_endpoint: String::new(),
        }
    }
}

/// Background loop timing
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Seconds between metric polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds between job evaluations
    #[serde(default = "default_job_interval")]
    pub job_interval: u64,
    /// Consecutive failed lookups before an orphaned job is expired
    #[serde(default = "default_orphan_job_max_misses")]
    pub orphan_job_max_misses: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            job_interval: default_job_interval(),
            orphan_job_max_misses: default_orphan_job_max_misses(),
        }
    }
}

// Default values for settings
fn default_wg_conf_path() -> PathBuf {
    PathBuf::from("/etc/wireguard")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/wg-steward/steward.db")
}

fn default_download_path() -> PathBuf {
    PathBuf::from("/var/lib/wg-steward/download")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_timeout() -> u64 {
    30
}

fn default_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_endpoint_allowed_ip() -> String {
    "0.0.0.0/0".to_string()
}

fn default_mtu() -> i64 {
    1420
}

fn default_keepalive() -> i64 {
    21
}

fn default_poll_interval() -> u64 {
    10
}

fn default_job_interval() -> u64 {
    180 // 3 minutes
}

fn default_orphan_job_max_misses() -> u32 {
    5
}
