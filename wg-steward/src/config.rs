// Daemon settings parser

//! Settings file parsing and validation
//!
//! This module handles loading the daemon's TOML settings file and
//! validating its contents: paths, loop intervals, and the peer defaults
//! that get written into the store for newly discovered peers.

use crate::ip_alloc::parse_cidr_list;
use crate::types::Config;
use crate::wg_controller::validate_interface_name;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Largest MTU a peer may be configured with
pub const MAX_PEER_MTU: i64 = 1460;

/// Load settings from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate settings values
fn validate_config(config: &Config) -> Result<()> {
    if config.server.wg_conf_path.as_os_str().is_empty() {
        anyhow::bail!("server.wg_conf_path cannot be empty");
    }

    if config.server.database_path.as_os_str().is_empty() {
        anyhow::bail!("server.database_path cannot be empty");
    }

    if config.server.command_timeout == 0 {
        anyhow::bail!("server.command_timeout must be > 0");
    }

    for name in &config.server.autostart {
        validate_interface_name(name)
            .with_context(|| format!("Invalid autostart configuration name: {}", name))?;
    }

    if config.scheduler.poll_interval == 0 {
        anyhow::bail!("scheduler.poll_interval must be > 0");
    }

    if config.scheduler.job_interval == 0 {
        anyhow::bail!("scheduler.job_interval must be > 0");
    }

    if !(0..=MAX_PEER_MTU).contains(&config.peers.mtu) {
        anyhow::bail!(
            "peers.mtu must be between 0 and {}, got {}",
            MAX_PEER_MTU,
            config.peers.mtu
        );
    }

    if config.peers.keepalive < 0 {
        anyhow::bail!("peers.keepalive cannot be negative");
    }

    parse_cidr_list(&config.peers.endpoint_allowed_ip).with_context(|| {
        format!(
            "Invalid peers.endpoint_allowed_ip: {}",
            config.peers.endpoint_allowed_ip
        )
    })?;

    Ok(())
}
