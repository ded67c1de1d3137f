// WireGuard interface and peer controller

//! WireGuard interface control and statistics
//!
//! This module drives the tunnel utilities: bringing interfaces up and down
//! with `wg-quick`/`awg-quick`, adding and removing peers with `wg set`,
//! persisting the running state back to the configuration file, and reading
//! per-peer transfer counters, handshakes and endpoints.
//!
//! Every invocation runs under a timeout. A non-zero exit becomes
//! [`Error::ExternalCommand`] carrying the utility's stderr verbatim.

use crate::error::{Error, Result};
use crate::types::Protocol;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use wireguard_control::{Backend, Device, InterfaceName};

/// Longest interface name the kernel accepts
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Validates that a name is safe to use in shell commands and SQL identifiers.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field_name)));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(Error::validation(format!(
            "{} '{}' is longer than {} characters",
            field_name, name, MAX_INTERFACE_NAME_LEN
        )));
    }

    // Check for valid characters: alphanumeric, hyphen, underscore
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(format!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name, name
        )));
    }

    Ok(())
}

/// Validates a configuration (interface) name.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the name is empty, longer than 15
/// characters, or contains anything but alphanumerics, hyphens and underscores.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")
}

/// Cumulative byte counters of one peer since the interface came up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransfer {
    pub public_key: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Last handshake of one peer; `epoch_secs == 0` means never
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    pub public_key: String,
    pub epoch_secs: i64,
}

/// Last observed endpoint of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub public_key: String,
    pub endpoint: String,
}

/// Operations on live interfaces
///
/// Implemented by [`WgController`] against the real utilities; tests swap in
/// a recording fake.
#[async_trait]
pub trait NetworkControl: Send + Sync {
    /// Whether the interface currently exists with an address
    async fn is_up(&self, iface: &str) -> bool;

    /// `wg-quick up <file>`
    async fn bring_up(&self, protocol: Protocol, conf_path: &Path) -> Result<()>;

    /// `wg-quick down <file>`
    async fn bring_down(&self, protocol: Protocol, conf_path: &Path) -> Result<()>;

    /// Add or update a peer on the live interface
    async fn set_peer(
        &self,
        protocol: Protocol,
        iface: &str,
        public_key: &str,
        allowed_ips: &str,
        preshared_key: Option<&str>,
    ) -> Result<()>;

    /// Remove a peer from the live interface
    async fn remove_peer(&self, protocol: Protocol, iface: &str, public_key: &str) -> Result<()>;

    /// Write the live state back into the configuration file
    async fn save(&self, protocol: Protocol, conf_path: &Path) -> Result<()>;

    /// Per-peer transfer counters
    async fn transfer(&self, protocol: Protocol, iface: &str) -> Result<Vec<PeerTransfer>>;

    /// Per-peer latest handshakes
    async fn latest_handshakes(&self, protocol: Protocol, iface: &str)
        -> Result<Vec<PeerHandshake>>;

    /// Per-peer endpoints (peers without one are omitted)
    async fn endpoints(&self, protocol: Protocol, iface: &str) -> Result<Vec<PeerEndpoint>>;
}

/// Controller backed by the `wg`/`awg` command-line utilities
pub struct WgController {
    timeout: Duration,
}

impl WgController {
    /// Create a controller whose commands give up after `timeout_secs`
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Run a utility, optionally feeding `stdin`, and return its stdout
    async fn run(&self, program: &str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let command_line = format!("{} {}", program, args.join(" "));
        log::debug!("Running: {}", command_line);

        let mut command = Command::new(program);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let invocation = async {
            let mut child = command.spawn()?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input.as_bytes()).await?;
                // Close stdin so the utility sees EOF
                drop(pipe);
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, invocation).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::ExternalCommand {
                    command: command_line,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ExternalCommand {
                    command: command_line,
                    detail: format!("timed out after {}s", self.timeout.as_secs()),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr
            };
            return Err(Error::ExternalCommand {
                command: command_line,
                detail,
            });
        }

        Ok(stdout)
    }

    async fn show(&self, protocol: Protocol, iface: &str, what: &str) -> Result<String> {
        validate_interface_name(iface)?;
        self.run(protocol.tool(), &["show", iface, what], None).await
    }

    /// Read the kernel device over netlink
    async fn kernel_device(&self, iface: &str) -> Result<Device> {
        let iface_name: InterfaceName = iface
            .parse()
            .map_err(|_| Error::validation(format!("Invalid interface name: {}", iface)))?;
        let label = format!("netlink get device {}", iface);

        // Use tokio::task::spawn_blocking for sync netlink call
        tokio::task::spawn_blocking(move || Device::get(&iface_name, Backend::Kernel))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
            .map_err(|e| Error::ExternalCommand {
                command: label,
                detail: e.to_string(),
            })
    }

    /// Parse `show <iface> transfer` output
    /// Format: "peer_pubkey\trx_bytes\ttx_bytes" (one line per peer)
    #[doc(hidden)]
    pub fn parse_transfer_output(output: &str) -> Vec<PeerTransfer> {
        output
            .lines()
            .filter_map(|line| {
                let parts: Vec<&str> = line.split('\t').collect();
                if parts.len() < 3 {
                    return None;
                }
                match (parts[1].parse::<u64>(), parts[2].parse::<u64>()) {
                    (Ok(rx), Ok(tx)) => Some(PeerTransfer {
                        public_key: parts[0].to_string(),
                        rx_bytes: rx,
                        tx_bytes: tx,
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Parse `show <iface> latest-handshakes` output
    /// Format: "peer_pubkey\tepoch_seconds"
    #[doc(hidden)]
    pub fn parse_handshake_output(output: &str) -> Vec<PeerHandshake> {
        output
            .lines()
            .filter_map(|line| {
                let (key, epoch) = line.split_once('\t')?;
                let epoch_secs = epoch.trim().parse::<i64>().ok()?;
                Some(PeerHandshake {
                    public_key: key.to_string(),
                    epoch_secs,
                })
            })
            .collect()
    }

    /// Parse `show <iface> endpoints` output, dropping `(none)`
    #[doc(hidden)]
    pub fn parse_endpoint_output(output: &str) -> Vec<PeerEndpoint> {
        output
            .lines()
            .filter_map(|line| {
                let (key, endpoint) = line.split_once('\t')?;
                let endpoint = endpoint.trim();
                if endpoint.is_empty() || endpoint == "(none)" {
                    return None;
                }
                Some(PeerEndpoint {
                    public_key: key.to_string(),
                    endpoint: endpoint.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl NetworkControl for WgController {
    async fn is_up(&self, iface: &str) -> bool {
        match if_addrs::get_if_addrs() {
            Ok(addrs) => addrs.iter().any(|a| a.name == iface),
            Err(e) => {
                log::warn!("Failed to list network interfaces: {}", e);
                false
            }
        }
    }

    async fn bring_up(&self, protocol: Protocol, conf_path: &Path) -> Result<()> {
        let path = conf_path.to_string_lossy();
        log::info!("Bringing up {} interface: {}", protocol, path);
        self.run(protocol.quick_tool(), &["up", &path], None).await?;
        Ok(())
    }

    async fn bring_down(&self, protocol: Protocol, conf_path: &Path) -> Result<()> {
        let path = conf_path.to_string_lossy();
        log::info!("Bringing down {} interface: {}", protocol, path);
        self.run(protocol.quick_tool(), &["down", &path], None).await?;
        Ok(())
    }

    async fn set_peer(
        &self,
        protocol: Protocol,
        iface: &str,
        public_key: &str,
        allowed_ips: &str,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        validate_interface_name(iface)?;
        let allowed_ips = allowed_ips.replace(' ', "");
        let psk_source = if preshared_key.is_some() {
            "/dev/stdin"
        } else {
            "/dev/null"
        };
        let args = [
            "set",
            iface,
            "peer",
            public_key,
            "allowed-ips",
            &allowed_ips,
            "preshared-key",
            psk_source,
        ];
        self.run(protocol.tool(), &args, preshared_key).await?;
        Ok(())
    }

    async fn remove_peer(&self, protocol: Protocol, iface: &str, public_key: &str) -> Result<()> {
        validate_interface_name(iface)?;
        self.run(
            protocol.tool(),
            &["set", iface, "peer", public_key, "remove"],
            None,
        )
        .await?;
        Ok(())
    }

    async fn save(&self, protocol: Protocol, conf_path: &Path) -> Result<()> {
        let path = conf_path.to_string_lossy();
        self.run(protocol.quick_tool(), &["save", &path], None).await?;
        Ok(())
    }

    async fn transfer(&self, protocol: Protocol, iface: &str) -> Result<Vec<PeerTransfer>> {
        match protocol {
            Protocol::Wg => {
                let device = self.kernel_device(iface).await?;
                Ok(device
                    .peers
                    .into_iter()
                    .map(|p| PeerTransfer {
                        public_key: p.config.public_key.to_base64(),
                        rx_bytes: p.stats.rx_bytes,
                        tx_bytes: p.stats.tx_bytes,
                    })
                    .collect())
            }
            Protocol::Awg => {
                let output = self.show(protocol, iface, "transfer").await?;
                Ok(Self::parse_transfer_output(&output))
            }
        }
    }

    async fn latest_handshakes(
        &self,
        protocol: Protocol,
        iface: &str,
    ) -> Result<Vec<PeerHandshake>> {
        match protocol {
            Protocol::Wg => {
                let device = self.kernel_device(iface).await?;
                Ok(device
                    .peers
                    .into_iter()
                    .map(|p| PeerHandshake {
                        public_key: p.config.public_key.to_base64(),
                        epoch_secs: p
                            .stats
                            .last_handshake_time
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map_or(0, |d| d.as_secs() as i64),
                    })
                    .collect())
            }
            Protocol::Awg => {
                let output = self.show(protocol, iface, "latest-handshakes").await?;
                Ok(Self::parse_handshake_output(&output))
            }
        }
    }

    async fn endpoints(&self, protocol: Protocol, iface: &str) -> Result<Vec<PeerEndpoint>> {
        match protocol {
            Protocol::Wg => {
                let device = self.kernel_device(iface).await?;
                Ok(device
                    .peers
                    .into_iter()
                    .filter_map(|p| {
                        p.config.endpoint.map(|e| PeerEndpoint {
                            public_key: p.config.public_key.to_base64(),
                            endpoint: e.to_string(),
                        })
                    })
                    .collect())
            }
            Protocol::Awg => {
                let output = self.show(protocol, iface, "endpoints").await?;
                Ok(Self::parse_endpoint_output(&output))
            }
        }
    }
}
