// Peer model and settings validation

//! Peers
//!
//! A peer is one tunnel endpoint of a configuration, identified by its
//! public key. This module holds the stored peer record, the input types for
//! creating and editing peers, validation of those inputs, and rendering of
//! the client-side configuration file.

use crate::config::MAX_PEER_MTU;
use crate::conf_file::ObfuscationParams;
use crate::error::{Error, Result};
use crate::ip_alloc::{parse_allowed_ips_lenient, parse_cidr_list};
use crate::jobs::PeerJob;
use crate::share::ShareLink;
use crate::store::Counters;
use crate::types::PeerStatus;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use wireguard_control::Key;

/// Handshake placeholder for a peer that never connected
pub const NO_HANDSHAKE: &str = "No Handshake";

/// Placeholder for unknown endpoint / allowed IPs
pub const NOT_AVAILABLE: &str = "N/A";

/// Stored peer record plus the jobs and share links attached on load
#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct Peer {
    pub id: String,
    pub private_key: String,
    pub dns: String,
    pub endpoint_allowed_ip: String,
    pub name: String,
    pub total_receive: i64,
    pub total_sent: i64,
    pub total_data: i64,
    pub endpoint: String,
    pub status: PeerStatus,
    pub latest_handshake: String,
    pub allowed_ip: String,
    pub cumu_receive: i64,
    pub cumu_sent: i64,
    pub cumu_data: i64,
    pub mtu: i64,
    pub keepalive: i64,
    pub remote_endpoint: String,
    pub preshared_key: String,
    #[sqlx(skip)]
    pub jobs: Vec<PeerJob>,
    #[sqlx(skip)]
    pub share_links: Vec<ShareLink>,
}

impl Peer {
    pub fn counters(&self) -> Counters {
        Counters {
            total_receive: self.total_receive,
            total_sent: self.total_sent,
            cumu_receive: self.cumu_receive,
            cumu_sent: self.cumu_sent,
        }
    }

    /// Networks this peer is reachable at; malformed entries are skipped
    pub fn allowed_networks(&self) -> Vec<IpNetwork> {
        parse_allowed_ips_lenient(&self.id, &self.allowed_ip)
    }

    /// Render the configuration file a client imports
    pub fn client_config(&self, server: &ServerInfo<'_>) -> ClientConfig {
        let mut file = format!(
            "[Interface]\nPrivateKey = {}\nAddress = {}\nMTU = {}\n",
            self.private_key, self.allowed_ip, self.mtu
        );
        if !self.dns.is_empty() {
            file.push_str(&format!("DNS = {}\n", self.dns));
        }
        if let Some(params) = server.obfuscation {
            for (key, value) in params.entries() {
                if !value.is_empty() {
                    file.push_str(&format!("{} = {}\n", key, value));
                }
            }
        }
        file.push_str(&format!(
            "\n[Peer]\nPublicKey = {}\nAllowedIPs = {}\nEndpoint = {}:{}\nPersistentKeepalive = {}\n",
            server.public_key,
            self.endpoint_allowed_ip,
            server.remote_endpoint,
            server.listen_port,
            self.keepalive
        ));
        if !self.preshared_key.is_empty() {
            file.push_str(&format!("PresharedKey = {}\n", self.preshared_key));
        }

        let mut filename = sanitize_filename(&self.name);
        if server.obfuscation.is_some() {
            filename = format!("{}_{}", filename, server.configuration);
        }
        ClientConfig { filename, file }
    }
}

/// Server-side values a client configuration points at
#[derive(Debug, Clone)]
pub struct ServerInfo<'a> {
    pub configuration: &'a str,
    pub public_key: &'a str,
    pub listen_port: &'a str,
    pub remote_endpoint: &'a str,
    /// Set for the obfuscated protocol
    pub obfuscation: Option<&'a ObfuscationParams>,
}

/// Downloadable client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientConfig {
    pub filename: String,
    pub file: String,
}

const RESERVED_FILENAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Reduce a peer name to a portable file stem
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '-'))
        .collect();
    if cleaned.is_empty() || RESERVED_FILENAMES.contains(&cleaned.to_ascii_lowercase().as_str()) {
        return "UntitledPeer".to_string();
    }
    cleaned
}

/// Which counters a usage reset clears
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetKind {
    Total,
    Receive,
    Sent,
}

/// Input for one explicitly added peer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPeer {
    pub id: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub preshared_key: String,
    pub allowed_ip: String,
    #[serde(default)]
    pub name: String,
    pub dns: Option<String>,
    pub endpoint_allowed_ip: Option<String>,
    pub mtu: Option<i64>,
    pub keepalive: Option<i64>,
}

/// Options shared by every peer of a bulk add
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkPeerOptions {
    /// Names are `<prefix>_<n>`; empty gives `Peer_<n>`
    #[serde(default)]
    pub name_prefix: String,
    #[serde(default)]
    pub preshared_key: bool,
    pub dns: Option<String>,
    pub endpoint_allowed_ip: Option<String>,
    pub mtu: Option<i64>,
    pub keepalive: Option<i64>,
}

/// Operator edit of an existing peer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerUpdate {
    pub name: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub preshared_key: String,
    #[serde(default)]
    pub dns: String,
    pub allowed_ip: String,
    pub endpoint_allowed_ip: String,
    pub mtu: i64,
    pub keepalive: i64,
}

impl PeerUpdate {
    /// Check the edit of peer `id` against the other peers of the configuration
    ///
    /// Runs before any external command; nothing is changed on failure.
    pub fn validate(&self, id: &str, others: &[Peer]) -> Result<()> {
        validate_peer_name(&self.name)?;
        let requested = parse_cidr_list(&self.allowed_ip)?;
        ensure_disjoint(id, &requested, others)?;

        parse_cidr_list(&self.endpoint_allowed_ip).map_err(|_| {
            Error::validation(format!(
                "Endpoint allowed IPs format is incorrect: {}",
                self.endpoint_allowed_ip
            ))
        })?;

        if !self.dns.is_empty() {
            validate_dns(&self.dns)?;
        }
        validate_mtu(self.mtu)?;
        validate_keepalive(self.keepalive)?;

        if !self.private_key.is_empty() && public_key_of(&self.private_key)? != id {
            return Err(Error::validation(
                "Private key does not match with the public key",
            ));
        }
        Ok(())
    }

    /// Apply the edit to a stored record
    pub fn apply(&self, peer: &mut Peer) {
        peer.name = self.name.clone();
        peer.private_key = self.private_key.clone();
        peer.preshared_key = self.preshared_key.clone();
        peer.dns = self.dns.clone();
        peer.allowed_ip = self.allowed_ip.clone();
        peer.endpoint_allowed_ip = self.endpoint_allowed_ip.clone();
        peer.mtu = self.mtu;
        peer.keepalive = self.keepalive;
    }
}

fn same_family(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    same_family(a, b) && (a.contains(b.network()) || b.contains(a.network()))
}

/// Reject networks overlapping those of any other peer
pub(crate) fn ensure_disjoint(id: &str, requested: &[IpNetwork], others: &[Peer]) -> Result<()> {
    for other in others.iter().filter(|p| p.id != id) {
        for theirs in other.allowed_networks() {
            if let Some(mine) = requested.iter().find(|n| overlaps(n, &theirs)) {
                return Err(Error::validation(format!(
                    "Allowed IP {} already taken by peer {}",
                    mine, other.id
                )));
            }
        }
    }
    Ok(())
}

/// Names end up in `#Name#` comment lines and dump statements
pub(crate) fn validate_peer_name(name: &str) -> Result<()> {
    if name.chars().any(char::is_control) {
        return Err(Error::validation(
            "Peer name cannot contain line breaks or control characters",
        ));
    }
    Ok(())
}

pub(crate) fn validate_dns(dns: &str) -> Result<()> {
    for entry in dns.split(',').map(str::trim) {
        let is_host = !entry.is_empty()
            && entry
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            && entry.chars().any(|c| c.is_ascii_alphabetic());
        if entry.parse::<IpAddr>().is_err() && !is_host {
            return Err(Error::validation(format!("DNS format is incorrect: {}", dns)));
        }
    }
    Ok(())
}

pub(crate) fn validate_mtu(mtu: i64) -> Result<()> {
    if !(0..=MAX_PEER_MTU).contains(&mtu) {
        return Err(Error::validation(format!(
            "MTU must be between 0 and {}, got {}",
            MAX_PEER_MTU, mtu
        )));
    }
    Ok(())
}

pub(crate) fn validate_keepalive(keepalive: i64) -> Result<()> {
    if keepalive < 0 {
        return Err(Error::validation(format!(
            "Persistent keepalive cannot be negative, got {}",
            keepalive
        )));
    }
    Ok(())
}

/// Derive the base64 public key of a base64 private key
pub fn public_key_of(private_key: &str) -> Result<String> {
    let key = Key::from_base64(private_key.trim())
        .map_err(|_| Error::validation("Private key is not a valid base64 WireGuard key"))?;
    Ok(key.get_public().to_base64())
}

/// Reject anything that is not a base64 32-byte key
pub(crate) fn validate_public_key(public_key: &str) -> Result<()> {
    Key::from_base64(public_key)
        .map(|_| ())
        .map_err(|_| Error::validation(format!("Public key is not valid: {}", public_key)))
}

/// Fresh `(private, public)` key pair, base64
pub fn generate_keypair() -> (String, String) {
    let private = Key::generate_private();
    let public = private.get_public();
    (private.to_base64(), public.to_base64())
}

/// Fresh preshared key, base64
pub fn generate_preshared_key() -> String {
    Key::generate_preshared().to_base64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, allowed_ip: &str) -> Peer {
        Peer {
            id: id.to_string(),
            allowed_ip: allowed_ip.to_string(),
            ..Default::default()
        }
    }

    fn update(allowed_ip: &str) -> PeerUpdate {
        PeerUpdate {
            name: "laptop".to_string(),
            dns: "1.1.1.1".to_string(),
            allowed_ip: allowed_ip.to_string(),
            endpoint_allowed_ip: "0.0.0.0/0".to_string(),
            mtu: 1420,
            keepalive: 21,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_control_characters_in_name() {
        let others = vec![stored("A=", "10.0.0.2/32")];
        let mut u = update("10.0.0.2/32");
        u.name = "line1\nline2".to_string();
        assert!(matches!(u.validate("A=", &others), Err(Error::Validation(_))));
        u.name = "tab\there".to_string();
        assert!(u.validate("A=", &others).is_err());
        u.name = "Alice's laptop".to_string();
        assert!(u.validate("A=", &others).is_ok());
    }

    #[test]
    fn test_validate_accepts_own_address() {
        let others = vec![stored("A=", "10.0.0.2/32"), stored("B=", "10.0.0.3/32")];
        assert!(update("10.0.0.2/32").validate("A=", &others).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let others = vec![stored("A=", "10.0.0.2/32"), stored("B=", "10.0.0.0/30")];
        let err = update("10.0.0.2/32").validate("C=", &others).unwrap_err();
        assert!(err.to_string().contains("already taken"));

        // Containing network also collides
        let err = update("10.0.0.0/24").validate("C=", &others[..1]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Other family never collides
        assert!(update("fd00::2/128").validate("C=", &others).is_ok());
    }

    #[test]
    fn test_validate_field_rules() {
        let others = vec![];

        let mut bad = update("10.0.0.9/32");
        bad.endpoint_allowed_ip = "everything".to_string();
        assert!(bad.validate("A=", &others).is_err());

        let mut bad = update("10.0.0.9/32");
        bad.dns = "1.1.1.1, not a host!".to_string();
        assert!(bad.validate("A=", &others).is_err());

        let mut ok = update("10.0.0.9/32");
        ok.dns = "1.1.1.1, dns.example.com".to_string();
        assert!(ok.validate("A=", &others).is_ok());

        let mut bad = update("10.0.0.9/32");
        bad.mtu = MAX_PEER_MTU + 1;
        assert!(bad.validate("A=", &others).is_err());

        let mut bad = update("10.0.0.9/32");
        bad.keepalive = -1;
        assert!(bad.validate("A=", &others).is_err());

        assert!(update("not-an-ip").validate("A=", &others).is_err());
    }

    #[test]
    fn test_validate_private_key_must_match() {
        let (private, public) = generate_keypair();
        let mut u = update("10.0.0.9/32");
        u.private_key = private;
        assert!(u.validate(&public, &[]).is_ok());

        let (_, other_public) = generate_keypair();
        assert!(u.validate(&other_public, &[]).is_err());

        u.private_key = "garbage".to_string();
        assert!(u.validate(&public, &[]).is_err());
    }

    #[test]
    fn test_generated_keys_are_consistent() {
        let (private, public) = generate_keypair();
        assert_eq!(public_key_of(&private).unwrap(), public);
        assert_eq!(generate_preshared_key().len(), 44);
    }

    #[test]
    fn test_apply_update() {
        let mut peer = stored("A=", "10.0.0.2/32");
        update("10.0.0.7/32").apply(&mut peer);
        assert_eq!(peer.allowed_ip, "10.0.0.7/32");
        assert_eq!(peer.name, "laptop");
        assert_eq!(peer.mtu, 1420);
    }

    #[test]
    fn test_client_config() {
        let peer = Peer {
            id: "A=".to_string(),
            name: "Alice's laptop".to_string(),
            private_key: "priv".to_string(),
            allowed_ip: "10.0.0.2/32".to_string(),
            dns: "1.1.1.1".to_string(),
            endpoint_allowed_ip: "0.0.0.0/0".to_string(),
            mtu: 1420,
            keepalive: 21,
            preshared_key: "psk".to_string(),
            ..Default::default()
        };
        let server = ServerInfo {
            configuration: "wg0",
            public_key: "serverpub",
            listen_port: "51820",
            remote_endpoint: "vpn.example.com",
            obfuscation: None,
        };

        let config = peer.client_config(&server);
        assert_eq!(config.filename, "Aliceslaptop");
        assert!(config.file.contains("Address = 10.0.0.2/32"));
        assert!(config.file.contains("DNS = 1.1.1.1"));
        assert!(config.file.contains("Endpoint = vpn.example.com:51820"));
        assert!(config.file.contains("PresharedKey = psk"));
        assert!(!config.file.contains("Jc"));
    }

    #[test]
    fn test_client_config_obfuscated() {
        let params = ObfuscationParams {
            jc: "4".to_string(),
            ..Default::default()
        };
        let peer = Peer::default();
        let server = ServerInfo {
            configuration: "awg0",
            public_key: "serverpub",
            listen_port: "51820",
            remote_endpoint: "vpn.example.com",
            obfuscation: Some(&params),
        };
        let config = peer.client_config(&server);
        assert_eq!(config.filename, "UntitledPeer_awg0");
        assert!(config.file.contains("Jc = 4"));
        assert!(!config.file.contains("DNS"));
        assert!(!config.file.contains("PresharedKey"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my phone"), "myphone");
        assert_eq!(sanitize_filename("../../etc"), "etc");
        assert_eq!(sanitize_filename("CON"), "UntitledPeer");
        assert_eq!(sanitize_filename("   "), "UntitledPeer");
    }
}
