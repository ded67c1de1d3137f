// Interface configuration file reader/writer

//! Interface configuration files
//!
//! Reads and writes the INI-like `[Interface]` / `[Peer]` files consumed by
//! `wg-quick`, and tracks the file's modification time so reconciliation
//! can skip reparsing when nothing touched the file.
//!
//! Duplicate keys inside one section are concatenated: `, ` for list-valued
//! keys, `; ` for hook commands.

use crate::error::{Error, Result};
use crate::types::Protocol;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const INTERFACE_HEADER: &str = "[Interface]";
const PEER_HEADER: &str = "[Peer]";
const NAME_COMMENT: &str = "#Name#";

/// Keys understood in the `[Interface]` section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceField {
    PrivateKey,
    Address,
    ListenPort,
    Dns,
    Table,
    Mtu,
    PreUp,
    PostUp,
    PreDown,
    PostDown,
    SaveConfig,
    Jc,
    Jmin,
    Jmax,
    S1,
    S2,
    H1,
    H2,
    H3,
    H4,
}

impl InterfaceField {
    const ALL: [InterfaceField; 20] = [
        InterfaceField::PrivateKey,
        InterfaceField::Address,
        InterfaceField::ListenPort,
        InterfaceField::Dns,
        InterfaceField::Table,
        InterfaceField::Mtu,
        InterfaceField::PreUp,
        InterfaceField::PostUp,
        InterfaceField::PreDown,
        InterfaceField::PostDown,
        InterfaceField::SaveConfig,
        InterfaceField::Jc,
        InterfaceField::Jmin,
        InterfaceField::Jmax,
        InterfaceField::S1,
        InterfaceField::S2,
        InterfaceField::H1,
        InterfaceField::H2,
        InterfaceField::H3,
        InterfaceField::H4,
    ];

    const OBFUSCATION: [InterfaceField; 9] = [
        InterfaceField::Jc,
        InterfaceField::Jmin,
        InterfaceField::Jmax,
        InterfaceField::S1,
        InterfaceField::S2,
        InterfaceField::H1,
        InterfaceField::H2,
        InterfaceField::H3,
        InterfaceField::H4,
    ];

    const EDITABLE: [InterfaceField; 9] = [
        InterfaceField::Address,
        InterfaceField::ListenPort,
        InterfaceField::Mtu,
        InterfaceField::Dns,
        InterfaceField::Table,
        InterfaceField::PreUp,
        InterfaceField::PostUp,
        InterfaceField::PreDown,
        InterfaceField::PostDown,
    ];

    /// Key as written in the file
    pub fn key(self) -> &'static str {
        match self {
            InterfaceField::PrivateKey => "PrivateKey",
            InterfaceField::Address => "Address",
            InterfaceField::ListenPort => "ListenPort",
            InterfaceField::Dns => "DNS",
            InterfaceField::Table => "Table",
            InterfaceField::Mtu => "MTU",
            InterfaceField::PreUp => "PreUp",
            InterfaceField::PostUp => "PostUp",
            InterfaceField::PreDown => "PreDown",
            InterfaceField::PostDown => "PostDown",
            InterfaceField::SaveConfig => "SaveConfig",
            InterfaceField::Jc => "Jc",
            InterfaceField::Jmin => "Jmin",
            InterfaceField::Jmax => "Jmax",
            InterfaceField::S1 => "S1",
            InterfaceField::S2 => "S2",
            InterfaceField::H1 => "H1",
            InterfaceField::H2 => "H2",
            InterfaceField::H3 => "H3",
            InterfaceField::H4 => "H4",
        }
    }

    /// Look up a field by its file key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.key() == key)
    }

    fn is_hook(self) -> bool {
        matches!(
            self,
            InterfaceField::PreUp
                | InterfaceField::PostUp
                | InterfaceField::PreDown
                | InterfaceField::PostDown
        )
    }

    /// Fields an operator may rewrite through a settings update
    pub fn editable(protocol: Protocol) -> Vec<InterfaceField> {
        let mut fields = Self::EDITABLE.to_vec();
        if protocol == Protocol::Awg {
            fields.extend_from_slice(&Self::OBFUSCATION);
        }
        fields
    }
}

/// Handshake-obfuscation parameters of the `awg` variant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObfuscationParams {
    pub jc: String,
    pub jmin: String,
    pub jmax: String,
    pub s1: String,
    pub s2: String,
    pub h1: String,
    pub h2: String,
    pub h3: String,
    pub h4: String,
}

impl ObfuscationParams {
    /// `(key, value)` pairs in file order
    pub fn entries(&self) -> [(&'static str, &str); 9] {
        [
            ("Jc", &self.jc),
            ("Jmin", &self.jmin),
            ("Jmax", &self.jmax),
            ("S1", &self.s1),
            ("S2", &self.s2),
            ("H1", &self.h1),
            ("H2", &self.h2),
            ("H3", &self.h3),
            ("H4", &self.h4),
        ]
    }
}

/// Parsed `[Interface]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSection {
    pub private_key: String,
    pub address: String,
    pub listen_port: String,
    pub dns: String,
    pub table: String,
    pub mtu: String,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    pub save_config: bool,
    pub obfuscation: ObfuscationParams,
}

impl InterfaceSection {
    fn slot(&mut self, field: InterfaceField) -> Option<&mut String> {
        let slot = match field {
            InterfaceField::PrivateKey => &mut self.private_key,
            InterfaceField::Address => &mut self.address,
            InterfaceField::ListenPort => &mut self.listen_port,
            InterfaceField::Dns => &mut self.dns,
            InterfaceField::Table => &mut self.table,
            InterfaceField::Mtu => &mut self.mtu,
            InterfaceField::PreUp => &mut self.pre_up,
            InterfaceField::PostUp => &mut self.post_up,
            InterfaceField::PreDown => &mut self.pre_down,
            InterfaceField::PostDown => &mut self.post_down,
            InterfaceField::SaveConfig => return None,
            InterfaceField::Jc => &mut self.obfuscation.jc,
            InterfaceField::Jmin => &mut self.obfuscation.jmin,
            InterfaceField::Jmax => &mut self.obfuscation.jmax,
            InterfaceField::S1 => &mut self.obfuscation.s1,
            InterfaceField::S2 => &mut self.obfuscation.s2,
            InterfaceField::H1 => &mut self.obfuscation.h1,
            InterfaceField::H2 => &mut self.obfuscation.h2,
            InterfaceField::H3 => &mut self.obfuscation.h3,
            InterfaceField::H4 => &mut self.obfuscation.h4,
        };
        Some(slot)
    }

    /// Replace a field's value
    pub fn set(&mut self, field: InterfaceField, value: &str) {
        match self.slot(field) {
            Some(slot) => *slot = value.to_string(),
            None => self.save_config = parse_bool(value),
        }
    }

    /// Add a value, concatenating with an existing one
    fn append(&mut self, field: InterfaceField, value: &str) {
        let separator = if field.is_hook() { "; " } else { ", " };
        match self.slot(field) {
            Some(slot) if !slot.is_empty() => {
                slot.push_str(separator);
                slot.push_str(value);
            }
            Some(slot) => *slot = value.to_string(),
            None => self.save_config = parse_bool(value),
        }
    }
}

/// One `[Peer]` block as found in the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSection {
    pub public_key: String,
    pub allowed_ips: String,
    pub preshared_key: String,
    pub name: String,
    pub endpoint: String,
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

/// Split `Key = Value` on the first `=`
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with(';')
}

/// Parse the `[Interface]` section
///
/// `origin` names the file in the error message.
pub fn parse_interface(origin: &str, content: &str) -> Result<InterfaceSection> {
    let mut lines = content.lines().map(str::trim);
    if !lines.any(|l| l == INTERFACE_HEADER) {
        return Err(Error::Parse {
            path: origin.to_string(),
            reason: "[Interface] section not found".to_string(),
        });
    }

    let mut section = InterfaceSection::default();
    for line in lines {
        if line == PEER_HEADER {
            break;
        }
        if line.is_empty() || is_comment(line) {
            continue;
        }
        if let Some((key, value)) = split_key_value(line) {
            if let Some(field) = InterfaceField::from_key(key) {
                section.append(field, value);
            }
        }
    }
    Ok(section)
}

/// Parse every `[Peer]` block
///
/// A `#Name# = ...` comment inside a block names the peer; other comments
/// are ignored. Blocks without a public key are returned too and left to
/// the caller to skip.
pub fn parse_peers(content: &str) -> Vec<PeerSection> {
    let mut peers: Vec<PeerSection> = Vec::new();
    let mut in_peer = false;

    for line in content.lines().map(str::trim) {
        if line == PEER_HEADER {
            peers.push(PeerSection::default());
            in_peer = true;
            continue;
        }
        if line.starts_with('[') {
            in_peer = false;
            continue;
        }
        let Some(current) = peers.last_mut().filter(|_| in_peer) else {
            continue;
        };

        if line.starts_with(NAME_COMMENT) {
            if let Some((_, name)) = split_key_value(line) {
                current.name = name.to_string();
            }
            continue;
        }
        if line.is_empty() || is_comment(line) {
            continue;
        }

        let Some((key, value)) = split_key_value(line) else {
            continue;
        };
        let slot = match key {
            "PublicKey" => &mut current.public_key,
            "AllowedIPs" => &mut current.allowed_ips,
            "PresharedKey" => &mut current.preshared_key,
            "Endpoint" => &mut current.endpoint,
            _ => continue,
        };
        if slot.is_empty() {
            *slot = value.to_string();
        } else {
            slot.push_str(", ");
            slot.push_str(value);
        }
    }

    peers
}

/// Rewrite selected `[Interface]` keys, keeping every other line verbatim
///
/// Fields listed in `updates` are dropped from the section and re-added
/// directly under the header; an empty value removes the key.
pub fn rewrite_interface(
    origin: &str,
    content: &str,
    updates: &[(InterfaceField, String)],
) -> Result<String> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.trim() == INTERFACE_HEADER)
        .ok_or_else(|| Error::Parse {
            path: origin.to_string(),
            reason: "[Interface] section not found".to_string(),
        })?;
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.trim() == PEER_HEADER)
        .map_or(lines.len(), |p| start + 1 + p);

    let replaced: Vec<&str> = updates.iter().map(|(f, _)| f.key()).collect();

    let mut out: Vec<String> = lines[..start].iter().map(|l| l.to_string()).collect();
    out.push(INTERFACE_HEADER.to_string());
    for (field, value) in updates {
        let value = value.trim();
        if !value.is_empty() {
            out.push(format!("{} = {}", field.key(), value));
        }
    }
    for line in &lines[start + 1..end] {
        let keep = match split_key_value(line.trim()) {
            Some((key, _)) if !is_comment(line.trim()) => !replaced.contains(&key),
            _ => true,
        };
        if keep {
            out.push(line.to_string());
        }
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    if end < lines.len() {
        out.push(String::new());
        out.extend(lines[end..].iter().map(|l| l.to_string()));
    }

    let mut text = out.join("\n");
    text.push('\n');
    Ok(text)
}

/// Render a fresh file for a newly created configuration
pub fn render_new(section: &InterfaceSection, protocol: Protocol) -> String {
    let mut text = String::from("[Interface]\n");
    let mut push = |key: &str, value: &str| {
        if !value.is_empty() {
            text.push_str(&format!("{} = {}\n", key, value));
        }
    };
    push("PrivateKey", &section.private_key);
    push("Address", &section.address);
    push("ListenPort", &section.listen_port);
    push("DNS", &section.dns);
    push("MTU", &section.mtu);
    push("Table", &section.table);
    push("PreUp", &section.pre_up);
    push("PostUp", &section.post_up);
    push("PreDown", &section.pre_down);
    push("PostDown", &section.post_down);
    if protocol == Protocol::Awg {
        for (key, value) in section.obfuscation.entries() {
            push(key, value);
        }
    }
    push("SaveConfig", if section.save_config { "true" } else { "false" });
    text
}

/// Handle on one configuration file with modification-time tracking
#[derive(Debug)]
pub struct ConfFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfFile {
    /// Track the file at `path`; the first `changed()` call reports a change
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_modified: None,
        }
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file
    pub fn read(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Overwrite the whole file
    pub fn write(&self, content: &str) -> Result<()> {
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// Whether the file's mtime differs from the last observation; records the new mtime
    pub fn changed(&mut self) -> Result<bool> {
        let modified = fs::metadata(&self.path)?.modified()?;
        let changed = self.last_modified != Some(modified);
        self.last_modified = Some(modified);
        Ok(changed)
    }

    /// Forget the recorded mtime so the next `changed()` forces a reparse
    pub fn mark_stale(&mut self) {
        self.last_modified = None;
    }

    /// Point at a different file (rename), forgetting the recorded mtime
    pub fn relocate(&mut self, path: PathBuf) {
        self.path = path;
        self.last_modified = None;
    }
}
