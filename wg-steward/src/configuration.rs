// Interface configuration lifecycle

//! Configurations
//!
//! A [`Configuration`] is one tunnel interface: its configuration file, its
//! interface settings, and its peers split into an active and a restricted
//! set. The store is the persistence layer of that model; the file
//! contributes peers it lists and is authoritative for their allowed IPs.
//! [`Configuration::reconcile`] rebuilds the in-memory view, reparsing the
//! file only when its modification time changed.
//!
//! Mutating operations talk to the live interface through
//! [`NetworkControl`], then to the store, then reconcile. Multi-peer access
//! changes report per-peer results in a [`BatchOutcome`] instead of failing
//! on the first bad peer. File edits take a backup first and roll back to it
//! when the edited file cannot be applied.

use crate::backup::{BackupEntry, BackupManager, BackupRecord};
use crate::conf_file::{self, ConfFile, InterfaceField, InterfaceSection, ObfuscationParams};
use crate::error::{Error, Missing, Result};
use crate::ip_alloc::{
    available_addresses, available_counts, host_network, interface_networks, parse_cidr_list,
    DEFAULT_ADDRESS_LIMIT,
};
use crate::jobs::{JobDraft, JobLogEntry, JobStore, PeerJob};
use crate::peer::{
    ensure_disjoint, generate_keypair, generate_preshared_key, public_key_of, validate_dns,
    validate_keepalive, validate_mtu, validate_peer_name, validate_public_key, BulkPeerOptions, ClientConfig, NewPeer,
    Peer, PeerUpdate, ResetKind, ServerInfo, NOT_AVAILABLE, NO_HANDSHAKE,
};
use crate::share::ShareLinks;
use crate::state::{self, AccessCommand, InterfaceAction, PeerAccess, StoreAction};
use crate::store::{validate_configuration_name, PeerTable, Store, TransferSnapshot};
use crate::types::{PeerDefaults, PeerStatus, Protocol};
use crate::wg_controller::NetworkControl;
use chrono::NaiveDateTime;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backup directory, relative to the directory holding the configuration file
const BACKUP_DIR: &str = "backups";

/// Collaborators shared by every configuration
#[derive(Clone)]
pub struct Context {
    pub store: Store,
    pub control: Arc<dyn NetworkControl>,
    pub jobs: JobStore,
    pub share_links: ShareLinks,
    /// Settings given to peers found in a file or created without explicit values
    pub peer_defaults: PeerDefaults,
    /// Where downloadable archives are written
    pub download_dir: PathBuf,
}

impl Context {
    pub fn new(
        store: Store,
        control: Arc<dyn NetworkControl>,
        peer_defaults: PeerDefaults,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            jobs: JobStore::new(store.clone()),
            share_links: ShareLinks::new(store.clone()),
            store,
            control,
            peer_defaults,
            download_dir,
        }
    }
}

/// Result for one peer of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub id: String,
    /// `None` on success
    pub error: Option<String>,
}

/// Result of a multi-peer access change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub items: Vec<BatchItem>,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when persisting the running state failed; store changes stay applied
    pub save_error: Option<String>,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.save_error.is_none()
    }

    fn record(&mut self, id: &str, result: Result<()>) {
        let error = match result {
            Ok(()) => {
                self.succeeded += 1;
                None
            }
            Err(e) => {
                self.failed += 1;
                Some(e.to_string())
            }
        };
        self.items.push(BatchItem {
            id: id.to_string(),
            error,
        });
    }
}

/// Interface keys to rewrite; an empty value removes the key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    changes: Vec<(InterfaceField, String)>,
}

impl SettingsUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field`, replacing an earlier value for the same field
    pub fn set(mut self, field: InterfaceField, value: impl Into<String>) -> Self {
        self.changes.retain(|(f, _)| *f != field);
        self.changes.push((field, value.into()));
        self
    }

    pub fn get(&self, field: InterfaceField) -> Option<&str> {
        self.changes
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, v)| v.as_str())
    }

    pub fn changes(&self) -> &[(InterfaceField, String)] {
        &self.changes
    }
}

/// Input for creating a configuration
#[derive(Debug, Clone, Default)]
pub struct NewConfiguration {
    pub name: String,
    pub address: String,
    pub listen_port: u16,
    pub private_key: String,
    pub dns: String,
    pub mtu: String,
    pub table: String,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,
    /// Only written for the obfuscated protocol
    pub obfuscation: ObfuscationParams,
}

/// Aggregate traffic of the active peers, bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataUsage {
    pub total: i64,
    pub sent: i64,
    pub receive: i64,
}

/// Serialisable view of a configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationSummary {
    pub name: String,
    pub protocol: Protocol,
    pub status: bool,
    pub public_key: String,
    pub address: String,
    pub listen_port: String,
    pub autostart: bool,
    pub total_peers: usize,
    pub restricted_peers: usize,
    pub connected_peers: usize,
    pub data_usage: DataUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfuscation: Option<ObfuscationParams>,
}

/// One tunnel interface and its peers
pub struct Configuration {
    name: String,
    protocol: Protocol,
    conf: ConfFile,
    interface: InterfaceSection,
    public_key: String,
    status: bool,
    autostart: bool,
    peers: Vec<Peer>,
    restricted: Vec<Peer>,
    backups: BackupManager,
    ctx: Context,
}

fn parse_error(path: &Path, reason: impl Into<String>) -> Error {
    Error::Parse {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Parse an interface section and derive its public key
fn parse_identity(path: &Path, content: &str) -> Result<(InterfaceSection, String)> {
    let interface = conf_file::parse_interface(&path.display().to_string(), content)?;
    let public_key = public_key_of(&interface.private_key)
        .map_err(|_| parse_error(path, "PrivateKey is missing or invalid"))?;
    Ok((interface, public_key))
}

fn validate_setting(field: InterfaceField, value: &str) -> Result<()> {
    let value = value.trim();
    if value.contains('\n') {
        return Err(Error::validation(format!(
            "{} cannot span several lines",
            field.key()
        )));
    }
    let bad = || Error::validation(format!("{} is not valid: {}", field.key(), value));
    match field {
        InterfaceField::Address => {
            if parse_cidr_list(value)?.is_empty() {
                return Err(Error::validation("Address cannot be empty"));
            }
        }
        InterfaceField::ListenPort => {
            if value.parse::<u16>().map_or(true, |p| p == 0) {
                return Err(bad());
            }
        }
        InterfaceField::Mtu => {
            if !value.is_empty() && value.parse::<u16>().map_or(true, |m| m == 0) {
                return Err(bad());
            }
        }
        InterfaceField::Dns => {
            if !value.is_empty() {
                validate_dns(value)?;
            }
        }
        InterfaceField::Jc
        | InterfaceField::Jmin
        | InterfaceField::Jmax
        | InterfaceField::S1
        | InterfaceField::S2
        | InterfaceField::H1
        | InterfaceField::H2
        | InterfaceField::H3
        | InterfaceField::H4 => {
            if !value.is_empty() && value.parse::<u32>().is_err() {
                return Err(bad());
            }
        }
        _ => {}
    }
    Ok(())
}

fn to_access(table: PeerTable) -> PeerAccess {
    match table {
        PeerTable::Active => PeerAccess::Active,
        PeerTable::Restricted | PeerTable::Deleted => PeerAccess::Restricted,
    }
}

fn preshared(key: &str) -> Option<&str> {
    Some(key).filter(|k| !k.is_empty())
}

impl Configuration {
    /// Load the configuration stored at `path`
    ///
    /// The name is the file stem. Fails with [`Error::Parse`] when the name
    /// is not a valid interface name, the `[Interface]` section is missing,
    /// or its private key is unusable.
    pub async fn load(
        ctx: Context,
        protocol: Protocol,
        path: PathBuf,
        autostart: bool,
    ) -> Result<Self> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| parse_error(&path, "file name is not valid UTF-8"))?;
        validate_configuration_name(&name).map_err(|e| parse_error(&path, e.to_string()))?;

        let content = fs::read_to_string(&path)?;
        let (interface, public_key) = parse_identity(&path, &content)?;
        let status = ctx.control.is_up(&name).await;
        let backup_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(BACKUP_DIR);

        ctx.store.create_tables(&name).await?;

        let mut config = Self {
            name,
            protocol,
            conf: ConfFile::new(path),
            interface,
            public_key,
            status,
            autostart,
            peers: Vec::new(),
            restricted: Vec::new(),
            backups: BackupManager::new(backup_dir),
            ctx,
        };
        config.reconcile().await?;

        log::info!(
            "Loaded {} configuration {} ({} active, {} restricted, {})",
            protocol,
            config.name,
            config.peers.len(),
            config.restricted.len(),
            if config.status { "up" } else { "down" }
        );
        Ok(config)
    }

    /// Write a new configuration file under `dir` and load it
    pub async fn create(
        ctx: Context,
        protocol: Protocol,
        dir: &Path,
        new: NewConfiguration,
    ) -> Result<Self> {
        validate_configuration_name(&new.name)?;
        if parse_cidr_list(&new.address)?.is_empty() {
            return Err(Error::validation("Address cannot be empty"));
        }
        if new.listen_port == 0 {
            return Err(Error::validation("Listen port cannot be 0"));
        }
        public_key_of(&new.private_key)?;
        if !new.dns.is_empty() {
            validate_dns(&new.dns)?;
        }
        for (field, value) in [
            (InterfaceField::Mtu, new.mtu.as_str()),
            (InterfaceField::PreUp, new.pre_up.as_str()),
            (InterfaceField::PostUp, new.post_up.as_str()),
            (InterfaceField::PreDown, new.pre_down.as_str()),
            (InterfaceField::PostDown, new.post_down.as_str()),
        ] {
            validate_setting(field, value)?;
        }

        let path = dir.join(format!("{}.conf", new.name));
        if path.exists() {
            return Err(Error::validation(format!(
                "Configuration file {} already exists",
                path.display()
            )));
        }

        let section = InterfaceSection {
            private_key: new.private_key,
            address: new.address,
            listen_port: new.listen_port.to_string(),
            dns: new.dns,
            table: new.table,
            mtu: new.mtu,
            pre_up: new.pre_up,
            post_up: new.post_up,
            pre_down: new.pre_down,
            post_down: new.post_down,
            save_config: true,
            obfuscation: new.obfuscation,
        };
        fs::create_dir_all(dir)?;
        fs::write(&path, conf_file::render_new(&section, protocol))?;
        log::info!(target: "activity", "Configuration {} created", new.name);

        Self::load(ctx, protocol, path, false).await
    }

    // -- Accessors ---------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn conf_path(&self) -> &Path {
        self.conf.path()
    }

    pub fn interface(&self) -> &InterfaceSection {
        &self.interface
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Last observed up/down state
    pub fn is_up(&self) -> bool {
        self.status
    }

    pub fn autostart(&self) -> bool {
        self.autostart
    }

    pub fn set_autostart(&mut self, autostart: bool) {
        self.autostart = autostart;
    }

    /// Active peers in insertion order
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn restricted(&self) -> &[Peer] {
        &self.restricted
    }

    /// An active peer
    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn restricted_peer(&self, id: &str) -> Option<&Peer> {
        self.restricted.iter().find(|p| p.id == id)
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    // -- Reconciliation ------------------------------------------------------------

    /// Rebuild the peer sets
    ///
    /// When the file changed since the last observation its `[Peer]` blocks
    /// are merged into the store first: unknown keys are inserted with the
    /// peer defaults, known active keys get their allowed IPs refreshed.
    pub async fn reconcile(&mut self) -> Result<()> {
        if self.conf.changed()? {
            let content = self.conf.read()?;
            self.merge_file_peers(&content).await?;
        }

        let store = &self.ctx.store;
        let mut peers = store.peers(&self.name, PeerTable::Active).await?;
        let mut restricted = store.peers(&self.name, PeerTable::Restricted).await?;
        for peer in peers.iter_mut().chain(restricted.iter_mut()) {
            peer.jobs = self.ctx.jobs.jobs_for_peer(&self.name, &peer.id).await?;
            peer.share_links = self.ctx.share_links.links_for(&self.name, &peer.id).await?;
        }
        self.peers = peers;
        self.restricted = restricted;
        Ok(())
    }

    async fn merge_file_peers(&self, content: &str) -> Result<()> {
        let defaults = &self.ctx.peer_defaults;
        let store = &self.ctx.store;

        for section in conf_file::parse_peers(content) {
            if section.public_key.is_empty() {
                log::warn!("Skipping [Peer] without PublicKey in {}", self.name);
                continue;
            }
            let allowed_ip = if section.allowed_ips.is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                section.allowed_ips.clone()
            };

            match store.locate(&self.name, &section.public_key).await? {
                None => {
                    let peer = Peer {
                        id: section.public_key,
                        dns: defaults.dns.clone(),
                        endpoint_allowed_ip: defaults.endpoint_allowed_ip.clone(),
                        name: section.name,
                        endpoint: NOT_AVAILABLE.to_string(),
                        status: PeerStatus::Stopped,
                        latest_handshake: NO_HANDSHAKE.to_string(),
                        allowed_ip,
                        mtu: defaults.mtu,
                        keepalive: defaults.keepalive,
                        remote_endpoint: defaults.remote_endpoint.clone(),
                        preshared_key: section.preshared_key,
                        ..Default::default()
                    };
                    store.insert_peer(&self.name, PeerTable::Active, &peer).await?;
                    log::debug!("Imported peer {} of {} from file", peer.id, self.name);
                }
                Some(PeerTable::Active) => {
                    store
                        .update_allowed_ip(&self.name, &section.public_key, &allowed_ip)
                        .await?;
                }
                Some(_) => {
                    log::warn!(
                        "Peer {} is listed in {} but restricted; keeping it restricted",
                        section.public_key,
                        self.name
                    );
                }
            }
        }
        Ok(())
    }

    fn reload_interface(&mut self) -> Result<()> {
        let content = self.conf.read()?;
        let (interface, public_key) = parse_identity(self.conf.path(), &content)?;
        self.interface = interface;
        self.public_key = public_key;
        Ok(())
    }

    /// Re-read the up/down state from the system
    pub async fn refresh_status(&mut self) -> bool {
        self.status = self.ctx.control.is_up(&self.name).await;
        self.status
    }

    // -- Up / down -------------------------------------------------------------------

    /// Bring the interface up if down and down if up; returns the new state
    ///
    /// A failing command is returned as [`Error::ExternalCommand`] with the
    /// utility's output. Never retried.
    pub async fn toggle(&mut self) -> Result<bool> {
        let control = self.ctx.control.clone();
        if self.refresh_status().await {
            control.bring_down(self.protocol, self.conf.path()).await?;
        } else {
            control.bring_up(self.protocol, self.conf.path()).await?;
        }
        self.status = !self.status;
        self.reload_interface()?;

        log::info!(
            target: "activity",
            "Configuration {} is now {}",
            self.name,
            if self.status { "up" } else { "down" }
        );
        Ok(self.status)
    }

    async fn ensure_up(&mut self) -> Result<()> {
        if !self.refresh_status().await {
            self.ctx
                .control
                .bring_up(self.protocol, self.conf.path())
                .await?;
            self.status = true;
            log::info!("Brought up {} to apply peer changes", self.name);
        }
        Ok(())
    }

    async fn save_running_state(&self) -> Result<()> {
        self.ctx.control.save(self.protocol, self.conf.path()).await
    }

    // -- Peer access -------------------------------------------------------------------

    /// Take peers off the interface, keeping their records
    pub async fn restrict_peers(&mut self, ids: &[String]) -> Result<BatchOutcome> {
        self.apply_access(ids, AccessCommand::Restrict).await
    }

    /// Put restricted peers back on the interface
    pub async fn allow_access_peers(&mut self, ids: &[String]) -> Result<BatchOutcome> {
        self.apply_access(ids, AccessCommand::Allow).await
    }

    /// Remove peers for good; a copy is kept in the deleted table
    pub async fn delete_peers(&mut self, ids: &[String]) -> Result<BatchOutcome> {
        self.apply_access(ids, AccessCommand::Delete).await
    }

    async fn apply_access(&mut self, ids: &[String], cmd: AccessCommand) -> Result<BatchOutcome> {
        if ids.is_empty() {
            return Err(Error::validation("Please specify one or more peers"));
        }

        let mut located = Vec::with_capacity(ids.len());
        for id in ids {
            let access = self.ctx.store.locate(&self.name, id).await?.map(to_access);
            located.push((id.as_str(), access));
        }
        if located.iter().all(|(_, access)| access.is_none()) {
            return Err(Error::not_found(Missing::Peer, ids.join(", ")));
        }

        let touches_interface = located.iter().any(|(id, access)| {
            matches!(state::plan(id, *access, cmd), Ok(p) if p.interface != InterfaceAction::None)
        });
        if touches_interface {
            self.ensure_up().await?;
        }

        let mut outcome = BatchOutcome::default();
        for (id, access) in located {
            let result = self.apply_one(id, access, cmd).await;
            if let Err(e) = &result {
                log::warn!("{:?} of peer {} in {} failed: {}", cmd, id, self.name, e);
            }
            outcome.record(id, result);
        }

        if touches_interface && outcome.succeeded > 0 {
            if let Err(e) = self.save_running_state().await {
                log::error!("Failed to save running state of {}: {}", self.name, e);
                outcome.save_error = Some(e.to_string());
            }
        }

        self.reconcile().await?;
        Ok(outcome)
    }

    async fn apply_one(&self, id: &str, access: Option<PeerAccess>, cmd: AccessCommand) -> Result<()> {
        let plan = state::plan(id, access, cmd)?;
        let from = match access {
            Some(PeerAccess::Restricted) => PeerTable::Restricted,
            _ => PeerTable::Active,
        };
        let store = &self.ctx.store;

        match plan.interface {
            InterfaceAction::RemovePeer => {
                self.ctx
                    .control
                    .remove_peer(self.protocol, &self.name, id)
                    .await?;
            }
            InterfaceAction::PushPeer => {
                let peer = store
                    .peer(&self.name, from, id)
                    .await?
                    .ok_or_else(|| Error::not_found(Missing::Peer, id))?;
                self.ctx
                    .control
                    .set_peer(
                        self.protocol,
                        &self.name,
                        id,
                        &peer.allowed_ip,
                        preshared(&peer.preshared_key),
                    )
                    .await?;
            }
            InterfaceAction::None => {}
        }

        let applied = match plan.store {
            StoreAction::MoveToRestricted => {
                store
                    .move_peer(&self.name, id, PeerTable::Active, PeerTable::Restricted)
                    .await?
            }
            StoreAction::MoveToActive => {
                store
                    .move_peer(&self.name, id, PeerTable::Restricted, PeerTable::Active)
                    .await?
            }
            StoreAction::HardDelete => store.delete_peer(&self.name, id, from).await?,
        };
        if !applied {
            return Err(Error::not_found(Missing::Peer, id));
        }

        let verb = match cmd {
            AccessCommand::Restrict => "restricted",
            AccessCommand::Allow => "allowed access",
            AccessCommand::Delete => "deleted",
        };
        log::info!(target: "activity", "Peer {} of {} {}", id, self.name, verb);
        Ok(())
    }

    // -- Adding peers ---------------------------------------------------------------------

    fn prepare_peer(&self, new: NewPeer, taken: &[Peer]) -> Result<Peer> {
        validate_public_key(&new.id)?;
        validate_peer_name(&new.name)?;
        if !new.private_key.is_empty() && public_key_of(&new.private_key)? != new.id {
            return Err(Error::validation(format!(
                "Private key does not match public key {}",
                new.id
            )));
        }
        if !new.preshared_key.is_empty() {
            validate_public_key(&new.preshared_key)
                .map_err(|_| Error::validation("Preshared key is not valid"))?;
        }

        let networks = parse_cidr_list(&new.allowed_ip)?;
        if networks.is_empty() {
            return Err(Error::validation(format!(
                "Peer {} needs at least one allowed IP",
                new.id
            )));
        }
        ensure_disjoint(&new.id, &networks, taken)?;

        let defaults = &self.ctx.peer_defaults;
        let dns = new.dns.unwrap_or_else(|| defaults.dns.clone());
        if !dns.is_empty() {
            validate_dns(&dns)?;
        }
        let endpoint_allowed_ip = new
            .endpoint_allowed_ip
            .unwrap_or_else(|| defaults.endpoint_allowed_ip.clone());
        parse_cidr_list(&endpoint_allowed_ip)?;
        let mtu = new.mtu.unwrap_or(defaults.mtu);
        validate_mtu(mtu)?;
        let keepalive = new.keepalive.unwrap_or(defaults.keepalive);
        validate_keepalive(keepalive)?;

        Ok(Peer {
            id: new.id,
            private_key: new.private_key,
            dns,
            endpoint_allowed_ip,
            name: new.name,
            endpoint: NOT_AVAILABLE.to_string(),
            status: PeerStatus::Stopped,
            latest_handshake: NO_HANDSHAKE.to_string(),
            allowed_ip: networks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            mtu,
            keepalive,
            remote_endpoint: defaults.remote_endpoint.clone(),
            preshared_key: new.preshared_key,
            ..Default::default()
        })
    }

    /// Add peers to the interface and the store
    ///
    /// Every peer is validated before anything is pushed: ids must be new
    /// to both sets and allowed IPs must not overlap any other peer.
    pub async fn add_peers(&mut self, new: Vec<NewPeer>) -> Result<Vec<Peer>> {
        if new.is_empty() {
            return Err(Error::validation("Please specify one or more peers"));
        }
        self.reconcile().await?;

        let mut taken: Vec<Peer> = self.peers.iter().chain(&self.restricted).cloned().collect();
        let mut prepared = Vec::with_capacity(new.len());
        for item in new {
            if taken.iter().any(|p| p.id == item.id) {
                return Err(Error::validation(format!("Peer {} already exists", item.id)));
            }
            let peer = self.prepare_peer(item, &taken)?;
            taken.push(peer.clone());
            prepared.push(peer);
        }

        self.ensure_up().await?;
        for peer in &prepared {
            self.ctx
                .control
                .set_peer(
                    self.protocol,
                    &self.name,
                    &peer.id,
                    &peer.allowed_ip,
                    preshared(&peer.preshared_key),
                )
                .await?;
            self.ctx
                .store
                .insert_peer(&self.name, PeerTable::Active, peer)
                .await?;
            log::info!(target: "activity", "Peer {} added to {}", peer.id, self.name);
        }
        self.save_running_state().await?;
        self.reconcile().await?;

        let ids: HashSet<&str> = prepared.iter().map(|p| p.id.as_str()).collect();
        Ok(self
            .peers
            .iter()
            .filter(|p| ids.contains(p.id.as_str()))
            .cloned()
            .collect())
    }

    /// Add `count` peers with generated keys and the next free addresses
    pub async fn bulk_add_peers(
        &mut self,
        count: usize,
        options: BulkPeerOptions,
    ) -> Result<Vec<Peer>> {
        if count == 0 {
            return Err(Error::validation("Peer count must be at least 1"));
        }
        self.reconcile().await?;

        let addresses: Vec<IpAddr> = self.available_ip_iter().take(count).collect();
        if addresses.len() < count {
            return Err(Error::validation(format!(
                "Only {} addresses are available in {}",
                addresses.len(),
                self.name
            )));
        }

        let prefix = if options.name_prefix.is_empty() {
            "Peer"
        } else {
            options.name_prefix.as_str()
        };
        let new = addresses
            .into_iter()
            .enumerate()
            .map(|(i, ip)| {
                let (private_key, id) = generate_keypair();
                NewPeer {
                    id,
                    private_key,
                    preshared_key: if options.preshared_key {
                        generate_preshared_key()
                    } else {
                        String::new()
                    },
                    allowed_ip: host_network(ip).to_string(),
                    name: format!("{}_{}", prefix, i + 1),
                    dns: options.dns.clone(),
                    endpoint_allowed_ip: options.endpoint_allowed_ip.clone(),
                    mtu: options.mtu,
                    keepalive: options.keepalive,
                }
            })
            .collect();
        self.add_peers(new).await
    }

    // -- Single peer ------------------------------------------------------------------------

    /// Edit an active peer
    ///
    /// The edit is validated before any command runs. Allowed IPs and the
    /// preshared key are pushed to the interface when they change.
    pub async fn update_peer(&mut self, id: &str, update: PeerUpdate) -> Result<Peer> {
        self.reconcile().await?;
        let mut peer = self
            .peer(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Missing::Peer, id))?;
        let others: Vec<Peer> = self.peers.iter().chain(&self.restricted).cloned().collect();
        update.validate(id, &others)?;

        if update.allowed_ip != peer.allowed_ip || update.preshared_key != peer.preshared_key {
            self.ensure_up().await?;
            self.ctx
                .control
                .set_peer(
                    self.protocol,
                    &self.name,
                    id,
                    &update.allowed_ip,
                    preshared(&update.preshared_key),
                )
                .await?;
            self.save_running_state().await?;
        }

        update.apply(&mut peer);
        self.ctx.store.update_settings(&self.name, &peer).await?;
        log::info!(target: "activity", "Peer {} of {} updated", id, self.name);

        self.reconcile().await?;
        self.peer(id)
            .cloned()
            .ok_or_else(|| Error::not_found(Missing::Peer, id))
    }

    /// Zero usage counters of an active peer
    pub async fn reset_peer_usage(&mut self, id: &str, kind: ResetKind) -> Result<()> {
        self.ctx.store.reset_usage(&self.name, id, kind).await?;
        log::info!(target: "activity", "Usage of peer {} in {} reset ({:?})", id, self.name, kind);
        self.reconcile().await
    }

    /// Client configuration of an active peer
    pub fn download_peer(&self, id: &str) -> Result<ClientConfig> {
        let peer = self
            .peer(id)
            .ok_or_else(|| Error::not_found(Missing::Peer, id))?;
        if peer.private_key.is_empty() {
            return Err(Error::validation(format!(
                "Peer {} has no private key stored",
                id
            )));
        }
        let remote_endpoint = if peer.remote_endpoint.is_empty() {
            self.ctx.peer_defaults.remote_endpoint.as_str()
        } else {
            peer.remote_endpoint.as_str()
        };
        let server = ServerInfo {
            configuration: &self.name,
            public_key: &self.public_key,
            listen_port: &self.interface.listen_port,
            remote_endpoint,
            obfuscation: (self.protocol == Protocol::Awg).then_some(&self.interface.obfuscation),
        };
        Ok(peer.client_config(&server))
    }

    /// Transfer history; every peer when `id` is `None`
    pub async fn transfer_history(&self, id: Option<&str>) -> Result<Vec<TransferSnapshot>> {
        self.ctx.store.snapshots(&self.name, id).await
    }

    // -- Jobs and share links -------------------------------------------------------------------

    /// Create or update a job on one of this configuration's peers
    pub async fn save_job(&mut self, mut draft: JobDraft) -> Result<PeerJob> {
        draft.configuration = self.name.clone();
        if self.ctx.store.locate(&self.name, &draft.peer).await?.is_none() {
            return Err(Error::not_found(Missing::Peer, &draft.peer));
        }
        let job = self.ctx.jobs.save_job(draft).await?;
        self.reconcile().await?;
        Ok(job)
    }

    /// Expire a live job of this configuration
    pub async fn delete_job(&mut self, job_id: &str) -> Result<()> {
        let owned = self
            .ctx
            .jobs
            .job(job_id)
            .await?
            .is_some_and(|j| j.configuration == self.name);
        if !owned {
            return Err(Error::not_found(Missing::Job, job_id));
        }
        self.ctx.jobs.delete_job(job_id).await?;
        self.reconcile().await
    }

    pub async fn job_logs(&self) -> Result<Vec<JobLogEntry>> {
        self.ctx.jobs.job_logs(&self.name).await
    }

    /// Create a share link for a peer; returns the link id
    pub async fn share_peer(&mut self, id: &str, expire_date: Option<NaiveDateTime>) -> Result<String> {
        if self.ctx.store.locate(&self.name, id).await?.is_none() {
            return Err(Error::not_found(Missing::Peer, id));
        }
        let share_id = self.ctx.share_links.add(&self.name, id, expire_date).await?;
        self.reconcile().await?;
        Ok(share_id)
    }

    // -- File edits -------------------------------------------------------------------------------

    pub fn raw_file(&self) -> Result<String> {
        self.conf.read()
    }

    /// Replace the whole configuration file
    ///
    /// On failure the pre-edit backup (file and store) is restored and the
    /// original error returned; a failing restore yields [`Error::Rollback`].
    pub async fn update_raw_file(&mut self, content: &str) -> Result<()> {
        parse_identity(self.conf.path(), content)?;
        self.replace_file(content).await?;
        log::info!(target: "activity", "Configuration file of {} edited", self.name);
        Ok(())
    }

    /// Rewrite editable `[Interface]` keys, keeping every other line
    pub async fn update_settings(&mut self, update: &SettingsUpdate) -> Result<()> {
        if update.changes().is_empty() {
            return Err(Error::validation("No settings to update"));
        }
        let editable = InterfaceField::editable(self.protocol);
        for (field, value) in update.changes() {
            if !editable.contains(field) {
                return Err(Error::validation(format!(
                    "{} cannot be edited on a {} configuration",
                    field.key(),
                    self.protocol
                )));
            }
            validate_setting(*field, value)?;
        }

        let origin = self.conf.path().display().to_string();
        let current = self.conf.read()?;
        let rewritten = conf_file::rewrite_interface(&origin, &current, update.changes())?;
        self.replace_file(&rewritten).await?;

        let keys: Vec<&str> = update.changes().iter().map(|(f, _)| f.key()).collect();
        log::info!(
            target: "activity",
            "Settings of {} updated: {}",
            self.name,
            keys.join(", ")
        );
        Ok(())
    }

    async fn replace_file(&mut self, content: &str) -> Result<()> {
        let record = self.backup().await?;
        let was_up = self.refresh_status().await;

        let Err(original) = self.apply_file(content, was_up).await else {
            return Ok(());
        };
        log::error!(
            "Applying new file for {} failed, restoring {}: {}",
            self.name,
            record.filename,
            original
        );
        match self.roll_back(&record.filename, was_up).await {
            Ok(()) => Err(original),
            Err(rollback) => {
                log::error!("Rollback of {} failed: {}", self.name, rollback);
                Err(Error::Rollback {
                    original: original.to_string(),
                    rollback: rollback.to_string(),
                })
            }
        }
    }

    async fn apply_file(&mut self, content: &str, was_up: bool) -> Result<()> {
        let control = self.ctx.control.clone();
        if was_up {
            control.bring_down(self.protocol, self.conf.path()).await?;
            self.status = false;
        }
        self.conf.write(content)?;
        self.conf.mark_stale();
        self.reload_interface()?;
        if was_up {
            control.bring_up(self.protocol, self.conf.path()).await?;
            self.status = true;
        }
        self.reconcile().await
    }

    async fn roll_back(&mut self, filename: &str, was_up: bool) -> Result<()> {
        let files = self.backups.read(&self.name, filename)?;
        let control = self.ctx.control.clone();
        if control.is_up(&self.name).await {
            if let Err(e) = control.bring_down(self.protocol, self.conf.path()).await {
                log::warn!("Failed to bring down {} before rollback: {}", self.name, e);
            }
        }

        self.conf.write(&files.conf)?;
        if let Some(dump) = &files.dump {
            self.ctx.store.replay(&self.name, dump).await?;
        }
        self.conf.mark_stale();
        self.reload_interface()?;

        if was_up {
            control.bring_up(self.protocol, self.conf.path()).await?;
        }
        self.refresh_status().await;
        self.reconcile().await
    }

    // -- Backups ------------------------------------------------------------------------------------

    /// Snapshot the file and the store
    pub async fn backup(&self) -> Result<BackupRecord> {
        let conf = self.conf.read()?;
        let dump = self.ctx.store.dump(&self.name).await?;
        self.backups.backup(&self.name, &conf, &dump)
    }

    /// Backups, newest first
    pub fn backups(&self) -> Result<Vec<BackupEntry>> {
        self.backups.list(&self.name)
    }

    /// Restore a listed backup; the interface is left down
    pub async fn restore_backup(&mut self, filename: &str) -> Result<()> {
        let files = self.backups.read(&self.name, filename)?;
        if self.refresh_status().await {
            self.ctx
                .control
                .bring_down(self.protocol, self.conf.path())
                .await?;
            self.status = false;
        }

        self.conf.write(&files.conf)?;
        match &files.dump {
            Some(dump) => self.ctx.store.replay(&self.name, dump).await?,
            None => log::warn!("Backup {} has no store dump; restoring the file only", filename),
        }
        self.conf.mark_stale();
        self.reload_interface()?;
        self.reconcile().await?;

        log::info!(target: "activity", "Configuration {} restored from {}", self.name, filename);
        Ok(())
    }

    pub fn delete_backup(&self, filename: &str) -> Result<()> {
        self.backups.delete(&self.name, filename)
    }

    /// Zip a backup pair into the download directory; returns the archive path
    pub fn download_backup(&self, filename: &str) -> Result<PathBuf> {
        self.backups
            .download(&self.name, filename, &self.ctx.download_dir)
    }

    // -- Configuration lifecycle ----------------------------------------------------------------------

    /// Bring the interface down, drop its tables and remove its file
    pub async fn delete(&mut self) -> Result<()> {
        if self.refresh_status().await {
            self.ctx
                .control
                .bring_down(self.protocol, self.conf.path())
                .await?;
            self.status = false;
        }
        self.ctx.store.drop_tables(&self.name).await?;
        fs::remove_file(self.conf.path())?;
        log::info!(target: "activity", "Configuration {} deleted", self.name);
        Ok(())
    }

    /// Rename the configuration, moving its file, tables, jobs and share links
    ///
    /// The interface is brought down first.
    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        validate_configuration_name(new_name)?;
        if new_name == self.name {
            return Err(Error::validation("New name is the same as the current one"));
        }
        let new_path = self.conf.path().with_file_name(format!("{}.conf", new_name));
        if new_path.exists() {
            return Err(Error::validation(format!(
                "Configuration {} already exists",
                new_name
            )));
        }

        if self.refresh_status().await {
            self.ctx
                .control
                .bring_down(self.protocol, self.conf.path())
                .await?;
            self.status = false;
        }

        let old_name = self.name.clone();
        let old_path = self.conf.path().to_path_buf();
        let store = &self.ctx.store;
        store.drop_tables(new_name).await?;
        store.copy_tables(&old_name, new_name).await?;
        fs::copy(&old_path, &new_path)?;
        self.ctx.jobs.rename_configuration(&old_name, new_name).await?;
        self.ctx
            .share_links
            .rename_configuration(&old_name, new_name)
            .await?;
        store.drop_tables(&old_name).await?;
        fs::remove_file(&old_path)?;

        self.name = new_name.to_string();
        self.conf.relocate(new_path);
        self.reconcile().await?;

        log::info!(target: "activity", "Configuration {} renamed to {}", old_name, new_name);
        Ok(())
    }

    // -- Addresses -------------------------------------------------------------------------------------

    /// Allowed IPs of every peer plus the interface's own addresses
    fn taken_networks(&self) -> Vec<IpNetwork> {
        let mut taken: Vec<IpNetwork> = self
            .peers
            .iter()
            .chain(&self.restricted)
            .flat_map(Peer::allowed_networks)
            .collect();
        taken.extend(
            interface_networks(&self.interface.address)
                .into_iter()
                .map(|(_, _, own)| host_network(own)),
        );
        taken
    }

    /// Free address count per interface subnet, keyed by the `Address` entry
    pub fn available_ip_counts(&self) -> Vec<(String, u128)> {
        let networks = interface_networks(&self.interface.address);
        let subnets: Vec<IpNetwork> = networks.iter().map(|(_, subnet, _)| *subnet).collect();
        let counts = available_counts(&subnets, &self.taken_networks());
        networks
            .into_iter()
            .map(|(label, _, _)| label)
            .zip(counts)
            .collect()
    }

    /// Free addresses per interface subnet as host networks, at most `limit`
    /// (default 255) per subnet
    pub fn available_ips(&self, limit: Option<usize>) -> Vec<(String, Vec<String>)> {
        let limit = limit.unwrap_or(DEFAULT_ADDRESS_LIMIT);
        let taken = self.taken_networks();
        interface_networks(&self.interface.address)
            .into_iter()
            .map(|(label, subnet, _)| {
                let addresses = available_addresses(subnet, &taken)
                    .take(limit)
                    .map(|ip| host_network(ip).to_string())
                    .collect();
                (label, addresses)
            })
            .collect()
    }

    /// Every free address, subnet by subnet, lazily
    pub fn available_ip_iter(&self) -> impl Iterator<Item = IpAddr> {
        let taken = self.taken_networks();
        interface_networks(&self.interface.address)
            .into_iter()
            .flat_map(move |(_, subnet, _)| available_addresses(subnet, &taken))
    }

    // -- View --------------------------------------------------------------------------------------------

    pub fn summary(&self) -> ConfigurationSummary {
        let mut usage = DataUsage::default();
        for peer in &self.peers {
            usage.receive = usage
                .receive
                .saturating_add(peer.total_receive.saturating_add(peer.cumu_receive));
            usage.sent = usage
                .sent
                .saturating_add(peer.total_sent.saturating_add(peer.cumu_sent));
            usage.total = usage
                .total
                .saturating_add(peer.total_data.saturating_add(peer.cumu_data));
        }
        ConfigurationSummary {
            name: self.name.clone(),
            protocol: self.protocol,
            status: self.status,
            public_key: self.public_key.clone(),
            address: self.interface.address.clone(),
            listen_port: self.interface.listen_port.clone(),
            autostart: self.autostart,
            total_peers: self.peers.len(),
            restricted_peers: self.restricted.len(),
            connected_peers: self
                .peers
                .iter()
                .filter(|p| p.status == PeerStatus::Running)
                .count(),
            data_usage: usage,
            obfuscation: (self.protocol == Protocol::Awg).then(|| self.interface.obfuscation.clone()),
        }
    }
}
