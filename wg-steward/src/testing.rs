// Test doubles shared by the unit tests

//! Recording [`NetworkControl`] fake and a ready-made registry fixture
//!
//! The fixture holds one standard configuration `wg0` (10.0.0.1/24, port
//! 51820) with two peers, `P1=` at 10.0.0.2/32 and `P2=` at 10.0.0.3/32, in
//! a temporary directory backed by an in-memory store.

use crate::configuration::Context;
use crate::error::{Error, Result};
use crate::jobs::JobStore;
use crate::peer::generate_keypair;
use crate::registry::Registry;
use crate::store::{Counters, Store};
use crate::types::{PeerDefaults, Protocol};
use crate::wg_controller::{NetworkControl, PeerEndpoint, PeerHandshake, PeerTransfer};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct FakeState {
    up: HashSet<String>,
    calls: Vec<String>,
    fail_remove: HashSet<String>,
    fail_save: bool,
    up_failures: u32,
    transfer: HashMap<String, Vec<PeerTransfer>>,
    handshakes: HashMap<String, Vec<PeerHandshake>>,
    endpoints: HashMap<String, Vec<PeerEndpoint>>,
}

/// In-memory interface state; records every mutating call
#[derive(Default)]
pub struct FakeControl {
    state: Mutex<FakeState>,
}

fn iface_of(conf_path: &Path) -> String {
    conf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn command_failed(command: String, detail: &str) -> Error {
    Error::ExternalCommand {
        command,
        detail: detail.to_string(),
    }
}

impl FakeControl {
    /// Fake with the given interfaces already up
    pub fn up(ifaces: &[&str]) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().up = ifaces.iter().map(|s| s.to_string()).collect();
        fake
    }

    /// Make the next `n` bring-ups fail
    pub fn fail_up(&self, n: u32) {
        self.state.lock().unwrap().up_failures = n;
    }

    pub fn fail_remove(&self, public_key: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_remove
            .insert(public_key.to_string());
    }

    pub fn fail_save(&self, fail: bool) {
        self.state.lock().unwrap().fail_save = fail;
    }

    pub fn set_transfer(&self, iface: &str, transfer: Vec<PeerTransfer>) {
        self.state
            .lock()
            .unwrap()
            .transfer
            .insert(iface.to_string(), transfer);
    }

    pub fn set_handshakes(&self, iface: &str, handshakes: Vec<PeerHandshake>) {
        self.state
            .lock()
            .unwrap()
            .handshakes
            .insert(iface.to_string(), handshakes);
    }

    pub fn set_endpoints(&self, iface: &str, endpoints: Vec<PeerEndpoint>) {
        self.state
            .lock()
            .unwrap()
            .endpoints
            .insert(iface.to_string(), endpoints);
    }

    /// Mutating calls so far, e.g. `up wg0`, `remove wg0 P1=`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl NetworkControl for FakeControl {
    async fn is_up(&self, iface: &str) -> bool {
        self.state.lock().unwrap().up.contains(iface)
    }

    async fn bring_up(&self, _protocol: Protocol, conf_path: &Path) -> Result<()> {
        let iface = iface_of(conf_path);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("up {}", iface));
        if state.up_failures > 0 {
            state.up_failures -= 1;
            return Err(command_failed(
                format!("wg-quick up {}", conf_path.display()),
                "RTNETLINK answers: Address already in use",
            ));
        }
        state.up.insert(iface);
        Ok(())
    }

    async fn bring_down(&self, _protocol: Protocol, conf_path: &Path) -> Result<()> {
        let iface = iface_of(conf_path);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("down {}", iface));
        state.up.remove(&iface);
        Ok(())
    }

    async fn set_peer(
        &self,
        _protocol: Protocol,
        iface: &str,
        public_key: &str,
        allowed_ips: &str,
        _preshared_key: Option<&str>,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("set {} {} {}", iface, public_key, allowed_ips));
        Ok(())
    }

    async fn remove_peer(&self, _protocol: Protocol, iface: &str, public_key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove {} {}", iface, public_key));
        if state.fail_remove.contains(public_key) {
            return Err(command_failed(
                format!("wg set {} peer {} remove", iface, public_key),
                "Unable to modify interface: No such device",
            ));
        }
        Ok(())
    }

    async fn save(&self, _protocol: Protocol, conf_path: &Path) -> Result<()> {
        let iface = iface_of(conf_path);
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("save {}", iface));
        if state.fail_save {
            return Err(command_failed(
                format!("wg-quick save {}", iface),
                "wg-quick: `wg0' is not a WireGuard interface",
            ));
        }
        Ok(())
    }

    async fn transfer(&self, _protocol: Protocol, iface: &str) -> Result<Vec<PeerTransfer>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transfer
            .get(iface)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_handshakes(&self, _protocol: Protocol, iface: &str) -> Result<Vec<PeerHandshake>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .handshakes
            .get(iface)
            .cloned()
            .unwrap_or_default())
    }

    async fn endpoints(&self, _protocol: Protocol, iface: &str) -> Result<Vec<PeerEndpoint>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .endpoints
            .get(iface)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn test_peer_defaults() -> PeerDefaults {
    PeerDefaults {
        dns: "1.1.1.1".to_string(),
        endpoint_allowed_ip: "0.0.0.0/0".to_string(),
        mtu: 1420,
        keepalive: 21,
        remote_endpoint: "vpn.example.com".to_string(),
    }
}

/// Content of the fixture's `wg0.conf`
pub fn wg0_conf(private_key: &str) -> String {
    format!(
        "[Interface]
PrivateKey = {}
Address = 10.0.0.1/24
ListenPort = 51820
DNS = 1.1.1.1
PostUp = iptables -A FORWARD -i wg0 -j ACCEPT
SaveConfig = true

[Peer]
#Name# = first
PublicKey = P1=
AllowedIPs = 10.0.0.2/32

[Peer]
#Name# = second
PublicKey = P2=
AllowedIPs = 10.0.0.3/32
",
        private_key
    )
}

/// Registry over a scratch directory holding `wg0`
pub struct Fixture {
    pub dir: TempDir,
    pub store: Store,
    pub jobs: JobStore,
    pub control: Arc<FakeControl>,
    pub ctx: Context,
    pub registry: Arc<Registry>,
}

impl Fixture {
    pub async fn new(control: FakeControl) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (private_key, _) = generate_keypair();
        fs::write(dir.path().join("wg0.conf"), wg0_conf(&private_key)).unwrap();

        let store = Store::in_memory().await.unwrap();
        let control = Arc::new(control);
        let ctx = Context::new(
            store.clone(),
            control.clone(),
            test_peer_defaults(),
            dir.path().join("download"),
        );
        let registry = Arc::new(Registry::new(
            ctx.clone(),
            dir.path().to_path_buf(),
            None,
            Vec::new(),
        ));
        registry.discover(false).await.unwrap();

        Self {
            jobs: ctx.jobs.clone(),
            dir,
            store,
            control,
            ctx,
            registry,
        }
    }

    /// Set receive counters of an active peer; sent counters are zeroed
    pub async fn set_usage(&self, configuration: &str, id: &str, total: i64, cumu: i64) {
        let counters = Counters {
            total_receive: total,
            total_sent: 0,
            cumu_receive: cumu,
            cumu_sent: 0,
        };
        self.store
            .update_counters(configuration, id, &counters)
            .await
            .unwrap();
    }
}
