// Configuration registry

//! Name to configuration map owned by the daemon
//!
//! Each configuration sits behind its own mutex so batch operations on one
//! interface are serialized while others proceed. The map itself is behind
//! a read-write lock. A configuration lock is never held while waiting for
//! the map's write lock.

use crate::configuration::{
    Configuration, ConfigurationSummary, Context, NewConfiguration, SettingsUpdate,
};
use crate::conf_file::InterfaceField;
use crate::error::{Error, Missing, Result};
use crate::ip_alloc::interface_networks;
use crate::peer::ClientConfig;
use crate::types::Protocol;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub type ConfigurationHandle = Arc<Mutex<Configuration>>;

pub struct Registry {
    ctx: Context,
    wg_dir: PathBuf,
    awg_dir: Option<PathBuf>,
    autostart: Vec<String>,
    configs: RwLock<BTreeMap<String, ConfigurationHandle>>,
}

fn subnets_overlap(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.contains(b.network()) || b.contains(a.network()))
}

/// `*.conf` files directly under `dir`
fn conf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "conf") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

impl Registry {
    pub fn new(
        ctx: Context,
        wg_dir: PathBuf,
        awg_dir: Option<PathBuf>,
        autostart: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            wg_dir,
            awg_dir,
            autostart,
            configs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn dirs(&self) -> Vec<(Protocol, &Path)> {
        let mut dirs = vec![(Protocol::Wg, self.wg_dir.as_path())];
        if let Some(dir) = &self.awg_dir {
            dirs.push((Protocol::Awg, dir.as_path()));
        }
        dirs
    }

    /// Scan the configuration directories
    ///
    /// New files are loaded, configurations whose file disappeared are
    /// dropped. Files that fail to load are skipped with a warning. On
    /// `startup`, autostart configurations that are down are brought up.
    /// Returns the number of registered configurations.
    pub async fn discover(&self, startup: bool) -> Result<usize> {
        for (protocol, dir) in self.dirs() {
            let files = match conf_files(dir) {
                Ok(files) => files,
                Err(e) => {
                    log::warn!("Cannot scan {} directory {}: {}", protocol, dir.display(), e);
                    continue;
                }
            };
            for path in files {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };
                if self.configs.read().await.contains_key(&name) {
                    continue;
                }
                let autostart = self.autostart.contains(&name);
                match Configuration::load(self.ctx.clone(), protocol, path.clone(), autostart).await
                {
                    Ok(config) => {
                        self.configs
                            .write()
                            .await
                            .insert(name, Arc::new(Mutex::new(config)));
                    }
                    Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }

        let mut vanished = Vec::new();
        for (name, handle) in self.entries().await {
            if !handle.lock().await.conf_path().exists() {
                vanished.push(name);
            }
        }
        if !vanished.is_empty() {
            let mut configs = self.configs.write().await;
            for name in &vanished {
                log::info!("Configuration file of {} disappeared, dropping it", name);
                configs.remove(name);
            }
        }

        if startup {
            for handle in self.handles().await {
                let mut config = handle.lock().await;
                if !config.autostart() || config.refresh_status().await {
                    continue;
                }
                match config.toggle().await {
                    Ok(_) => log::info!("Autostarted {}", config.name()),
                    Err(e) => log::error!("Failed to autostart {}: {}", config.name(), e),
                }
            }
        }

        Ok(self.configs.read().await.len())
    }

    async fn entries(&self) -> Vec<(String, ConfigurationHandle)> {
        self.configs
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    pub async fn get(&self, name: &str) -> Option<ConfigurationHandle> {
        self.configs.read().await.get(name).cloned()
    }

    pub async fn require(&self, name: &str) -> Result<ConfigurationHandle> {
        self.get(name)
            .await
            .ok_or_else(|| Error::not_found(Missing::Configuration, name))
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    pub async fn handles(&self) -> Vec<ConfigurationHandle> {
        self.configs.read().await.values().cloned().collect()
    }

    pub async fn summaries(&self) -> Vec<ConfigurationSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            summaries.push(handle.lock().await.summary());
        }
        summaries
    }

    /// Reject a listen port or subnets already used by another configuration
    async fn ensure_unique(
        &self,
        except: Option<&str>,
        listen_port: Option<&str>,
        address: Option<&str>,
    ) -> Result<()> {
        let wanted: Vec<IpNetwork> = address
            .map(|a| interface_networks(a).into_iter().map(|(_, n, _)| n).collect())
            .unwrap_or_default();

        for (name, handle) in self.entries().await {
            if Some(name.as_str()) == except {
                continue;
            }
            let config = handle.lock().await;
            let interface = config.interface();
            if let Some(port) = listen_port {
                if interface.listen_port.trim() == port.trim() {
                    return Err(Error::validation(format!(
                        "Listen port {} is already used by {}",
                        port, name
                    )));
                }
            }
            for (_, theirs, _) in interface_networks(&interface.address) {
                if let Some(mine) = wanted.iter().find(|n| subnets_overlap(n, &theirs)) {
                    return Err(Error::validation(format!(
                        "Address {} overlaps {} of {}",
                        mine, theirs, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create, write and register a new configuration
    pub async fn create(
        &self,
        protocol: Protocol,
        new: NewConfiguration,
    ) -> Result<ConfigurationHandle> {
        let dir = match protocol {
            Protocol::Wg => self.wg_dir.clone(),
            Protocol::Awg => self.awg_dir.clone().ok_or_else(|| {
                Error::validation("No directory is configured for awg configurations")
            })?,
        };
        if self.get(&new.name).await.is_some() {
            return Err(Error::validation(format!(
                "Configuration {} already exists",
                new.name
            )));
        }
        let port = new.listen_port.to_string();
        self.ensure_unique(None, Some(&port), Some(&new.address))
            .await?;

        let name = new.name.clone();
        let config = Configuration::create(self.ctx.clone(), protocol, &dir, new).await?;
        let handle = Arc::new(Mutex::new(config));
        self.configs.write().await.insert(name, handle.clone());
        Ok(handle)
    }

    /// Delete a configuration, its file and tables
    pub async fn delete(&self, name: &str) -> Result<()> {
        let handle = self.require(name).await?;
        handle.lock().await.delete().await?;
        self.configs.write().await.remove(name);
        Ok(())
    }

    pub async fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        let handle = self.require(name).await?;
        if self.get(new_name).await.is_some() {
            return Err(Error::validation(format!(
                "Configuration {} already exists",
                new_name
            )));
        }
        handle.lock().await.rename(new_name).await?;

        let mut configs = self.configs.write().await;
        configs.remove(name);
        configs.insert(new_name.to_string(), handle);
        Ok(())
    }

    /// Edit interface settings, keeping ports and subnets unique
    pub async fn update_settings(&self, name: &str, update: &SettingsUpdate) -> Result<()> {
        let handle = self.require(name).await?;
        self.ensure_unique(
            Some(name),
            update.get(InterfaceField::ListenPort),
            update.get(InterfaceField::Address),
        )
        .await?;
        let mut config = handle.lock().await;
        config.update_settings(update).await
    }

    /// Client configuration behind a live share link
    pub async fn shared_peer(&self, share_id: &str) -> Result<ClientConfig> {
        let link = self.ctx.share_links.get(share_id).await?;
        let handle = self.require(&link.configuration).await?;
        let config = handle.lock().await;
        config.download_peer(&link.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{generate_keypair, BulkPeerOptions};
    use crate::store::PeerTable;
    use crate::testing::{wg0_conf, FakeControl, Fixture};

    fn new_configuration(name: &str, address: &str, listen_port: u16) -> NewConfiguration {
        NewConfiguration {
            name: name.to_string(),
            address: address.to_string(),
            listen_port,
            private_key: generate_keypair().0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_discover_skips_broken_files() {
        let fx = Fixture::new(FakeControl::default()).await;
        fs::write(fx.dir.path().join("broken.conf"), "garbage").unwrap();
        fs::write(fx.dir.path().join("notes.txt"), "[Interface]").unwrap();
        assert_eq!(fx.registry.discover(false).await.unwrap(), 1);
        assert_eq!(fx.registry.names().await, vec!["wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_discover_picks_up_and_drops_files() {
        let fx = Fixture::new(FakeControl::default()).await;
        let (private_key, _) = generate_keypair();
        let office = wg0_conf(&private_key).replace("10.0.0.", "10.1.0.");
        fs::write(fx.dir.path().join("office.conf"), office).unwrap();
        assert_eq!(fx.registry.discover(false).await.unwrap(), 2);

        fs::remove_file(fx.dir.path().join("office.conf")).unwrap();
        assert_eq!(fx.registry.discover(false).await.unwrap(), 1);
        assert!(fx.registry.require("office").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_autostart_on_startup() {
        let fx = Fixture::new(FakeControl::default()).await;
        let registry = Registry::new(
            fx.ctx.clone(),
            fx.dir.path().to_path_buf(),
            None,
            vec!["wg0".to_string()],
        );
        registry.discover(true).await.unwrap();
        assert!(registry.get("wg0").await.unwrap().lock().await.is_up());
        assert_eq!(fx.control.calls(), vec!["up wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_create_rejects_conflicts() {
        let fx = Fixture::new(FakeControl::default()).await;

        let port = fx
            .registry
            .create(Protocol::Wg, new_configuration("wg1", "10.1.0.1/24", 51820))
            .await
            .err()
            .unwrap();
        assert!(matches!(port, Error::Validation(_)));

        let subnet = fx
            .registry
            .create(Protocol::Wg, new_configuration("wg1", "10.0.0.129/25", 51821))
            .await
            .err()
            .unwrap();
        assert!(matches!(subnet, Error::Validation(_)));

        let awg = fx
            .registry
            .create(Protocol::Awg, new_configuration("awg0", "10.2.0.1/24", 51822))
            .await;
        assert!(awg.is_err());

        fx.registry
            .create(Protocol::Wg, new_configuration("wg1", "10.1.0.1/24", 51821))
            .await
            .unwrap();
        assert_eq!(fx.registry.names().await, vec!["wg0".to_string(), "wg1".to_string()]);
        assert!(fx.dir.path().join("wg1.conf").exists());
    }

    #[tokio::test]
    async fn test_names_cannot_reach_another_configurations_tables() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        {
            let handle = fx.registry.require("wg0").await.unwrap();
            let mut config = handle.lock().await;
            config.delete_peers(&["P1=".to_string()]).await.unwrap();
        }

        let err = fx
            .registry
            .create(Protocol::Wg, new_configuration("wg0_deleted", "10.1.0.1/24", 51821))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!fx.dir.path().join("wg0_deleted.conf").exists());

        let (private_key, _) = generate_keypair();
        fs::write(
            fx.dir.path().join("wg0_transfer.conf"),
            wg0_conf(&private_key).replace("10.0.0.", "10.2.0."),
        )
        .unwrap();
        assert_eq!(fx.registry.discover(false).await.unwrap(), 1);

        fx.registry
            .create(Protocol::Wg, new_configuration("wg1", "10.1.0.1/24", 51821))
            .await
            .unwrap();
        let err = fx.registry.rename("wg1", "wg0_deleted").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(fx.registry.names().await, vec!["wg0".to_string(), "wg1".to_string()]);

        let deleted = fx.store.peers("wg0", PeerTable::Deleted).await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].id, "P1=");
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let fx = Fixture::new(FakeControl::default()).await;
        fx.registry.rename("wg0", "office").await.unwrap();
        assert_eq!(fx.registry.names().await, vec!["office".to_string()]);
        assert_eq!(
            fx.registry.require("office").await.unwrap().lock().await.name(),
            "office"
        );

        fx.registry.delete("office").await.unwrap();
        assert!(fx.registry.names().await.is_empty());
        assert!(!fx.dir.path().join("office.conf").exists());
        assert!(fx.registry.delete("office").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_settings_port_must_stay_unique() {
        let fx = Fixture::new(FakeControl::default()).await;
        fx.registry
            .create(Protocol::Wg, new_configuration("wg1", "10.1.0.1/24", 51821))
            .await
            .unwrap();
        let update = SettingsUpdate::new().set(InterfaceField::ListenPort, "51820");
        assert!(fx.registry.update_settings("wg1", &update).await.is_err());

        let update = SettingsUpdate::new().set(InterfaceField::ListenPort, "51830");
        fx.registry.update_settings("wg1", &update).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_peer_resolves_client_config() {
        let fx = Fixture::new(FakeControl::up(&["wg0"])).await;
        let handle = fx.registry.require("wg0").await.unwrap();
        let id = {
            let mut config = handle.lock().await;
            let added = config.bulk_add_peers(1, BulkPeerOptions::default()).await.unwrap();
            config.share_peer(&added[0].id, None).await.unwrap()
        };
        let client = fx.registry.shared_peer(&id).await.unwrap();
        assert!(client.file.contains("Address = 10.0.0.4/32"));
        assert!(fx.registry.shared_peer("nope").await.unwrap_err().is_not_found());
    }
}
