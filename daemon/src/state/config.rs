//! Persisted configuration: server registry and plugin instance table.
//!
//! Both the relational server registry and the plugin instance table are
//! named external collaborators (their real home is the relational store);
//! here they are abstracted as [`ServerRegistry`]/[`InstanceRegistry`]
//! traits with a TOML-file default implementation standing in for it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use aegis_core::{ConfigValue, ServerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a server's log plane is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSourceConfig {
    LocalFile {
        path: String,
        #[serde(default)]
        read_from_start: bool,
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
    },
    RemoteFileTransfer {
        host: String,
        path: String,
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
    },
}

fn default_poll_interval_secs() -> u64 {
    2
}

impl LogSourceConfig {
    pub fn poll_interval_secs(&self) -> u64 {
        match self {
            LogSourceConfig::LocalFile {
                poll_interval_secs, ..
            } => *poll_interval_secs,
            LogSourceConfig::RemoteFileTransfer {
                poll_interval_secs, ..
            } => *poll_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: ServerId,
    pub name: String,
    pub command_address: String,
    pub command_password: String,
    pub log_source: LogSourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInstanceEntry {
    pub id: Uuid,
    pub server_id: ServerId,
    pub plugin_id: String,
    pub name: String,
    pub config: ConfigValue,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AegisConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
    #[serde(default)]
    pub plugin_instances: HashMap<String, PluginInstanceEntry>,
}

pub fn default_config_path() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aegis");
    dir.join("config.toml")
}

pub fn load(path: &Path) -> AegisConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<AegisConfig>(&contents) {
            Ok(config) => {
                tracing::info!("loaded config from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                AegisConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let defaults = AegisConfig::default();
            tracing::info!("no config file found, creating {}", path.display());
            save_to(path, &defaults);
            defaults
        }
        Err(e) => {
            tracing::warn!("failed to read {}: {e}", path.display());
            AegisConfig::default()
        }
    }
}

pub fn save_to(path: &Path, config: &AegisConfig) {
    if let Some(dir) = path.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        tracing::warn!("failed to create config dir {}: {e}", dir.display());
        return;
    }
    match toml::to_string_pretty(config) {
        Ok(contents) => {
            if let Err(e) = std::fs::write(path, contents) {
                tracing::warn!("failed to write {}: {e}", path.display());
            }
        }
        Err(e) => tracing::warn!("failed to serialize config: {e}"),
    }
}

/// Cached, disk-backed configuration. Reads clone out of the cache; writes
/// take the write lock, mutate, and persist immediately.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<AegisConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        let config = load(&path);
        Self {
            path,
            inner: RwLock::new(config),
        }
    }

    pub fn snapshot(&self) -> AegisConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut AegisConfig)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        save_to(&self.path, &guard);
    }
}

// ---------------------------------------------------------------------------
// Registry ports — the relational store's actual home is out of scope;
// these traits are the contract the daemon core holds it to.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn list(&self) -> Vec<ServerEntry>;
    async fn get(&self, id: ServerId) -> Option<ServerEntry>;
    async fn upsert(&self, entry: ServerEntry);
    async fn remove(&self, id: ServerId);
}

#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    async fn list(&self) -> Vec<PluginInstanceEntry>;
    async fn list_for_server(&self, server_id: ServerId) -> Vec<PluginInstanceEntry>;
    async fn get(&self, id: Uuid) -> Option<PluginInstanceEntry>;
    async fn upsert(&self, entry: PluginInstanceEntry);
    async fn remove(&self, id: Uuid);
}

/// Default in-process implementation of both registries, backed by the
/// same TOML file. A real deployment swaps this for a relational-store
/// client behind the same two trait objects.
pub struct TomlStore {
    config: ConfigStore,
}

impl TomlStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            config: ConfigStore::new(path),
        }
    }

    pub fn snapshot(&self) -> AegisConfig {
        self.config.snapshot()
    }
}

#[async_trait]
impl ServerRegistry for TomlStore {
    async fn list(&self) -> Vec<ServerEntry> {
        self.config.snapshot().servers.into_values().collect()
    }

    async fn get(&self, id: ServerId) -> Option<ServerEntry> {
        self.config
            .snapshot()
            .servers
            .into_values()
            .find(|s| s.id == id)
    }

    async fn upsert(&self, entry: ServerEntry) {
        self.config.update(|c| {
            c.servers.insert(entry.id.to_string(), entry);
        });
    }

    async fn remove(&self, id: ServerId) {
        self.config.update(|c| {
            c.servers.retain(|_, s| s.id != id);
        });
    }
}

#[async_trait]
impl InstanceRegistry for TomlStore {
    async fn list(&self) -> Vec<PluginInstanceEntry> {
        self.config.snapshot().plugin_instances.into_values().collect()
    }

    async fn list_for_server(&self, server_id: ServerId) -> Vec<PluginInstanceEntry> {
        self.config
            .snapshot()
            .plugin_instances
            .into_values()
            .filter(|p| p.server_id == server_id)
            .collect()
    }

    async fn get(&self, id: Uuid) -> Option<PluginInstanceEntry> {
        self.config
            .snapshot()
            .plugin_instances
            .into_values()
            .find(|p| p.id == id)
    }

    async fn upsert(&self, entry: PluginInstanceEntry) {
        self.config.update(|c| {
            c.plugin_instances.insert(entry.id.to_string(), entry);
        });
    }

    async fn remove(&self, id: Uuid) {
        self.config.update(|c| {
            c.plugin_instances.retain(|_, p| p.id != id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_path() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("aegis-test-{}.toml", Uuid::new_v4()));
        p
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_a_server_entry() {
        let store = TomlStore::new(temp_path());
        let id = ServerId::new();
        let entry = ServerEntry {
            id,
            name: "test".into(),
            command_address: "127.0.0.1:27015".into(),
            command_password: "secret".into(),
            log_source: LogSourceConfig::LocalFile {
                path: "/tmp/server.log".into(),
                read_from_start: false,
                poll_interval_secs: 2,
            },
        };
        store.upsert(entry.clone()).await;
        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.name, "test");
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let store = TomlStore::new(temp_path());
        let id = ServerId::new();
        store
            .upsert(ServerEntry {
                id,
                name: "test".into(),
                command_address: "127.0.0.1:27015".into(),
                command_password: "secret".into(),
                log_source: LogSourceConfig::LocalFile {
                    path: "/tmp/server.log".into(),
                    read_from_start: false,
                    poll_interval_secs: 2,
                },
            })
            .await;
        store.remove(id).await;
        assert!(store.get(id).await.is_none());
    }
}
