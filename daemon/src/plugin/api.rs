//! The five collaborator surfaces a running plugin instance is handed: RCON
//! execution, cached server state, a scoped key-value store, structured
//! logging, and temporary-admin management. Each is a thin façade over a
//! shared daemon collaborator (the command manager, an external directory
//! trait) scoped to one `(server_id, plugin_id, instance_id)` triple.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use aegis_core::{PlayerRef, ServerId, ServerInfoPayload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::command::manager::CommandManager;
use crate::command::client::CommandError;

const LOG_RING_CAPACITY: usize = 200;
const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RconAPI
// ---------------------------------------------------------------------------

pub struct RconApi {
    manager: Arc<CommandManager>,
    server_id: ServerId,
}

impl RconApi {
    pub fn new(manager: Arc<CommandManager>, server_id: ServerId) -> Self {
        Self { manager, server_id }
    }

    pub async fn execute(&self, command: impl Into<String>) -> Result<String, CommandError> {
        self.manager.execute(self.server_id, command, DEFAULT_EXECUTE_TIMEOUT).await
    }

    pub async fn broadcast(&self, message: &str) -> Result<String, CommandError> {
        self.execute(format!("AdminBroadcast {message}")).await
    }

    pub async fn warn_player(&self, platform_id: &str, message: &str) -> Result<String, CommandError> {
        self.execute(format!("AdminWarn {platform_id} {message}")).await
    }
}

// ---------------------------------------------------------------------------
// ServerAPI
// ---------------------------------------------------------------------------

pub struct ServerApi {
    manager: Arc<CommandManager>,
    server_id: ServerId,
}

impl ServerApi {
    pub fn new(manager: Arc<CommandManager>, server_id: ServerId) -> Self {
        Self { manager, server_id }
    }

    pub async fn players(&self) -> Vec<PlayerRef> {
        self.manager.cached_players(self.server_id).await
    }

    pub async fn admins(&self) -> Vec<String> {
        self.manager.cached_admins(self.server_id).await
    }

    pub async fn server_info(&self) -> Option<ServerInfoPayload> {
        self.manager.cached_server_info(self.server_id).await
    }
}

// ---------------------------------------------------------------------------
// DatabaseAPI — opaque per-instance key-value store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PluginKvStore: Send + Sync {
    async fn get(&self, scope: &KvScope, key: &str) -> Option<Value>;
    async fn set(&self, scope: &KvScope, key: &str, value: Value);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvScope {
    pub server_id: ServerId,
    pub plugin_id: String,
    pub instance_id: Uuid,
}

#[derive(Default)]
pub struct InMemoryPluginKvStore {
    rows: Mutex<HashMap<(KvScope, String), Value>>,
}

#[async_trait]
impl PluginKvStore for InMemoryPluginKvStore {
    async fn get(&self, scope: &KvScope, key: &str) -> Option<Value> {
        self.rows.lock().await.get(&(scope.clone(), key.to_string())).cloned()
    }

    async fn set(&self, scope: &KvScope, key: &str, value: Value) {
        self.rows.lock().await.insert((scope.clone(), key.to_string()), value);
    }
}

pub struct DatabaseApi {
    store: Arc<dyn PluginKvStore>,
    scope: KvScope,
}

impl DatabaseApi {
    pub fn new(store: Arc<dyn PluginKvStore>, scope: KvScope) -> Self {
        Self { store, scope }
    }

    pub async fn get_plugin_data(&self, key: &str) -> Option<Value> {
        self.store.get(&self.scope, key).await
    }

    pub async fn set_plugin_data(&self, key: &str, value: Value) {
        self.store.set(&self.scope, key, value).await
    }
}

// ---------------------------------------------------------------------------
// LogAPI — process log plus a per-instance ring buffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub kv: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

pub struct LogApi {
    instance_id: Uuid,
    ring: Mutex<VecDeque<LogEntry>>,
}

impl LogApi {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
        }
    }

    pub async fn debug(&self, message: &str, kv: Option<Value>) {
        self.log(LogLevel::Debug, message, kv).await;
    }
    pub async fn info(&self, message: &str, kv: Option<Value>) {
        self.log(LogLevel::Info, message, kv).await;
    }
    pub async fn warn(&self, message: &str, kv: Option<Value>) {
        self.log(LogLevel::Warn, message, kv).await;
    }
    pub async fn error(&self, message: &str, kv: Option<Value>) {
        self.log(LogLevel::Error, message, kv).await;
    }

    async fn log(&self, level: LogLevel, message: &str, kv: Option<Value>) {
        match level {
            LogLevel::Debug => tracing::debug!(instance_id = %self.instance_id, "{message}"),
            LogLevel::Info => tracing::info!(instance_id = %self.instance_id, "{message}"),
            LogLevel::Warn => tracing::warn!(instance_id = %self.instance_id, "{message}"),
            LogLevel::Error => tracing::error!(instance_id = %self.instance_id, "{message}"),
        }
        let mut ring = self.ring.lock().await;
        if ring.len() >= LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            kv: kv.unwrap_or(Value::Null),
        });
    }

    pub async fn recent(&self) -> Vec<LogEntry> {
        self.ring.lock().await.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// AdminAPI — temporary admin grants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TemporaryAdmin {
    pub platform_id: String,
    pub group: String,
    pub notes: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The admin user table is a named external collaborator (the relational
/// store); this trait is the contract the plugin host holds it to.
#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn add_temporary_admin(&self, admin: TemporaryAdmin);
    async fn remove_temporary_admin(&self, platform_id: &str, notes: &str);
    async fn get_player_admin_status(&self, platform_id: &str) -> Option<TemporaryAdmin>;
}

#[derive(Default)]
pub struct InMemoryAdminDirectory {
    admins: Mutex<HashMap<String, TemporaryAdmin>>,
}

#[async_trait]
impl AdminDirectory for InMemoryAdminDirectory {
    async fn add_temporary_admin(&self, admin: TemporaryAdmin) {
        self.admins.lock().await.insert(admin.platform_id.clone(), admin);
    }

    async fn remove_temporary_admin(&self, platform_id: &str, notes: &str) {
        let mut admins = self.admins.lock().await;
        if admins.get(platform_id).is_some_and(|a| a.notes == notes) {
            admins.remove(platform_id);
        }
    }

    async fn get_player_admin_status(&self, platform_id: &str) -> Option<TemporaryAdmin> {
        self.admins.lock().await.get(platform_id).cloned()
    }
}

pub struct AdminApi {
    directory: Arc<dyn AdminDirectory>,
}

impl AdminApi {
    pub fn new(directory: Arc<dyn AdminDirectory>) -> Self {
        Self { directory }
    }

    pub async fn add_temporary_admin(&self, platform_id: &str, group: &str, notes: &str, expires_at: Option<DateTime<Utc>>) {
        self.directory
            .add_temporary_admin(TemporaryAdmin {
                platform_id: platform_id.to_string(),
                group: group.to_string(),
                notes: notes.to_string(),
                expires_at,
            })
            .await;
    }

    pub async fn remove_temporary_admin(&self, platform_id: &str, notes: &str) {
        self.directory.remove_temporary_admin(platform_id, notes).await;
    }

    pub async fn get_player_admin_status(&self, platform_id: &str) -> Option<TemporaryAdmin> {
        self.directory.get_player_admin_status(platform_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_store_round_trips_scoped_values() {
        let store = Arc::new(InMemoryPluginKvStore::default());
        let scope = KvScope {
            server_id: ServerId::new(),
            plugin_id: "chat-logger".into(),
            instance_id: Uuid::new_v4(),
        };
        let api = DatabaseApi::new(store, scope);
        assert!(api.get_plugin_data("k").await.is_none());
        api.set_plugin_data("k", serde_json::json!({"v": 1})).await;
        assert_eq!(api.get_plugin_data("k").await, Some(serde_json::json!({"v": 1})));
    }

    #[tokio::test]
    async fn log_ring_buffer_caps_at_capacity() {
        let api = LogApi::new(Uuid::new_v4());
        for i in 0..(LOG_RING_CAPACITY + 10) {
            api.info(&format!("line {i}"), None).await;
        }
        assert_eq!(api.recent().await.len(), LOG_RING_CAPACITY);
    }

    #[tokio::test]
    async fn admin_directory_add_then_status_then_remove() {
        let directory = Arc::new(InMemoryAdminDirectory::default());
        let api = AdminApi::new(directory);
        api.add_temporary_admin("plat-1", "moderator", "test grant", None).await;
        assert!(api.get_player_admin_status("plat-1").await.is_some());
        api.remove_temporary_admin("plat-1", "test grant").await;
        assert!(api.get_player_admin_status("plat-1").await.is_none());
    }
}
