//! Owns one [`CommandClient`] per managed server, forwards each client's
//! push frames onto the bus as typed events, and polls `ShowServerInfo` on
//! a fixed cadence. Mirrors the supervisor shape the gspro/mevo actors use
//! to own one connection per configured device, generalized to a
//! server-keyed map instead of a single instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aegis_core::{Event, EventPayload, PlayerRef, ServerId, ServerInfoPayload};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::command::client::{CommandClient, CommandClientConfig, CommandError};
use crate::state::config::ServerEntry;

const DEFAULT_SERVER_INFO_POLL: Duration = Duration::from_secs(30);
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(10);

struct ManagedClient {
    client: CommandClient,
    forward_handle: JoinHandle<()>,
    poll_handle: JoinHandle<()>,
}

impl Drop for ManagedClient {
    fn drop(&mut self) {
        self.client.close();
        self.forward_handle.abort();
        self.poll_handle.abort();
    }
}

/// Cached state refreshed on the `ShowServerInfo`/`ListPlayers`/
/// `ListAdmins` poll cadence, read by `ServerAPI` so plugin instances never
/// block a handler call on a live round-trip.
#[derive(Default, Clone)]
struct ServerCache {
    info: Option<ServerInfoPayload>,
    players: Vec<PlayerRef>,
    admins: Vec<String>,
}

pub struct CommandManager {
    bus: EventBus,
    clients: RwLock<HashMap<ServerId, ManagedClient>>,
    cache: Arc<RwLock<HashMap<ServerId, ServerCache>>>,
    server_info_poll_interval: Duration,
}

impl CommandManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            clients: RwLock::new(HashMap::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
            server_info_poll_interval: DEFAULT_SERVER_INFO_POLL,
        }
    }

    pub async fn cached_server_info(&self, server_id: ServerId) -> Option<ServerInfoPayload> {
        self.cache.read().await.get(&server_id).and_then(|c| c.info.clone())
    }

    pub async fn cached_players(&self, server_id: ServerId) -> Vec<PlayerRef> {
        self.cache.read().await.get(&server_id).map(|c| c.players.clone()).unwrap_or_default()
    }

    pub async fn cached_admins(&self, server_id: ServerId) -> Vec<String> {
        self.cache.read().await.get(&server_id).map(|c| c.admins.clone()).unwrap_or_default()
    }

    pub async fn connect_all(&self, servers: &[ServerEntry]) {
        for entry in servers {
            self.add(entry).await;
        }
    }

    pub async fn add(&self, entry: &ServerEntry) {
        let address = match entry.command_address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("server {}: invalid command_address {}: {e}", entry.name, entry.command_address);
                return;
            }
        };
        let config = CommandClientConfig {
            address,
            password: entry.command_password.clone(),
            ..CommandClientConfig::default()
        };
        let client = CommandClient::connect(config);

        let mut push_rx = client.subscribe_push();
        let bus = self.bus.clone();
        let server_id = entry.id;
        let forward_handle = tokio::spawn(async move {
            loop {
                match push_rx.recv().await {
                    Ok(payload) => {
                        bus.publish_event(Event::new(server_id, payload));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("command client {server_id}: push forwarder lagged, dropped {n}");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let poll_client = client.clone();
        let poll_bus = self.bus.clone();
        let poll_cache = Arc::clone(&self.cache);
        let poll_interval = self.server_info_poll_interval;
        let poll_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                match poll_client.execute("ShowServerInfo", EXECUTE_TIMEOUT).await {
                    Ok(body) => {
                        let payload = parse_server_info(&body);
                        poll_cache.write().await.entry(server_id).or_default().info = Some(payload.clone());
                        poll_bus.publish_event(Event::new(server_id, payload));
                    }
                    Err(CommandError::NotConnected) | Err(CommandError::Disconnected) => {}
                    Err(e) => tracing::warn!("server {server_id}: ShowServerInfo poll failed: {e}"),
                }

                if let Ok(body) = poll_client.execute("ListPlayers", EXECUTE_TIMEOUT).await {
                    poll_cache.write().await.entry(server_id).or_default().players = parse_player_list(&body);
                }
                if let Ok(body) = poll_client.execute("ListAdmins", EXECUTE_TIMEOUT).await {
                    poll_cache.write().await.entry(server_id).or_default().admins = parse_admin_list(&body);
                }
            }
        });

        self.clients.write().await.insert(
            entry.id,
            ManagedClient {
                client,
                forward_handle,
                poll_handle,
            },
        );
    }
    pub async fn remove(&self, server_id: ServerId) {
        self.clients.write().await.remove(&server_id);
        self.cache.write().await.remove(&server_id);
    }

    /// Tear down and recreate the client for a server whose config changed.
    pub async fn update(&self, entry: &ServerEntry) {
        self.remove(entry.id).await;
        self.add(entry).await;
    }

    pub async fn execute(
        &self,
        server_id: ServerId,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let command = command.into();
        let client = {
            let guard = self.clients.read().await;
            guard.get(&server_id).map(|m| m.client.clone())
        };
        match client {
            Some(client) => client.execute(command, timeout).await,
            None => Err(CommandError::NoSuchServer),
        }
    }

    pub async fn subscribe_push(&self, server_id: ServerId) -> Option<tokio::sync::broadcast::Receiver<EventPayload>> {
        self.clients
            .read()
            .await
            .get(&server_id)
            .map(|m| m.client.subscribe_push())
    }

    pub async fn server_ids(&self) -> Vec<ServerId> {
        self.clients.read().await.keys().copied().collect()
    }
}

/// `ShowServerInfo` responses are loosely-structured key: value text; fields
/// this daemon cares about are pulled out, everything else rides in `extra`.
fn parse_server_info(body: &str) -> ServerInfoPayload {
    let mut payload = ServerInfoPayload::default();
    let mut extra = serde_json::Map::new();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "ServerName_s" | "ServerName" => payload.server_name = Some(value.to_string()),
            "MapName_s" | "MapName" => payload.map = Some(value.to_string()),
            "PlayerCount_I" | "PlayerCount" => payload.player_count = value.parse().ok(),
            "MaxPlayers" | "MaxPlayerCount_I" => payload.max_player_count = value.parse().ok(),
            "PublicQueue_I" | "QueueCount" => payload.queue_count = value.parse().ok(),
            _ => {
                extra.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
        }
    }
    payload.extra = serde_json::Value::Object(extra);
    payload
}

/// `ListPlayers` is one player per line: `<EngineId> <PlatformId> <Name>`.
fn parse_player_list(body: &str) -> Vec<PlayerRef> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            let engine_id = parts.next()?.to_string();
            let platform_id = parts.next()?.to_string();
            let name = parts.next().map(|s| s.to_string());
            Some(PlayerRef {
                engine_id,
                platform_id,
                name,
                team_id: None,
            })
        })
        .collect()
}

/// `ListAdmins` is one platform id per line.
fn parse_admin_list(body: &str) -> Vec<String> {
    body.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect()
}

/// Convenience constructor for tests and callers that want to inject an
/// already-built [`Arc<CommandManager>`] into [`SystemState`]-less contexts.
pub fn new_shared(bus: EventBus) -> Arc<CommandManager> {
    Arc::new(CommandManager::new(bus))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_on_unmanaged_server_is_distinguishable_from_disconnected() {
        let manager = CommandManager::new(EventBus::default());
        let err = manager
            .execute(ServerId::new(), "ShowServerInfo", EXECUTE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NoSuchServer));
    }

    #[test]
    fn parses_known_server_info_fields() {
        let body = "ServerName_s: My Server\nMapName_s: Narva\nPlayerCount_I: 42\nSomeOtherField_s: value";
        let payload = parse_server_info(body);
        assert_eq!(payload.server_name.as_deref(), Some("My Server"));
        assert_eq!(payload.map.as_deref(), Some("Narva"));
        assert_eq!(payload.player_count, Some(42));
        assert_eq!(
            payload.extra.get("SomeOtherField_s").and_then(|v| v.as_str()),
            Some("value")
        );
    }
}
