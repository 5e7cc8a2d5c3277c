//! Unified event schema.
//!
//! Every event that crosses the bus is an `Event`: a closed, tagged payload
//! union plus the envelope fields every external consumer (ingester,
//! columnar store, HTTP collaborator) needs regardless of payload shape. An
//! envelope wrapping a sealed tagged-union payload, split the same way the
//! wire-level message types elsewhere in this codebase are.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::ids::{EventId, ServerId};

// ---------------------------------------------------------------------------
// Raw payload — hex-first policy: binary serializes as hex, text
// serializes as-is.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum RawPayload {
    Binary(Vec<u8>),
    Text(String),
}

impl Serialize for RawPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawPayload::Binary(bytes) => {
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                serializer.serialize_str(&hex)
            }
            RawPayload::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for RawPayload {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(RawPayload::Text(s))
    }
}

impl fmt::Display for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawPayload::Binary(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            RawPayload::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Player identity
// ---------------------------------------------------------------------------

/// A player reference. Every payload that names a player carries both the
/// platform id (e.g. Steam64) and the engine id (the game's internal player
/// id) — they are never interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRef {
    pub engine_id: String,
    pub platform_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<u8>,
}

// ---------------------------------------------------------------------------
// EventType — closed enumeration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ChatMessage,
    PlayerWarned,
    PlayerKicked,
    PlayerBanned,
    AdminCameraPossessed,
    AdminCameraUnpossessed,
    SquadCreated,
    ServerInfo,
    AdminBroadcast,
    DeployableDamaged,
    PlayerConnected,
    PlayerDisconnected,
    PlayerDamaged,
    PlayerDied,
    PlayerWounded,
    PlayerRevived,
    PlayerPossess,
    JoinSucceeded,
    TickRate,
    GameEvent,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub chat_type: String,
    pub player: PlayerRef,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWarnedPayload {
    pub player: PlayerRef,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerKickedPayload {
    pub player: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerBannedPayload {
    pub player: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCameraPossessedPayload {
    pub admin: PlayerRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminCameraUnpossessedPayload {
    pub admin: PlayerRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadCreatedPayload {
    pub player: PlayerRef,
    pub squad_id: String,
    pub squad_name: String,
    pub team_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfoPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_player_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_count: Option<u32>,
    /// Any fields the `ShowServerInfo` response carries beyond the above,
    /// kept so the ingester's per-type inserter can still drop unknown
    /// fields without data loss upstream of it.
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminBroadcastPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployableDamagedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub deployable: String,
    pub damage: f64,
    pub weapon: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker: Option<PlayerRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConnectedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub player: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDisconnectedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub player: PlayerRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDamagedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub victim: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker: Option<PlayerRef>,
    pub damage: f64,
    pub weapon: String,
    pub teamkill: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerDiedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub victim: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker: Option<PlayerRef>,
    pub weapon: String,
    pub teamkill: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWoundedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub victim: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker: Option<PlayerRef>,
    pub weapon: String,
    pub teamkill: bool,
    /// Filled in from a preceding damage line sharing this wound's
    /// `chain_id`, when one was seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRevivedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub reviver: PlayerRef,
    pub victim: PlayerRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerPossessPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub player: PlayerRef,
    pub possess_class: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSucceededPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub player: PlayerRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub tick_rate: f64,
}

/// `kind` tag for the unified `GameEvent`: any of ticket update, match
/// winner, round ended, new game. Variant-specific fields ride in
/// `data_json` (a JSON-stringified payload) rather than widening the
/// closed schema with a field per rare variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventKind {
    TicketUpdate,
    MatchWinner,
    RoundEnded,
    NewGame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub kind: GameEventKind,
    pub data_json: String,
}

// ---------------------------------------------------------------------------
// EventPayload — sealed tagged union over the closed variant list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    ChatMessage(ChatMessagePayload),
    PlayerWarned(PlayerWarnedPayload),
    PlayerKicked(PlayerKickedPayload),
    PlayerBanned(PlayerBannedPayload),
    AdminCameraPossessed(AdminCameraPossessedPayload),
    AdminCameraUnpossessed(AdminCameraUnpossessedPayload),
    SquadCreated(SquadCreatedPayload),
    ServerInfo(ServerInfoPayload),
    AdminBroadcast(AdminBroadcastPayload),
    DeployableDamaged(DeployableDamagedPayload),
    PlayerConnected(PlayerConnectedPayload),
    PlayerDisconnected(PlayerDisconnectedPayload),
    PlayerDamaged(PlayerDamagedPayload),
    PlayerDied(PlayerDiedPayload),
    PlayerWounded(PlayerWoundedPayload),
    PlayerRevived(PlayerRevivedPayload),
    PlayerPossess(PlayerPossessPayload),
    JoinSucceeded(JoinSucceededPayload),
    TickRate(TickRatePayload),
    GameEvent(GameEventPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ChatMessage(_) => EventType::ChatMessage,
            EventPayload::PlayerWarned(_) => EventType::PlayerWarned,
            EventPayload::PlayerKicked(_) => EventType::PlayerKicked,
            EventPayload::PlayerBanned(_) => EventType::PlayerBanned,
            EventPayload::AdminCameraPossessed(_) => EventType::AdminCameraPossessed,
            EventPayload::AdminCameraUnpossessed(_) => EventType::AdminCameraUnpossessed,
            EventPayload::SquadCreated(_) => EventType::SquadCreated,
            EventPayload::ServerInfo(_) => EventType::ServerInfo,
            EventPayload::AdminBroadcast(_) => EventType::AdminBroadcast,
            EventPayload::DeployableDamaged(_) => EventType::DeployableDamaged,
            EventPayload::PlayerConnected(_) => EventType::PlayerConnected,
            EventPayload::PlayerDisconnected(_) => EventType::PlayerDisconnected,
            EventPayload::PlayerDamaged(_) => EventType::PlayerDamaged,
            EventPayload::PlayerDied(_) => EventType::PlayerDied,
            EventPayload::PlayerWounded(_) => EventType::PlayerWounded,
            EventPayload::PlayerRevived(_) => EventType::PlayerRevived,
            EventPayload::PlayerPossess(_) => EventType::PlayerPossess,
            EventPayload::JoinSucceeded(_) => EventType::JoinSucceeded,
            EventPayload::TickRate(_) => EventType::TickRate,
            EventPayload::GameEvent(_) => EventType::GameEvent,
        }
    }

    /// Chain id correlating this event to other log lines describing the
    /// same in-game occurrence, if the variant carries one.
    pub fn chain_id(&self) -> Option<&str> {
        match self {
            EventPayload::AdminBroadcast(p) => p.chain_id.as_deref(),
            EventPayload::DeployableDamaged(p) => p.chain_id.as_deref(),
            EventPayload::PlayerConnected(p) => p.chain_id.as_deref(),
            EventPayload::PlayerDisconnected(p) => p.chain_id.as_deref(),
            EventPayload::PlayerDamaged(p) => p.chain_id.as_deref(),
            EventPayload::PlayerDied(p) => p.chain_id.as_deref(),
            EventPayload::PlayerWounded(p) => p.chain_id.as_deref(),
            EventPayload::PlayerRevived(p) => p.chain_id.as_deref(),
            EventPayload::PlayerPossess(p) => p.chain_id.as_deref(),
            EventPayload::JoinSucceeded(p) => p.chain_id.as_deref(),
            EventPayload::TickRate(p) => p.chain_id.as_deref(),
            EventPayload::GameEvent(p) => p.chain_id.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event — the bus envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub server_id: ServerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawPayload>,
    pub timestamp: DateTime<Utc>,
    pub data: EventPayload,
}

impl Event {
    /// Stamp a fresh envelope (id + timestamp) around a payload.
    pub fn new(server_id: ServerId, data: impl Into<EventPayload>) -> Self {
        Self {
            id: EventId::new(),
            server_id,
            raw: None,
            timestamp: Utc::now(),
            data: data.into(),
        }
    }

    pub fn raw(mut self, raw: RawPayload) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for EventPayload {
                fn from(p: $ty) -> Self {
                    EventPayload::$variant(p)
                }
            }
        )*
    };
}

impl_from_payload!(
    ChatMessage(ChatMessagePayload),
    PlayerWarned(PlayerWarnedPayload),
    PlayerKicked(PlayerKickedPayload),
    PlayerBanned(PlayerBannedPayload),
    AdminCameraPossessed(AdminCameraPossessedPayload),
    AdminCameraUnpossessed(AdminCameraUnpossessedPayload),
    SquadCreated(SquadCreatedPayload),
    ServerInfo(ServerInfoPayload),
    AdminBroadcast(AdminBroadcastPayload),
    DeployableDamaged(DeployableDamagedPayload),
    PlayerConnected(PlayerConnectedPayload),
    PlayerDisconnected(PlayerDisconnectedPayload),
    PlayerDamaged(PlayerDamagedPayload),
    PlayerDied(PlayerDiedPayload),
    PlayerWounded(PlayerWoundedPayload),
    PlayerRevived(PlayerRevivedPayload),
    PlayerPossess(PlayerPossessPayload),
    JoinSucceeded(JoinSucceededPayload),
    TickRate(TickRatePayload),
    GameEvent(GameEventPayload),
);

// ---------------------------------------------------------------------------
// Subscription filter
// ---------------------------------------------------------------------------

/// `{ types?: set<EventType>, server_ids?: set<ServerId> }`. Empty or absent
/// `types` means "all types"; empty or absent `server_ids` means "all
/// servers" (narrowed further by a subscription's optional scope).
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Option<std::collections::HashSet<EventType>>,
    pub server_ids: Option<std::collections::HashSet<ServerId>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            server_ids: None,
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.types
            && !types.is_empty()
            && !types.contains(&event.event_type())
        {
            return false;
        }
        if let Some(ids) = &self.server_ids
            && !ids.is_empty()
            && !ids.contains(&event.server_id)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::new(
            ServerId::new(),
            ChatMessagePayload {
                chat_type: "ChatAll".into(),
                player: PlayerRef {
                    engine_id: "e1".into(),
                    platform_id: "p1".into(),
                    name: Some("Alice".into()),
                    team_id: None,
                },
                message: "hello".into(),
            },
        )
    }

    #[test]
    fn event_type_is_derived_from_payload() {
        assert_eq!(sample_event().event_type(), EventType::ChatMessage);
    }

    #[test]
    fn empty_filter_types_means_all() {
        let filter = EventFilter::all();
        assert!(filter.matches(&sample_event()));
    }

    #[test]
    fn filter_by_type_excludes_non_matching() {
        let filter = EventFilter::for_types([EventType::PlayerKicked]);
        assert!(!filter.matches(&sample_event()));
        let filter = EventFilter::for_types([EventType::ChatMessage]);
        assert!(filter.matches(&sample_event()));
    }

    #[test]
    fn filter_by_server_scopes_correctly() {
        let event = sample_event();
        let mut ids = std::collections::HashSet::new();
        ids.insert(event.server_id);
        let filter = EventFilter {
            types: None,
            server_ids: Some(ids),
        };
        assert!(filter.matches(&event));

        let filter_other = EventFilter {
            types: None,
            server_ids: Some([ServerId::new()].into_iter().collect()),
        };
        assert!(!filter_other.matches(&event));
    }

    #[test]
    fn json_round_trip_preserves_variant_shape() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), EventType::ChatMessage);
    }
}
