//! Turns one raw log line into a typed event payload, or `None` if the line
//! doesn't match anything this daemon cares about. Lines are matched
//! against a fixed family of regexes rather than a single monolithic one —
//! each family owns its own capture names, and unmatched lines are dropped
//! silently rather than logged (most of a live log is noise).
//!
//! Two correlation caches sit alongside the per-line classifier: a bounded
//! LRU keyed by `chain_id` that lets a later line in the same chain enrich
//! an earlier one (a damage line's amount folded into the wound line that
//! follows it), and a per-round scratchpad that accumulates ticket/winner
//! lines so `NewGame`/`RoundEnded` can stamp `winner_data`/`loser_data`.

use std::collections::HashMap;
use std::sync::Mutex;

use aegis_core::{
    AdminBroadcastPayload, DeployableDamagedPayload, EventPayload, GameEventKind, GameEventPayload,
    JoinSucceededPayload, PlayerConnectedPayload, PlayerDamagedPayload, PlayerDiedPayload,
    PlayerDisconnectedPayload, PlayerPossessPayload, PlayerRef, PlayerRevivedPayload,
    PlayerWoundedPayload, TickRatePayload,
};
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

pub const DEFAULT_CHAIN_CACHE_CAPACITY: usize = 4096;

/// Partial state recorded under a chain id, waiting for a later line in the
/// same chain to consume it.
#[derive(Debug, Clone)]
struct ChainState {
    damage: f64,
}

/// Ticket/winner lines accumulated since the last round boundary.
#[derive(Debug, Clone, Default)]
struct RoundState {
    tickets_by_team: HashMap<u8, u32>,
    winner: Option<MatchWinner>,
}

#[derive(Debug, Clone)]
struct MatchWinner {
    team: u8,
    faction: String,
    tickets: u32,
}

macro_rules! family_re {
    ($fn_name:ident, $pattern:expr) => {
        fn $fn_name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid regex"))
        }
    };
}

family_re!(
    prefix_re,
    r"^\[(?P<timestamp>[0-9.:-]+)\]\[\s*(?P<chain_id>\d+)\](?P<rest>.*)$"
);
family_re!(
    connected_re,
    r"^LogSquad: PlayerController .*? has connected to server, player: (?P<name>.+?), steamid: (?P<platform_id>\d+), ip: (?P<ip>[\d.]+)\|eng:(?P<engine_id>\S+)"
);
family_re!(
    disconnected_re,
    r"^LogSquad: PlayerController .*? has disconnected, player: (?P<name>.+?), steamid: (?P<platform_id>\d+)\|eng:(?P<engine_id>\S+)"
);
family_re!(
    damage_re,
    r"^LogSquadTrace: \[DeathLog\] Player:(?P<victim_name>.+?) KillingDamage=(?P<damage>[\d.]+) from (?P<attacker_name>.+?) caused by (?P<weapon>\S+) \|vic_eng:(?P<victim_eng>\S+)\|vic_plat:(?P<victim_plat>\S+)\|atk_eng:(?P<attacker_eng>\S+)\|atk_plat:(?P<attacker_plat>\S+)\|vic_team:(?P<victim_team>\d+)\|atk_team:(?P<attacker_team>\d+)"
);
family_re!(
    wounded_re,
    r"^LogSquadTrace: \[Wound\] Player:(?P<victim_name>.+?) \|vic_eng:(?P<victim_eng>\S+)\|vic_plat:(?P<victim_plat>\S+)\|atk_eng:(?P<attacker_eng>\S+)\|atk_plat:(?P<attacker_plat>\S+)\|weapon:(?P<weapon>\S+)\|vic_team:(?P<victim_team>\d+)\|atk_team:(?P<attacker_team>\d+)"
);
family_re!(
    died_re,
    r"^LogSquadTrace: \[Died\] Player:(?P<victim_name>.+?) \|vic_eng:(?P<victim_eng>\S+)\|vic_plat:(?P<victim_plat>\S+)\|atk_eng:(?P<attacker_eng>\S+)\|atk_plat:(?P<attacker_plat>\S+)\|weapon:(?P<weapon>\S+)\|vic_team:(?P<victim_team>\d+)\|atk_team:(?P<attacker_team>\d+)"
);
family_re!(
    revived_re,
    r"^LogSquad: Player:(?P<victim_name>.+?)\|vic_eng:(?P<victim_eng>\S+)\|vic_plat:(?P<victim_plat>\S+) has been revived by Player:(?P<reviver_name>.+?)\|rev_eng:(?P<reviver_eng>\S+)\|rev_plat:(?P<reviver_plat>\S+)"
);
family_re!(
    possess_re,
    r"^LogSquad: PossessedPawn=.*PlayerController .*? \(Possessed Pawn Class (?P<class>\S+)\) eng:(?P<engine_id>\S+) plat:(?P<platform_id>\S+)"
);
family_re!(
    join_succeeded_re,
    r"^LogNet: Join succeeded: (?P<name>.+?)\|eng:(?P<engine_id>\S+)\|plat:(?P<platform_id>\S+)"
);
family_re!(
    broadcast_re,
    r"^LogSquad: ADMIN COMMAND: Message broadcasted <(?P<message>.*)> from"
);
family_re!(
    deployable_damaged_re,
    r"^LogSquadTrace: \[DeployableDamage\] Deployable:(?P<deployable>\S+) Damage=(?P<damage>[\d.]+) from (?P<attacker_name>.+?) caused by (?P<weapon>\S+)(?:\|atk_eng:(?P<attacker_eng>\S+)\|atk_plat:(?P<attacker_plat>\S+))?"
);
family_re!(tick_rate_re, r"^LogSquad: USQGameState: Tick Rate: (?P<rate>[\d.]+)");
family_re!(
    match_winner_re,
    r"^LogSquadTrace: \[MatchWinner\] Team:(?P<team>\d+)\|faction:(?P<faction>\S+)\|tickets:(?P<tickets>\d+)"
);
family_re!(
    new_game_re,
    r"^LogWorld: Bringing World .*? up for play .*? \(level '(?P<level>[^']+)'"
);
family_re!(
    round_ended_re,
    r"^LogGameState: Match State Changed from InProgress to WaitingPostMatch"
);
family_re!(
    ticket_update_re,
    r"^LogSquadTrace: Tickets: Team (?P<team>\d+) has (?P<tickets>\d+) tickets remaining"
);

/// Per-line classifier. Keeps a bounded map from engine id to last-known
/// team, populated as lines reveal it, so `PlayerDamaged`/`PlayerDied`/
/// `PlayerWounded` can derive `teamkill` even when a single line doesn't
/// carry both sides' team ids directly.
pub struct LogParser {
    team_by_engine_id: Mutex<LruCache<String, u8>>,
    chain_cache: Mutex<LruCache<String, ChainState>>,
    round: Mutex<RoundState>,
}

impl LogParser {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHAIN_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            team_by_engine_id: Mutex::new(LruCache::new(cap)),
            chain_cache: Mutex::new(LruCache::new(cap)),
            round: Mutex::new(RoundState::default()),
        }
    }

    fn remember_team(&self, engine_id: &str, team: u8) {
        self.team_by_engine_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(engine_id.to_string(), team);
    }

    /// Record a chain's partial state for a later line in the same chain to
    /// pick up.
    fn remember_chain(&self, chain_id: &str, state: ChainState) {
        self.chain_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(chain_id.to_string(), state);
    }

    /// Take (and remove) a chain's partial state, if any was recorded.
    fn take_chain(&self, chain_id: &str) -> Option<ChainState> {
        self.chain_cache.lock().unwrap_or_else(|e| e.into_inner()).pop(chain_id)
    }

    /// Build the `winner_data`/`loser_data` correlation for a round boundary
    /// line, then clear the accumulated round state for the round that's
    /// starting next.
    fn drain_round_correlation(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut extra = serde_json::Map::new();
        let mut round = self.round.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(winner) = round.winner.take() {
            let loser_tickets = round
                .tickets_by_team
                .iter()
                .find(|(team, _)| **team != winner.team)
                .map(|(team, tickets)| serde_json::json!({ "team": team, "tickets": tickets }));
            extra.insert(
                "winner_data".to_string(),
                serde_json::json!({
                    "team": winner.team,
                    "faction": winner.faction,
                    "tickets": winner.tickets,
                }),
            );
            if let Some(loser_data) = loser_tickets {
                extra.insert("loser_data".to_string(), loser_data);
            }
        }
        round.tickets_by_team.clear();
        extra
    }

    /// Classify one raw log line. Returns `None` for lines outside every
    /// known family.
    pub fn parse(&self, line: &str) -> Option<EventPayload> {
        let (chain_id, rest) = match prefix_re().captures(line) {
            Some(caps) => (
                Some(caps["chain_id"].to_string()),
                caps.name("rest").unwrap().as_str().to_string(),
            ),
            None => (None, line.to_string()),
        };
        self.parse_body(chain_id.as_deref(), &rest)
    }

    fn parse_body(&self, chain_id: Option<&str>, rest: &str) -> Option<EventPayload> {
        if let Some(caps) = connected_re().captures(rest) {
            self.remember_from_captures(&caps);
            return Some(
                PlayerConnectedPayload {
                    chain_id: chain_id.map(String::from),
                    player: player_ref(&caps, "engine_id", "platform_id", Some("name")),
                    ip: caps.name("ip").map(|m| m.as_str().to_string()),
                }
                .into(),
            );
        }
        if let Some(caps) = disconnected_re().captures(rest) {
            return Some(
                PlayerDisconnectedPayload {
                    chain_id: chain_id.map(String::from),
                    player: player_ref(&caps, "engine_id", "platform_id", Some("name")),
                }
                .into(),
            );
        }
        if let Some(caps) = damage_re().captures(rest) {
            let teamkill = self.derive_teamkill(&caps);
            let damage: f64 = caps["damage"].parse().unwrap_or(0.0);
            if let Some(id) = chain_id {
                self.remember_chain(id, ChainState { damage });
            }
            return Some(
                PlayerDamagedPayload {
                    chain_id: chain_id.map(String::from),
                    victim: player_ref(&caps, "victim_eng", "victim_plat", Some("victim_name")),
                    attacker: Some(player_ref(&caps, "attacker_eng", "attacker_plat", Some("attacker_name"))),
                    damage,
                    weapon: caps["weapon"].to_string(),
                    teamkill,
                }
                .into(),
            );
        }
        if let Some(caps) = wounded_re().captures(rest) {
            let teamkill = self.derive_teamkill(&caps);
            let damage = chain_id.and_then(|id| self.take_chain(id)).map(|s| s.damage);
            return Some(
                PlayerWoundedPayload {
                    chain_id: chain_id.map(String::from),
                    victim: player_ref(&caps, "victim_eng", "victim_plat", Some("victim_name")),
                    attacker: Some(player_ref(&caps, "attacker_eng", "attacker_plat", None)),
                    weapon: caps["weapon"].to_string(),
                    teamkill,
                    damage,
                }
                .into(),
            );
        }
        if let Some(caps) = died_re().captures(rest) {
            let teamkill = self.derive_teamkill(&caps);
            return Some(
                PlayerDiedPayload {
                    chain_id: chain_id.map(String::from),
                    victim: player_ref(&caps, "victim_eng", "victim_plat", Some("victim_name")),
                    attacker: Some(player_ref(&caps, "attacker_eng", "attacker_plat", None)),
                    weapon: caps["weapon"].to_string(),
                    teamkill,
                }
                .into(),
            );
        }
        if let Some(caps) = revived_re().captures(rest) {
            return Some(
                PlayerRevivedPayload {
                    chain_id: chain_id.map(String::from),
                    reviver: player_ref(&caps, "reviver_eng", "reviver_plat", Some("reviver_name")),
                    victim: player_ref(&caps, "victim_eng", "victim_plat", Some("victim_name")),
                }
                .into(),
            );
        }
        if let Some(caps) = possess_re().captures(rest) {
            return Some(
                PlayerPossessPayload {
                    chain_id: chain_id.map(String::from),
                    player: player_ref(&caps, "engine_id", "platform_id", None),
                    possess_class: caps["class"].to_string(),
                }
                .into(),
            );
        }
        if let Some(caps) = join_succeeded_re().captures(rest) {
            return Some(
                JoinSucceededPayload {
                    chain_id: chain_id.map(String::from),
                    player: player_ref(&caps, "engine_id", "platform_id", Some("name")),
                }
                .into(),
            );
        }
        if let Some(caps) = broadcast_re().captures(rest) {
            return Some(
                AdminBroadcastPayload {
                    chain_id: chain_id.map(String::from),
                    message: caps["message"].to_string(),
                }
                .into(),
            );
        }
        if let Some(caps) = deployable_damaged_re().captures(rest) {
            let attacker = caps.name("attacker_eng").map(|_| PlayerRef {
                engine_id: caps["attacker_eng"].to_string(),
                platform_id: caps.name("attacker_plat").map(|m| m.as_str().to_string()).unwrap_or_default(),
                name: caps.name("attacker_name").map(|m| m.as_str().to_string()),
                team_id: None,
            });
            return Some(
                DeployableDamagedPayload {
                    chain_id: chain_id.map(String::from),
                    deployable: caps["deployable"].to_string(),
                    damage: caps["damage"].parse().unwrap_or(0.0),
                    weapon: caps["weapon"].to_string(),
                    attacker,
                }
                .into(),
            );
        }
        if let Some(caps) = tick_rate_re().captures(rest) {
            return Some(
                TickRatePayload {
                    chain_id: chain_id.map(String::from),
                    tick_rate: caps["rate"].parse().unwrap_or(0.0),
                }
                .into(),
            );
        }
        if let Some(caps) = match_winner_re().captures(rest) {
            let team: u8 = caps["team"].parse().unwrap_or(0);
            let faction = caps["faction"].to_string();
            let tickets: u32 = caps["tickets"].parse().unwrap_or(0);
            self.round.lock().unwrap_or_else(|e| e.into_inner()).winner = Some(MatchWinner {
                team,
                faction: faction.clone(),
                tickets,
            });
            return Some(
                GameEventPayload {
                    chain_id: chain_id.map(String::from),
                    kind: GameEventKind::MatchWinner,
                    data_json: serde_json::json!({
                        "team": team,
                        "faction": faction,
                        "tickets": tickets,
                    })
                    .to_string(),
                }
                .into(),
            );
        }
        if let Some(caps) = new_game_re().captures(rest) {
            let mut data = serde_json::Map::new();
            data.insert("level".to_string(), serde_json::Value::String(caps["level"].to_string()));
            data.extend(self.drain_round_correlation());
            return Some(
                GameEventPayload {
                    chain_id: chain_id.map(String::from),
                    kind: GameEventKind::NewGame,
                    data_json: serde_json::Value::Object(data).to_string(),
                }
                .into(),
            );
        }
        if round_ended_re().is_match(rest) {
            let data = self.drain_round_correlation();
            return Some(
                GameEventPayload {
                    chain_id: chain_id.map(String::from),
                    kind: GameEventKind::RoundEnded,
                    data_json: serde_json::Value::Object(data).to_string(),
                }
                .into(),
            );
        }
        if let Some(caps) = ticket_update_re().captures(rest) {
            let team: u8 = caps["team"].parse().unwrap_or(0);
            let tickets: u32 = caps["tickets"].parse().unwrap_or(0);
            self.round
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .tickets_by_team
                .insert(team, tickets);
            return Some(
                GameEventPayload {
                    chain_id: chain_id.map(String::from),
                    kind: GameEventKind::TicketUpdate,
                    data_json: serde_json::json!({
                        "team": team,
                        "tickets": tickets,
                    })
                    .to_string(),
                }
                .into(),
            );
        }
        None
    }

    fn remember_from_captures(&self, caps: &regex::Captures) {
        if let (Some(eng), Some(team)) = (caps.name("engine_id"), caps.name("team")) {
            if let Ok(team) = team.as_str().parse() {
                self.remember_team(eng.as_str(), team);
            }
        }
    }

    /// A line is a teamkill when both sides' teams are known and equal.
    /// Falls back to the per-engine-id team cache when a line only states
    /// one side's team directly (e.g. a wound line that omits the
    /// attacker's team because they've since disconnected).
    fn derive_teamkill(&self, caps: &regex::Captures) -> bool {
        let victim_team: Option<u8> = caps.name("victim_team").and_then(|m| m.as_str().parse().ok());
        let attacker_team: Option<u8> = caps.name("attacker_team").and_then(|m| m.as_str().parse().ok());

        if let (Some(v), Some(a)) = (victim_team, attacker_team) {
            if let Some(eng) = caps.name("victim_eng") {
                self.remember_team(eng.as_str(), v);
            }
            if let Some(eng) = caps.name("attacker_eng") {
                self.remember_team(eng.as_str(), a);
            }
            return v == a;
        }

        let cache = self.team_by_engine_id.lock().unwrap_or_else(|e| e.into_inner());
        match (caps.name("victim_eng"), caps.name("attacker_eng")) {
            (Some(v), Some(a)) => {
                let vt = cache.peek(v.as_str());
                let at = cache.peek(a.as_str());
                matches!((vt, at), (Some(vt), Some(at)) if vt == at)
            }
            _ => false,
        }
    }
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

fn player_ref(caps: &regex::Captures, eng_key: &str, plat_key: &str, name_key: Option<&str>) -> PlayerRef {
    PlayerRef {
        engine_id: caps.name(eng_key).map(|m| m.as_str().to_string()).unwrap_or_default(),
        platform_id: caps.name(plat_key).map(|m| m.as_str().to_string()).unwrap_or_default(),
        name: name_key.and_then(|k| caps.name(k)).map(|m| m.as_str().to_string()),
        team_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_player_connected_line() {
        let parser = LogParser::new();
        let line = "[2026.07.28-12.00.00:000][123]LogSquad: PlayerController BP_PlayerController has connected to server, player: Alice, steamid: 76561198000000001, ip: 1.2.3.4|eng:eng-1";
        let payload = parser.parse(line).unwrap();
        match payload {
            EventPayload::PlayerConnected(p) => {
                assert_eq!(p.chain_id.as_deref(), Some("123"));
                assert_eq!(p.player.name.as_deref(), Some("Alice"));
                assert_eq!(p.ip.as_deref(), Some("1.2.3.4"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn derives_teamkill_true_when_teams_match() {
        let parser = LogParser::new();
        let line = "[2026.07.28-12.00.01:000][124]LogSquadTrace: [Died] Player:Bob |vic_eng:eng-2|vic_plat:plat-2|atk_eng:eng-3|atk_plat:plat-3|weapon:BP_Rifle|vic_team:1|atk_team:1";
        let payload = parser.parse(line).unwrap();
        match payload {
            EventPayload::PlayerDied(p) => assert!(p.teamkill),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn derives_teamkill_false_across_teams() {
        let parser = LogParser::new();
        let line = "[2026.07.28-12.00.02:000][125]LogSquadTrace: [Died] Player:Carol |vic_eng:eng-4|vic_plat:plat-4|atk_eng:eng-5|atk_plat:plat-5|weapon:BP_Rifle|vic_team:1|atk_team:2";
        let payload = parser.parse(line).unwrap();
        match payload {
            EventPayload::PlayerDied(p) => assert!(!p.teamkill),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_line_is_dropped() {
        let parser = LogParser::new();
        assert!(parser.parse("LogTemp: totally unrelated noise").is_none());
    }

    #[test]
    fn admin_broadcast_extracts_message() {
        let parser = LogParser::new();
        let line = "[2026.07.28-12.00.03:000][126]LogSquad: ADMIN COMMAND: Message broadcasted <Server restarting soon> from RemoteAdmin";
        let payload = parser.parse(line).unwrap();
        match payload {
            EventPayload::AdminBroadcast(p) => assert_eq!(p.message, "Server restarting soon"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn wound_line_picks_up_damage_from_preceding_damage_line_in_same_chain() {
        let parser = LogParser::new();
        let damage_line = "[2026.07.28-12.00.04:000][127]LogSquadTrace: [DeathLog] Player:Dave KillingDamage=45.5 from Erin caused by BP_Rifle |vic_eng:eng-6|vic_plat:plat-6|atk_eng:eng-7|atk_plat:plat-7|vic_team:1|atk_team:2";
        parser.parse(damage_line).unwrap();

        let wound_line = "[2026.07.28-12.00.04:100][127]LogSquadTrace: [Wound] Player:Dave |vic_eng:eng-6|vic_plat:plat-6|atk_eng:eng-7|atk_plat:plat-7|weapon:BP_Rifle|vic_team:1|atk_team:2";
        let payload = parser.parse(wound_line).unwrap();
        match payload {
            EventPayload::PlayerWounded(p) => assert_eq!(p.damage, Some(45.5)),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn wound_line_without_a_preceding_damage_chain_has_no_damage() {
        let parser = LogParser::new();
        let wound_line = "[2026.07.28-12.00.05:000][128]LogSquadTrace: [Wound] Player:Frank |vic_eng:eng-8|vic_plat:plat-8|atk_eng:eng-9|atk_plat:plat-9|weapon:BP_Rifle|vic_team:1|atk_team:2";
        let payload = parser.parse(wound_line).unwrap();
        match payload {
            EventPayload::PlayerWounded(p) => assert_eq!(p.damage, None),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn round_ended_correlates_winner_and_loser_ticket_lines() {
        let parser = LogParser::new();
        parser.parse("[2026.07.28-12.10.00:000][200]LogSquadTrace: Tickets: Team 1 has 120 tickets remaining").unwrap();
        parser.parse("[2026.07.28-12.10.01:000][201]LogSquadTrace: Tickets: Team 2 has 80 tickets remaining").unwrap();
        parser
            .parse("[2026.07.28-12.10.02:000][202]LogSquadTrace: [MatchWinner] Team:1|faction:USA|tickets:120")
            .unwrap();

        let payload = parser
            .parse("[2026.07.28-12.10.03:000][203]LogGameState: Match State Changed from InProgress to WaitingPostMatch")
            .unwrap();
        match payload {
            EventPayload::GameEvent(p) => {
                assert_eq!(p.kind, GameEventKind::RoundEnded);
                let data: serde_json::Value = serde_json::from_str(&p.data_json).unwrap();
                assert_eq!(data["winner_data"]["team"], 1);
                assert_eq!(data["winner_data"]["faction"], "USA");
                assert_eq!(data["loser_data"]["team"], 2);
                assert_eq!(data["loser_data"]["tickets"], 80);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn round_ended_without_a_winner_line_omits_winner_data() {
        let parser = LogParser::new();
        let payload = parser
            .parse("[2026.07.28-12.20.00:000][210]LogGameState: Match State Changed from InProgress to WaitingPostMatch")
            .unwrap();
        match payload {
            EventPayload::GameEvent(p) => {
                let data: serde_json::Value = serde_json::from_str(&p.data_json).unwrap();
                assert!(data.get("winner_data").is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
