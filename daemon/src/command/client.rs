//! One long-lived framed TCP connection to a single managed server.
//! Thread-per-connection, cooperative read/write loop — grounded on the
//! gspro bridge's `connect_and_run` (non-blocking read with a short
//! timeout, drain-then-act per iteration, exponential backoff on failure)
//! and the mevo client's handshake-then-poll shape.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aegis_core::{
    AdminCameraPossessedPayload, AdminCameraUnpossessedPayload, ChatMessagePayload, Decoded,
    Decoder, EventPayload, Frame, FrameError, PlayerBannedPayload, PlayerKickedPayload,
    PlayerRef, PlayerWarnedPayload, SquadCreatedPayload, frame_type,
};
use rand::Rng;
use regex::Regex;
use std::io::{Read, Write};
use std::sync::OnceLock;
use tokio::sync::{broadcast, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Dialing,
    Authenticating,
    Ready,
    Reconnecting,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no command client is managed for this server id")]
    NoSuchServer,
    #[error("command client is not connected")]
    NotConnected,
    #[error("execute timed out")]
    Timeout,
    #[error("disconnected while waiting for a response")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("authentication failed")]
    AuthenticationFailed,
}

#[derive(Debug, Clone)]
pub struct CommandClientConfig {
    pub address: SocketAddr,
    pub password: String,
    pub dial_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_keepalive: Duration,
    pub max_frame_bytes: usize,
}

impl Default for CommandClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:27015".parse().unwrap(),
            password: String::new(),
            dial_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_keepalive: Duration::from_secs(30),
            max_frame_bytes: aegis_core::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct PendingRequest {
    body: Vec<u8>,
    responder: Option<oneshot::Sender<Result<String, CommandError>>>,
}

struct Shared {
    state: Mutex<ClientState>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_id: AtomicU32,
    shutdown: AtomicBool,
    auth_latched_failed: AtomicBool,
    /// Set once a connection has held `Ready` for 60 continuous seconds;
    /// consumed by the supervisor loop to reset its backoff on the next
    /// disconnect.
    backoff_reset: AtomicBool,
}

/// Client for one server's command plane. Cloning shares the same
/// connection supervisor; only the supervisor thread owns the socket.
#[derive(Clone)]
pub struct CommandClient {
    shared: Arc<Shared>,
    outbound_tx: std::sync::mpsc::Sender<OutboundRequest>,
    push_tx: broadcast::Sender<EventPayload>,
}

struct OutboundRequest {
    id: u32,
    command: String,
}

impl CommandClient {
    /// Spawn the connection supervisor thread and return a handle.
    pub fn connect(config: CommandClientConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            shutdown: AtomicBool::new(false),
            auth_latched_failed: AtomicBool::new(false),
            backoff_reset: AtomicBool::new(false),
        });
        let (outbound_tx, outbound_rx) = std::sync::mpsc::channel();
        let (push_tx, _) = broadcast::channel(1024);

        let thread_shared = Arc::clone(&shared);
        let thread_push_tx = push_tx.clone();
        std::thread::Builder::new()
            .name(format!("command-client:{}", config.address))
            .spawn(move || supervisor_loop(config, thread_shared, outbound_rx, thread_push_tx))
            .expect("failed to spawn command client thread");

        Self {
            shared,
            outbound_tx,
            push_tx,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe_push(&self) -> broadcast::Receiver<EventPayload> {
        self.push_tx.subscribe()
    }

    pub fn close(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    /// Issue a command and wait (up to `timeout`) for the concatenated,
    /// marker-excluded response body.
    pub async fn execute(&self, command: impl Into<String>, timeout: Duration) -> Result<String, CommandError> {
        if self.state() != ClientState::Ready {
            return Err(CommandError::NotConnected);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            PendingRequest {
                body: Vec::new(),
                responder: Some(responder),
            },
        );

        if self
            .outbound_tx
            .send(OutboundRequest {
                id,
                command: command.into(),
            })
            .is_err()
        {
            self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(CommandError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(CommandError::Timeout)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Push-frame parsing
// ---------------------------------------------------------------------------

fn chat_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<chat_type>\w+)\s+(?P<engine_id>\S+)\s+(?P<platform_id>\S+)\s+(?P<name>.+?):\s(?P<message>.*)$").unwrap()
    })
}

fn keyword_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<kw>\w+)\s+(?P<rest>.*)$").unwrap())
}

/// Classify a push frame's obfuscation-stripped body into a typed
/// command-plane event payload. Returns `None` on no match (dropped
/// silently, per the parser's general "unknown lines/frames are ignored"
/// convention).
pub fn parse_push(r#type: u32, body: &str) -> Option<EventPayload> {
    match r#type {
        t if t == frame_type::SERVER_CHAT => {
            let caps = chat_re().captures(body)?;
            Some(
                ChatMessagePayload {
                    chat_type: caps["chat_type"].to_string(),
                    player: PlayerRef {
                        engine_id: caps["engine_id"].to_string(),
                        platform_id: caps["platform_id"].to_string(),
                        name: Some(caps["name"].to_string()),
                        team_id: None,
                    },
                    message: caps["message"].to_string(),
                }
                .into(),
            )
        }
        t if t == frame_type::SERVER_VALUE => parse_keyword_push(body),
        _ => None,
    }
}

fn parse_keyword_push(body: &str) -> Option<EventPayload> {
    let caps = keyword_re().captures(body)?;
    let kw = &caps["kw"];
    let rest = caps["rest"].to_string();
    let fields: Vec<&str> = rest.split_whitespace().collect();

    match kw {
        "AdminCameraPossessed" if fields.len() >= 3 => Some(
            AdminCameraPossessedPayload {
                admin: player_ref(&fields),
            }
            .into(),
        ),
        "AdminCameraUnpossessed" if fields.len() >= 3 => Some(
            AdminCameraUnpossessedPayload {
                admin: player_ref(&fields),
            }
            .into(),
        ),
        "PlayerWarned" if fields.len() >= 3 => Some(
            PlayerWarnedPayload {
                player: player_ref(&fields),
                reason: fields[3..].join(" "),
            }
            .into(),
        ),
        "PlayerKicked" if fields.len() >= 3 => Some(
            PlayerKickedPayload {
                player: player_ref(&fields),
                reason: (fields.len() > 3).then(|| fields[3..].join(" ")),
            }
            .into(),
        ),
        "PlayerBanned" if fields.len() >= 5 => Some(
            PlayerBannedPayload {
                player: player_ref(&fields),
                duration_secs: fields[3].parse().ok(),
                interval: Some(fields[4].to_string()),
                reason: (fields.len() > 5).then(|| fields[5..].join(" ")),
            }
            .into(),
        ),
        "SquadCreated" if fields.len() >= 6 => Some(
            SquadCreatedPayload {
                player: player_ref(&fields),
                squad_id: fields[3].to_string(),
                squad_name: fields[4].to_string(),
                team_name: fields[5].to_string(),
            }
            .into(),
        ),
        _ => None,
    }
}

fn player_ref(fields: &[&str]) -> PlayerRef {
    PlayerRef {
        engine_id: fields[0].to_string(),
        platform_id: fields[1].to_string(),
        name: Some(fields[2].to_string()),
        team_id: None,
    }
}

// ---------------------------------------------------------------------------
// Supervisor loop
// ---------------------------------------------------------------------------

fn set_state(shared: &Shared, state: ClientState) {
    *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
}

fn fail_all_pending(shared: &Shared) {
    let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
    for (_, mut req) in pending.drain() {
        if let Some(responder) = req.responder.take() {
            let _ = responder.send(Err(CommandError::Disconnected));
        }
    }
}

/// Full jitter: a uniform random duration in `[0, backoff]`, so that many
/// clients reconnecting after a shared outage don't all retry in lockstep.
fn jittered(backoff: Duration) -> Duration {
    let millis = backoff.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

fn supervisor_loop(
    config: CommandClientConfig,
    shared: Arc<Shared>,
    outbound_rx: std::sync::mpsc::Receiver<OutboundRequest>,
    push_tx: broadcast::Sender<EventPayload>,
) {
    let mut backoff = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            set_state(&shared, ClientState::Disconnected);
            return;
        }
        if shared.auth_latched_failed.load(Ordering::Relaxed) {
            // Non-retryable until config changes; idle until shutdown.
            std::thread::sleep(Duration::from_millis(500));
            continue;
        }

        set_state(&shared, ClientState::Dialing);
        match connect_and_run(&config, &shared, &outbound_rx, &push_tx) {
            Ok(()) => {
                set_state(&shared, ClientState::Disconnected);
                return;
            }
            Err(CommandError::AuthenticationFailed) => {
                shared.auth_latched_failed.store(true, Ordering::Relaxed);
                fail_all_pending(&shared);
                set_state(&shared, ClientState::Disconnected);
                tracing::warn!("command client {}: authentication failed, latched", config.address);
            }
            Err(e) => {
                tracing::warn!("command client {}: {e}, reconnecting in {backoff:?}", config.address);
                fail_all_pending(&shared);
                set_state(&shared, ClientState::Reconnecting);
                if shared.backoff_reset.swap(false, Ordering::Relaxed) {
                    backoff = Duration::from_secs(1);
                }
                std::thread::sleep(jittered(backoff));
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

fn connect_and_run(
    config: &CommandClientConfig,
    shared: &Arc<Shared>,
    outbound_rx: &std::sync::mpsc::Receiver<OutboundRequest>,
    push_tx: &broadcast::Sender<EventPayload>,
) -> Result<(), CommandError> {
    let mut stream = TcpStream::connect_timeout(&config.address, config.dial_timeout)
        .map_err(|_| CommandError::NotConnected)?;
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(Duration::from_millis(50))).ok();
    stream.set_write_timeout(Some(config.write_timeout)).ok();

    set_state(shared, ClientState::Authenticating);
    let auth_frame = Frame::new(0, frame_type::AUTH_REQUEST, config.password.clone().into_bytes());
    stream
        .write_all(&auth_frame.encode(config.max_frame_bytes)?)
        .map_err(|_| CommandError::NotConnected)?;

    let mut decoder = Decoder::new(config.max_frame_bytes);
    let auth_deadline = Instant::now() + config.dial_timeout;
    let mut read_buf = vec![0u8; 4096];
    loop {
        if Instant::now() > auth_deadline {
            return Err(CommandError::Timeout);
        }
        match stream.read(&mut read_buf) {
            Ok(0) => return Err(CommandError::NotConnected),
            Ok(n) => decoder.feed(&read_buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return Err(CommandError::NotConnected),
        }
        match decoder.pop()? {
            Some(Decoded::Frame(f)) if f.r#type == frame_type::AUTH_RESPONSE => {
                if f.body.first().copied().unwrap_or(0) != 0 {
                    break;
                } else {
                    return Err(CommandError::AuthenticationFailed);
                }
            }
            _ => continue,
        }
    }

    set_state(shared, ClientState::Ready);
    tracing::info!("command client {}: ready", config.address);
    let ready_since = Instant::now();
    let mut last_sent = Instant::now();

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut activity = false;

        match stream.read(&mut read_buf) {
            Ok(0) => return Err(CommandError::NotConnected),
            Ok(n) => {
                decoder.feed(&read_buf[..n]);
                activity = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return Err(CommandError::NotConnected),
        }

        loop {
            match decoder.pop() {
                Ok(Some(Decoded::Keepalive)) => continue,
                Ok(Some(Decoded::Frame(frame))) => handle_inbound_frame(shared, push_tx, frame),
                Ok(None) => break,
                Err(e) => return Err(e.into()),
            }
        }

        while let Ok(req) = outbound_rx.try_recv() {
            let frame = Frame::new(req.id, frame_type::COMMAND_REQUEST, req.command.into_bytes());
            match frame.encode(config.max_frame_bytes) {
                Ok(wire) => {
                    if stream.write_all(&wire).is_err() {
                        return Err(CommandError::NotConnected);
                    }
                    last_sent = Instant::now();
                    activity = true;
                }
                Err(e) => {
                    let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(mut pending_req) = pending.remove(&req.id)
                        && let Some(responder) = pending_req.responder.take()
                    {
                        let _ = responder.send(Err(CommandError::Protocol(e)));
                    }
                }
            }
        }

        if last_sent.elapsed() >= config.idle_keepalive {
            if stream.write_all(&Frame::encode_keepalive()).is_err() {
                return Err(CommandError::NotConnected);
            }
            last_sent = Instant::now();
            activity = true;
        }

        if ready_since.elapsed() >= Duration::from_secs(60) {
            shared.backoff_reset.store(true, Ordering::Relaxed);
        }

        if !activity {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn handle_inbound_frame(shared: &Arc<Shared>, push_tx: &broadcast::Sender<EventPayload>, frame: Frame) {
    if frame.r#type == frame_type::COMMAND_RESPONSE {
        let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(req) = pending.get_mut(&frame.id) {
            if frame.is_end_of_response_marker() {
                let body = std::mem::take(&mut req.body);
                if let Some(responder) = req.responder.take() {
                    let _ = responder.send(Ok(String::from_utf8_lossy(&body).into_owned()));
                }
                pending.remove(&frame.id);
            } else {
                req.body.extend_from_slice(&frame.body);
            }
        }
        // No pending waiter: either a late response after timeout (the
        // waiter is gone — discard silently) or an unsolicited response
        // frame; both are dropped.
        return;
    }

    if let Some(payload) = parse_push(frame.r#type, &String::from_utf8_lossy(&frame.body)) {
        let _ = push_tx.send(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_push_frame() {
        let payload = parse_push(frame_type::SERVER_CHAT, "ChatAll eng123 plat456 Alice: hello").unwrap();
        match payload {
            EventPayload::ChatMessage(p) => {
                assert_eq!(p.chat_type, "ChatAll");
                assert_eq!(p.message, "hello");
                assert_eq!(p.player.name.as_deref(), Some("Alice"));
            }
            _ => panic!("expected ChatMessage"),
        }
    }

    #[test]
    fn parses_player_kicked_push_frame() {
        let payload = parse_push(frame_type::SERVER_VALUE, "PlayerKicked eng1 plat1 Bob team switch abuse").unwrap();
        match payload {
            EventPayload::PlayerKicked(p) => {
                assert_eq!(p.player.platform_id, "plat1");
                assert_eq!(p.reason.as_deref(), Some("team switch abuse"));
            }
            _ => panic!("expected PlayerKicked"),
        }
    }

    #[test]
    fn unknown_push_keyword_is_dropped() {
        assert!(parse_push(frame_type::SERVER_VALUE, "SomethingUnknown a b c").is_none());
    }

    #[test]
    fn jitter_never_exceeds_the_backoff_it_was_given() {
        let backoff = Duration::from_secs(8);
        for _ in 0..50 {
            assert!(jittered(backoff) <= backoff);
        }
    }
}
