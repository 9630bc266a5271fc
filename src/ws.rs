//! WebSocket sessions for the sente Go server.
//!
//! ## Architecture
//!
//! - **`Router`** — A singleton actor mapping pub/sub channel names to the
//!   one session subscribed to each. Sessions register their player key on
//!   bind; the router forwards listen/unlisten commands to the notification
//!   pump and fans incoming notifications back to sessions.
//!
//! - **notification pump** — A task owning the store's `LISTEN` connection.
//!   It applies the router's subscription commands and forwards every
//!   notification. When the connection is re-established after a drop, the
//!   router tells all sessions to resync, because notifications may have
//!   been missed (delivery is at-least-once, not exactly-once).
//!
//! - **`WsSession`** — An actor per WebSocket connection. It parses inbound
//!   JSON commands, round-trips game state through the store, and pushes
//!   store notifications to the client. Inbound handling is strictly FIFO:
//!   every store round-trip runs under `ctx.wait`, which holds the mailbox
//!   until the future resolves.
//!
//! ## Client → Server Protocol
//!
//! | `type`        | Extra Fields                                           |
//! |---------------|--------------------------------------------------------|
//! | `new_game`    | `size`, `komi?`, `handicap?`, `your_color`, `vs_ai?`, `key_to_unsubscribe?` |
//! | `join_game`   | `key`                                                  |
//! | `game_action` | `action: {kind, row?, col?, dead?}`                    |
//! | `chat`        | `message`                                              |
//!
//! ## Server → Client Protocol
//!
//! `new_game_response`, `join_game_response`, `game_status` (always carries
//! `version`), `chat`, `opponent_connected`, `game_action_response`, and
//! `error` with a `kind` from [`ErrorKind`].
//!
//! Game state is never cached between requests: each action loads the blob,
//! applies the move, and writes back guarded by the version counter. A
//! conflicting write loses cleanly and the losing session resyncs.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::game::Game;
use crate::keys;
use crate::store::{self, CreateGame, JoinOutcome, Store, StoreError};
use crate::types::*;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How often the server pings to keep the connection alive.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// How long without a pong before the connection is considered dead.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts at minting a non-colliding key pair before giving up.
const KEY_MINT_ATTEMPTS: u32 = 5;

/// Longest accepted chat line.
const MAX_CHAT_LEN: usize = 1000;

/// This process's 64-character identity, used to claim player keys.
#[derive(Clone)]
pub struct ManagerId(pub String);

// ---------------------------------------------------------------------------
// Pub/sub channel naming
// ---------------------------------------------------------------------------

/// The three notification channels scoped to one player key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    GameStatus,
    Chat,
    OpponentConnected,
}

impl ChannelKind {
    fn prefix(self) -> &'static str {
        match self {
            ChannelKind::GameStatus => "game_status_",
            ChannelKind::Chat => "chat_",
            ChannelKind::OpponentConnected => "opponent_connected_",
        }
    }
}

/// The channel names a session listens on for `key`.
fn channels_for(key: &str) -> [String; 3] {
    [
        format!("game_status_{}", key),
        format!("chat_{}", key),
        format!("opponent_connected_{}", key),
    ]
}

/// Splits a channel name into its kind and player key.
fn parse_channel(channel: &str) -> Option<(ChannelKind, &str)> {
    for kind in [
        ChannelKind::GameStatus,
        ChannelKind::Chat,
        ChannelKind::OpponentConnected,
    ] {
        if let Some(key) = channel.strip_prefix(kind.prefix()) {
            return Some((kind, key));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Notification pump
// ---------------------------------------------------------------------------

/// Subscription commands from the router to the pump.
#[derive(Debug)]
pub enum ListenCmd {
    Listen(String),
    Unlisten(String),
}

/// Owns the store's LISTEN connection. Runs until the command channel
/// closes (process shutdown).
pub async fn run_listener(
    store: Store,
    mut cmds: mpsc::UnboundedReceiver<ListenCmd>,
    router: Addr<Router>,
) {
    let mut listener = loop {
        match store.listener().await {
            Ok(listener) => break listener,
            Err(e) => {
                log::error!("cannot open notification connection: {}", e);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    };

    loop {
        tokio::select! {
            cmd = cmds.recv() => match cmd {
                Some(ListenCmd::Listen(channel)) => {
                    if let Err(e) = listener.listen(&channel).await {
                        log::error!("LISTEN {} failed: {}", channel, e);
                    }
                }
                Some(ListenCmd::Unlisten(channel)) => {
                    if let Err(e) = listener.unlisten(&channel).await {
                        log::debug!("UNLISTEN {} failed: {}", channel, e);
                    }
                }
                None => {
                    log::info!("notification pump shutting down");
                    return;
                }
            },
            received = listener.try_recv() => match received {
                Ok(Some(note)) => {
                    router.do_send(Notification {
                        channel: note.channel().to_string(),
                        payload: note.payload().to_string(),
                    });
                }
                // `None` marks a reconnect: the gap may have swallowed
                // notifications, so force every session to resync.
                Ok(None) => {
                    log::warn!("notification connection re-established; forcing resync");
                    router.do_send(ListenerReset);
                }
                Err(e) => {
                    log::error!("notification stream error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Router — channel → session fan-out (actor)
// ---------------------------------------------------------------------------

/// Registers the three channels of `key` to a session.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RegisterKey {
    pub key: String,
    pub session: Addr<WsSession>,
}

/// Drops the registration for `key`.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ReleaseKey {
    pub key: String,
}

/// A raw notification from the pump.
#[derive(Message)]
#[rtype(result = "()")]
struct Notification {
    channel: String,
    payload: String,
}

/// The pump reconnected; deliveries may have been lost.
#[derive(Message)]
#[rtype(result = "()")]
struct ListenerReset;

/// Singleton actor routing store notifications to sessions.
///
/// At most one session holds any player key (`managed_by` enforces this in
/// the store), so the map is key → single address, not a subscriber set.
pub struct Router {
    sessions: HashMap<String, Addr<WsSession>>,
    cmds: mpsc::UnboundedSender<ListenCmd>,
}

impl Router {
    pub fn new(cmds: mpsc::UnboundedSender<ListenCmd>) -> Self {
        Self { sessions: HashMap::new(), cmds }
    }

    fn send_cmd(&self, cmd: ListenCmd) {
        if self.cmds.send(cmd).is_err() {
            log::error!("notification pump is gone; subscriptions are frozen");
        }
    }
}

impl Actor for Router {
    type Context = Context<Self>;
}

impl Handler<RegisterKey> for Router {
    type Result = ();

    fn handle(&mut self, msg: RegisterKey, _ctx: &mut Context<Self>) {
        log::debug!("router: key {} registered", msg.key);
        for channel in channels_for(&msg.key) {
            self.send_cmd(ListenCmd::Listen(channel));
        }
        self.sessions.insert(msg.key, msg.session);
    }
}

impl Handler<ReleaseKey> for Router {
    type Result = ();

    fn handle(&mut self, msg: ReleaseKey, _ctx: &mut Context<Self>) {
        log::debug!("router: key {} released", msg.key);
        if self.sessions.remove(&msg.key).is_some() {
            for channel in channels_for(&msg.key) {
                self.send_cmd(ListenCmd::Unlisten(channel));
            }
        }
    }
}

impl Handler<Notification> for Router {
    type Result = ();

    fn handle(&mut self, msg: Notification, _ctx: &mut Context<Self>) {
        let Some((kind, key)) = parse_channel(&msg.channel) else {
            log::warn!("notification on unrecognized channel {}", msg.channel);
            return;
        };
        if let Some(session) = self.sessions.get(key) {
            session.do_send(StoreNotification { kind, payload: msg.payload });
        }
    }
}

impl Handler<ListenerReset> for Router {
    type Result = ();

    fn handle(&mut self, _msg: ListenerReset, _ctx: &mut Context<Self>) {
        for session in self.sessions.values() {
            session.do_send(Resync);
        }
    }
}

// ---------------------------------------------------------------------------
// Session messages
// ---------------------------------------------------------------------------

/// A store notification routed to this session's key.
#[derive(Message)]
#[rtype(result = "()")]
pub struct StoreNotification {
    pub kind: ChannelKind,
    pub payload: String,
}

/// Re-read authoritative state; notifications may have been missed.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Resync;

// ---------------------------------------------------------------------------
// WsSession — per-connection actor
// ---------------------------------------------------------------------------

/// The key this session is authenticated for.
#[derive(Debug, Clone)]
struct KeyBinding {
    key: String,
    color: Color,
}

/// A failure to surface to the client. `ServerError` and `Internal` also
/// close the connection.
struct Fault {
    kind: ErrorKind,
    message: String,
}

impl Fault {
    fn internal(message: impl Into<String>) -> Fault {
        Fault { kind: ErrorKind::Internal, message: message.into() }
    }
}

impl From<StoreError> for Fault {
    fn from(err: StoreError) -> Fault {
        Fault { kind: ErrorKind::ServerError, message: err.to_string() }
    }
}

/// Actor for one WebSocket client connection.
pub struct WsSession {
    /// Ephemeral identifier for log correlation.
    id: Uuid,
    last_heartbeat: Instant,
    store: Store,
    router: Addr<Router>,
    manager_id: String,
    /// Set once `new_game` or `join_game` succeeds.
    binding: Option<KeyBinding>,
    /// Highest game version pushed to this client.
    last_version: i64,
    /// Highest chat id pushed to this client.
    last_chat_id: i64,
}

type WsCtx = ws::WebsocketContext<WsSession>;

impl WsSession {
    pub fn new(store: Store, router: Addr<Router>, manager_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_heartbeat: Instant::now(),
            store,
            router,
            manager_id,
            binding: None,
            last_version: 0,
            last_chat_id: 0,
        }
    }

    fn start_heartbeat(&self, ctx: &mut WsCtx) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                log::warn!("WS session {} heartbeat timeout, disconnecting", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    fn send(&self, ctx: &mut WsCtx, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => ctx.text(text),
            Err(e) => log::error!("WS session {}: cannot encode frame: {}", self.id, e),
        }
    }

    fn send_error(&self, ctx: &mut WsCtx, kind: ErrorKind, message: impl Into<String>) {
        self.send(ctx, &ServerMessage::Error { kind, message: message.into() });
    }

    fn fail(&self, ctx: &mut WsCtx, fault: Fault) {
        log::warn!("WS session {}: {:?} {}", self.id, fault.kind, fault.message);
        self.send_error(ctx, fault.kind, fault.message);
        if matches!(fault.kind, ErrorKind::ServerError | ErrorKind::Internal) {
            ctx.close(None);
            ctx.stop();
        }
    }

    /// Pushes a `game_status` if it is newer than anything already sent.
    fn push_status(&mut self, ctx: &mut WsCtx, status: GameStatus) {
        if status.version > self.last_version {
            self.last_version = status.version;
            self.send(ctx, &ServerMessage::GameStatus(status));
        }
    }

    /// Pushes chat rows in order, advancing the last-seen id.
    fn push_chats(&mut self, ctx: &mut WsCtx, entries: Vec<ChatEntry>) {
        for entry in entries {
            self.last_chat_id = self.last_chat_id.max(entry.id);
            self.send(ctx, &ServerMessage::Chat(entry));
        }
    }

    // -----------------------------------------------------------------------
    // Command dispatch
    // -----------------------------------------------------------------------

    fn handle_message(&mut self, text: &str, ctx: &mut WsCtx) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.send_error(
                    ctx,
                    ErrorKind::ClientProtocol,
                    format!("invalid message: {}", e),
                );
                return;
            }
        };

        match msg {
            ClientMessage::NewGame {
                size,
                komi,
                handicap,
                your_color,
                vs_ai,
                key_to_unsubscribe,
            } => self.handle_new_game(
                size,
                komi,
                handicap,
                your_color,
                vs_ai,
                key_to_unsubscribe,
                ctx,
            ),
            ClientMessage::JoinGame { key } => self.handle_join_game(key, ctx),
            ClientMessage::GameAction { action } => self.handle_game_action(action, ctx),
            ClientMessage::Chat { message } => self.handle_chat(message, ctx),
        }
    }

    // -----------------------------------------------------------------------
    // new_game
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn handle_new_game(
        &mut self,
        size: u8,
        komi: Option<f64>,
        handicap: u8,
        your_color: Color,
        vs_ai: bool,
        key_to_unsubscribe: Option<String>,
        ctx: &mut WsCtx,
    ) {
        // A session may only release the key it actually holds; with no
        // explicit request, a held key is released as part of creation.
        let bound_key = self.binding.as_ref().map(|b| b.key.clone());
        let unsubscribe_key = match (&bound_key, key_to_unsubscribe) {
            (Some(bound), Some(requested)) if *bound != requested => {
                self.send_error(
                    ctx,
                    ErrorKind::Unauthorized,
                    "key_to_unsubscribe is not this session's key",
                );
                return;
            }
            (None, Some(_)) => {
                self.send_error(
                    ctx,
                    ErrorKind::Unauthorized,
                    "no key is bound to this session",
                );
                return;
            }
            (bound, _) => bound.clone(),
        };

        let komi = komi.unwrap_or_else(|| Game::default_komi(handicap));
        let game = match Game::new(size, komi, handicap) {
            Ok(game) => game,
            Err(e) => {
                self.send_error(ctx, ErrorKind::ClientProtocol, e.to_string());
                return;
            }
        };
        let blob = match game.to_blob() {
            Ok(blob) => blob,
            Err(e) => {
                self.fail(ctx, Fault::internal(e.to_string()));
                return;
            }
        };

        let store = self.store.clone();
        let manager_id = self.manager_id.clone();
        let fut = async move {
            for _ in 0..KEY_MINT_ATTEMPTS {
                let (white_key, black_key) = store::mint_key_pair();
                let (your_key, opponent_key) = match your_color {
                    Color::White => (white_key.clone(), black_key.clone()),
                    Color::Black => (black_key.clone(), white_key.clone()),
                };
                // The AI attaches to the opponent side through its secret.
                let (mut white_secret, mut black_secret) = (None, None);
                if vs_ai {
                    let secret = Some(keys::generate_ai_secret());
                    match your_color {
                        Color::White => black_secret = secret,
                        Color::Black => white_secret = secret,
                    }
                }

                let params = CreateGame {
                    data: blob.clone(),
                    white_key,
                    black_key,
                    joining_color: Some(your_color),
                    manager_id: Some(manager_id.clone()),
                    unsubscribe_key: unsubscribe_key.clone(),
                    white_ai_secret: white_secret,
                    black_ai_secret: black_secret,
                };
                match store.create_game(&params).await {
                    Ok(_) => return Ok((your_key, opponent_key)),
                    Err(StoreError::KeyCollision) => continue,
                    Err(StoreError::UnsubscribeFailed) => {
                        return Err(Fault {
                            kind: ErrorKind::ServerError,
                            message: "could not release the previous key".into(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(Fault::internal("could not mint a unique key pair"))
        };

        ctx.wait(fut.into_actor(self).map(move |result, act, ctx| match result {
            Ok((your_key, opponent_key)) => {
                log::info!("WS session {}: created game as {}", act.id, your_color);
                if let Some(old) = act.binding.take() {
                    act.router.do_send(ReleaseKey { key: old.key });
                }
                act.binding = Some(KeyBinding { key: your_key.clone(), color: your_color });
                act.last_version = 0;
                act.last_chat_id = 0;
                act.router.do_send(RegisterKey {
                    key: your_key.clone(),
                    session: ctx.address(),
                });
                let status = game.status(0, your_color, 0.0);
                act.send(ctx, &ServerMessage::NewGameResponse { your_key, opponent_key, status });
            }
            Err(fault) => act.fail(ctx, fault),
        }));
    }

    // -----------------------------------------------------------------------
    // join_game
    // -----------------------------------------------------------------------

    fn handle_join_game(&mut self, key: String, ctx: &mut WsCtx) {
        if self.binding.is_some() {
            self.send_error(
                ctx,
                ErrorKind::ClientProtocol,
                "session is already bound to a game",
            );
            return;
        }
        if !keys::is_valid_key(&key) {
            self.send_error(ctx, ErrorKind::ClientProtocol, "malformed player key");
            return;
        }

        struct JoinOk {
            color: Color,
            status: GameStatus,
            chats: Vec<ChatEntry>,
            opponent_connected: bool,
        }
        enum JoinResult {
            Ok(Box<JoinOk>),
            Rejected(JoinRejection),
            Fault(Fault),
        }

        let store = self.store.clone();
        let manager_id = self.manager_id.clone();
        let join_key = key.clone();
        let fut = async move {
            let outcome = match store.join_game(&join_key, &manager_id).await {
                Ok(outcome) => outcome,
                Err(e) => return JoinResult::Fault(e.into()),
            };
            let color = match outcome {
                JoinOutcome::Dne => return JoinResult::Rejected(JoinRejection::Dne),
                JoinOutcome::InUse => return JoinResult::Rejected(JoinRejection::InUse),
                JoinOutcome::Joined { black_key, .. } => {
                    if join_key == black_key { Color::Black } else { Color::White }
                }
            };

            let record = match store.get_game_status(&join_key).await {
                Ok(Some(record)) => record,
                Ok(None) => return JoinResult::Fault(Fault::internal("joined key has no game")),
                Err(e) => return JoinResult::Fault(e.into()),
            };
            let game = match Game::from_blob(&record.data) {
                Ok(game) => game,
                Err(e) => return JoinResult::Fault(Fault::internal(e.to_string())),
            };
            let chats = match store.get_chat_updates(&join_key, None).await {
                Ok(chats) => chats,
                Err(e) => return JoinResult::Fault(e.into()),
            };
            let opponent_connected = match store.get_opponent_connected(&join_key).await {
                Ok(connected) => connected,
                Err(e) => return JoinResult::Fault(e.into()),
            };

            JoinResult::Ok(Box::new(JoinOk {
                color,
                status: game.status(record.version, color, record.time_played),
                chats,
                opponent_connected,
            }))
        };

        ctx.wait(fut.into_actor(self).map(move |result, act, ctx| match result {
            JoinResult::Ok(join) => {
                log::info!("WS session {}: joined game as {}", act.id, join.color);
                act.binding = Some(KeyBinding { key: key.clone(), color: join.color });
                act.router.do_send(RegisterKey { key, session: ctx.address() });
                act.send(ctx, &ServerMessage::JoinGameResponse { success: true, reason: None });
                // Sent unconditionally: a never-written game is still at
                // version 0, which push_status would treat as stale.
                act.last_version = join.status.version;
                act.send(ctx, &ServerMessage::GameStatus(join.status));
                act.push_chats(ctx, join.chats);
                act.send(
                    ctx,
                    &ServerMessage::OpponentConnected { connected: join.opponent_connected },
                );
            }
            JoinResult::Rejected(reason) => {
                log::debug!("WS session {}: join rejected: {:?}", act.id, reason);
                act.send(
                    ctx,
                    &ServerMessage::JoinGameResponse { success: false, reason: Some(reason) },
                );
            }
            JoinResult::Fault(fault) => act.fail(ctx, fault),
        }));
    }

    // -----------------------------------------------------------------------
    // game_action
    // -----------------------------------------------------------------------

    fn handle_game_action(&mut self, action: GameActionKind, ctx: &mut WsCtx) {
        let Some(binding) = self.binding.clone() else {
            self.send_error(ctx, ErrorKind::Unauthorized, "no game joined");
            return;
        };

        enum ActionResult {
            /// The write won; push the state we just produced.
            Written(Box<GameStatus>),
            /// The rules engine said no. Nothing was written.
            Rejected(String),
            /// Another writer got there first; push their state if newer.
            Conflict(Option<Box<GameStatus>>),
            Fault(Fault),
        }

        let store = self.store.clone();
        let fut = async move {
            let record = match store.get_game_status(&binding.key).await {
                Ok(Some(record)) => record,
                Ok(None) => return ActionResult::Fault(Fault::internal("bound key has no game")),
                Err(e) => return ActionResult::Fault(e.into()),
            };
            let mut game = match Game::from_blob(&record.data) {
                Ok(game) => game,
                Err(e) => return ActionResult::Fault(Fault::internal(e.to_string())),
            };

            if let Err(e) = game.apply(action.with_color(binding.color)) {
                return ActionResult::Rejected(e.to_string());
            }

            let blob = match game.to_blob() {
                Ok(blob) => blob,
                Err(e) => return ActionResult::Fault(Fault::internal(e.to_string())),
            };
            let next_version = record.version + 1;
            match store.write_game(&binding.key, &blob, next_version).await {
                Ok(Some(time_played)) => ActionResult::Written(Box::new(game.status(
                    next_version,
                    binding.color,
                    time_played,
                ))),
                // Version conflict: someone else advanced the game. Reload
                // the authoritative state as the conflict notice.
                Ok(None) => match store.get_game_status(&binding.key).await {
                    Ok(Some(record)) => match Game::from_blob(&record.data) {
                        Ok(game) => ActionResult::Conflict(Some(Box::new(game.status(
                            record.version,
                            binding.color,
                            record.time_played,
                        )))),
                        Err(e) => ActionResult::Fault(Fault::internal(e.to_string())),
                    },
                    Ok(None) => ActionResult::Conflict(None),
                    Err(e) => ActionResult::Fault(e.into()),
                },
                Err(e) => ActionResult::Fault(e.into()),
            }
        };

        ctx.wait(fut.into_actor(self).map(|result, act, ctx| match result {
            ActionResult::Written(status) => {
                act.send(ctx, &ServerMessage::GameActionResponse { success: true });
                act.push_status(ctx, *status);
            }
            ActionResult::Rejected(message) => {
                act.send_error(ctx, ErrorKind::IllegalMove, message);
            }
            ActionResult::Conflict(status) => {
                log::debug!("WS session {}: write lost the version race", act.id);
                act.send(ctx, &ServerMessage::GameActionResponse { success: false });
                if let Some(status) = status {
                    act.push_status(ctx, *status);
                }
            }
            ActionResult::Fault(fault) => act.fail(ctx, fault),
        }));
    }

    // -----------------------------------------------------------------------
    // chat
    // -----------------------------------------------------------------------

    fn handle_chat(&mut self, message: String, ctx: &mut WsCtx) {
        let Some(binding) = self.binding.clone() else {
            self.send_error(ctx, ErrorKind::Unauthorized, "no game joined");
            return;
        };
        let message = message.trim().to_owned();
        if message.is_empty() {
            self.send_error(ctx, ErrorKind::ClientProtocol, "chat message is empty");
            return;
        }
        if message.len() > MAX_CHAT_LEN {
            self.send_error(
                ctx,
                ErrorKind::ClientProtocol,
                format!("chat message exceeds {} bytes", MAX_CHAT_LEN),
            );
            return;
        }

        let store = self.store.clone();
        let fut = async move {
            // No local echo: the row comes back through this session's own
            // chat notification, which carries the assigned id.
            match store.write_chat(store::unix_timestamp(), &message, &binding.key).await {
                Ok(Some(_)) => Ok(()),
                Ok(None) => Err(Fault::internal("bound key has no game")),
                Err(e) => Err(e.into()),
            }
        };

        ctx.wait(fut.into_actor(self).map(|result, act, ctx| {
            if let Err(fault) = result {
                act.fail(ctx, fault);
            }
        }));
    }

    // -----------------------------------------------------------------------
    // Store notifications
    // -----------------------------------------------------------------------

    /// Fetches the current game and pushes it if newer than the last push.
    fn refresh_game_status(&mut self, ctx: &mut WsCtx) {
        let Some(binding) = self.binding.clone() else { return };
        let store = self.store.clone();
        let fut = async move {
            let record = match store.get_game_status(&binding.key).await {
                Ok(Some(record)) => record,
                Ok(None) => return Err(Fault::internal("bound key has no game")),
                Err(e) => return Err(e.into()),
            };
            let game = Game::from_blob(&record.data)
                .map_err(|e| Fault::internal(e.to_string()))?;
            Ok(Box::new(game.status(record.version, binding.color, record.time_played)))
        };
        ctx.wait(fut.into_actor(self).map(|result, act, ctx| match result {
            Ok(status) => act.push_status(ctx, *status),
            Err(fault) => act.fail(ctx, fault),
        }));
    }

    /// Fetches chat rows past the last pushed id and pushes them.
    fn refresh_chat(&mut self, ctx: &mut WsCtx) {
        let Some(binding) = self.binding.clone() else { return };
        let store = self.store.clone();
        let since = self.last_chat_id;
        let fut = async move {
            store
                .get_chat_updates(&binding.key, Some(since))
                .await
                .map_err(Fault::from)
        };
        ctx.wait(fut.into_actor(self).map(|result, act, ctx| match result {
            Ok(entries) => act.push_chats(ctx, entries),
            Err(fault) => act.fail(ctx, fault),
        }));
    }
}

// ---------------------------------------------------------------------------
// WsSession — Actor + StreamHandler implementation
// ---------------------------------------------------------------------------

impl Actor for WsSession {
    type Context = WsCtx;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("WS session {} started", self.id);
        self.start_heartbeat(ctx);
    }

    /// Releases the key on disconnect. The store call runs detached: the
    /// actor is past the point where it can await anything.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("WS session {} stopped", self.id);
        if let Some(binding) = self.binding.take() {
            self.router.do_send(ReleaseKey { key: binding.key.clone() });
            let store = self.store.clone();
            let manager_id = self.manager_id.clone();
            let session_id = self.id;
            actix::spawn(async move {
                match store.unsubscribe(&binding.key, &manager_id).await {
                    Ok(true) => {}
                    Ok(false) => log::warn!(
                        "WS session {}: key was no longer held at disconnect",
                        session_id
                    ),
                    // A failed release is reclaimed later by `do_cleanup`.
                    Err(e) => log::error!(
                        "WS session {}: failed to release key: {}",
                        session_id,
                        e
                    ),
                }
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.handle_message(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.send_error(
                    ctx,
                    ErrorKind::ClientProtocol,
                    "binary frames are not supported",
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                log::info!("WS session {} closed: {:?}", self.id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                // Continuation frames are handled internally by actix
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::error!("WS session {} protocol error: {}", self.id, e);
                ctx.stop();
            }
        }
    }
}

impl Handler<StoreNotification> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: StoreNotification, ctx: &mut Self::Context) {
        match msg.kind {
            ChannelKind::GameStatus => self.refresh_game_status(ctx),
            // The payload carries the inserted id, but fetching everything
            // past the last seen id also covers any earlier missed NOTIFY.
            ChannelKind::Chat => self.refresh_chat(ctx),
            ChannelKind::OpponentConnected => {
                let connected = msg.payload == "true";
                self.send(ctx, &ServerMessage::OpponentConnected { connected });
            }
        }
    }
}

impl Handler<Resync> for WsSession {
    type Result = ();

    fn handle(&mut self, _msg: Resync, ctx: &mut Self::Context) {
        if self.binding.is_some() {
            log::debug!("WS session {}: resyncing after listener reset", self.id);
            self.refresh_game_status(ctx);
            self.refresh_chat(ctx);
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP → WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Upgrades an HTTP request into a WebSocket session.
pub async fn ws_connect(
    req: HttpRequest,
    stream: web::Payload,
    store: web::Data<Store>,
    router: web::Data<Addr<Router>>,
    manager_id: web::Data<ManagerId>,
) -> Result<HttpResponse, actix_web::Error> {
    let session = WsSession::new(
        store.get_ref().clone(),
        router.get_ref().clone(),
        manager_id.0.clone(),
    );
    log::debug!("new WebSocket connection from {:?}", req.peer_addr());
    ws::start(session, &req, stream)
}
