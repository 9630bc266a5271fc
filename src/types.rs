//! Core types for the sente Go server.
//!
//! This module defines the fundamental data structures shared across the
//! crate: stone colors, the board grid, the engine-level move representation,
//! game phase and result types, and the JSON wire protocol exchanged with
//! WebSocket clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Color
// ---------------------------------------------------------------------------

/// The color (side) of a stone or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// Black moves first in an even game.
    Black,
    /// White receives komi.
    White,
}

impl Color {
    /// Returns the opposite color.
    pub fn opponent(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }

    /// Parses the lowercase column form stored in the database.
    pub fn from_db(s: &str) -> Option<Color> {
        match s {
            "black" => Some(Color::Black),
            "white" => Some(Color::White),
            _ => None,
        }
    }

    /// The lowercase form stored in the database.
    pub fn as_db(self) -> &'static str {
        match self {
            Color::Black => "black",
            Color::White => "white",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db())
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Board sizes accepted by the server.
pub const BOARD_SIZES: [u8; 3] = [9, 13, 19];

/// The point grid of a Go board.
///
/// Points are stored row-major in a flat vector; `None` is an empty point.
/// Equality is by point grid, which is what the superko rule compares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Side length: 9, 13, or 19.
    pub size: u8,
    /// Row-major grid of `size * size` points.
    pub points: Vec<Option<Color>>,
}

impl Board {
    /// Creates an empty board of the given side length.
    pub fn new(size: u8) -> Self {
        Self {
            size,
            points: vec![None; size as usize * size as usize],
        }
    }

    /// Returns `true` if `(row, col)` is on the board.
    pub fn in_bounds(&self, row: u8, col: u8) -> bool {
        row < self.size && col < self.size
    }

    /// Returns the point at `(row, col)`. Callers must stay in bounds.
    pub fn get(&self, row: u8, col: u8) -> Option<Color> {
        self.points[row as usize * self.size as usize + col as usize]
    }

    /// Sets (or clears) the point at `(row, col)`.
    pub fn set(&mut self, row: u8, col: u8, point: Option<Color>) {
        self.points[row as usize * self.size as usize + col as usize] = point;
    }

    /// The up-to-four orthogonal neighbors of `(row, col)`.
    pub fn neighbors(&self, row: u8, col: u8) -> Vec<(u8, u8)> {
        let mut out = Vec::with_capacity(4);
        if row > 0 {
            out.push((row - 1, col));
        }
        if col > 0 {
            out.push((row, col - 1));
        }
        if row + 1 < self.size {
            out.push((row + 1, col));
        }
        if col + 1 < self.size {
            out.push((row, col + 1));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Moves
// ---------------------------------------------------------------------------

/// A single game action as recorded by the engine.
///
/// `Play`, `Pass`, and `Resign` land on the game's action stack and are what
/// replay reconstructs state from. The remaining variants mutate request or
/// scoring state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Move {
    Play { color: Color, row: u8, col: u8 },
    Pass { color: Color },
    Resign { color: Color },
    MarkDead { color: Color, row: u8, col: u8, dead: bool },
    RequestUndo { color: Color },
    AcceptUndo { color: Color },
    RequestTally { color: Color },
    AcceptTally { color: Color },
}

impl Move {
    /// The color performing this action.
    pub fn color(&self) -> Color {
        match *self {
            Move::Play { color, .. }
            | Move::Pass { color }
            | Move::Resign { color }
            | Move::MarkDead { color, .. }
            | Move::RequestUndo { color }
            | Move::AcceptUndo { color }
            | Move::RequestTally { color }
            | Move::AcceptTally { color } => color,
        }
    }
}

// ---------------------------------------------------------------------------
// Game phase, requests, result
// ---------------------------------------------------------------------------

/// Lifecycle phase of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Stones are being played.
    Play,
    /// Two consecutive passes; dead stones are being marked.
    Endgame,
    /// Both players accepted the tally. Terminal.
    Complete,
    /// One player resigned. Terminal.
    Resigned,
}

/// The kind of a pending two-party request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Undo,
    Tally,
}

/// An outstanding request awaiting the opponent's acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub kind: RequestKind,
    pub by: Color,
}

/// Stones captured by each color over the course of the game.
///
/// Under area scoring prisoners do not enter the final count, but they are
/// carried so a resignation result can still report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prisoners {
    pub black: u32,
    pub white: u32,
}

impl Prisoners {
    /// Credits `count` captured stones to `color`.
    pub fn credit(&mut self, color: Color, count: u32) {
        match color {
            Color::Black => self.black += count,
            Color::White => self.white += count,
        }
    }
}

/// The outcome of a finished game.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub winner: Color,
    pub white_score: f64,
    pub black_score: f64,
}

// ---------------------------------------------------------------------------
// Client → server protocol
// ---------------------------------------------------------------------------

/// A game action as submitted over the wire.
///
/// The acting color is never taken from the client; it is derived from the
/// player key bound to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameActionKind {
    PlayStone { row: u8, col: u8 },
    Pass,
    Resign,
    MarkDead { row: u8, col: u8, dead: bool },
    RequestUndo,
    AcceptUndo,
    RequestTally,
    AcceptTally,
}

impl GameActionKind {
    /// Stamps the session's color onto the wire action.
    pub fn with_color(self, color: Color) -> Move {
        match self {
            GameActionKind::PlayStone { row, col } => Move::Play { color, row, col },
            GameActionKind::Pass => Move::Pass { color },
            GameActionKind::Resign => Move::Resign { color },
            GameActionKind::MarkDead { row, col, dead } => Move::MarkDead { color, row, col, dead },
            GameActionKind::RequestUndo => Move::RequestUndo { color },
            GameActionKind::AcceptUndo => Move::AcceptUndo { color },
            GameActionKind::RequestTally => Move::RequestTally { color },
            GameActionKind::AcceptTally => Move::AcceptTally { color },
        }
    }
}

/// A single JSON message received from a WebSocket client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a game and bind this session to one side of it.
    NewGame {
        size: u8,
        /// Defaults to 6.5, or 0.5 for handicap games.
        #[serde(default)]
        komi: Option<f64>,
        #[serde(default)]
        handicap: u8,
        your_color: Color,
        /// Mint an AI secret on the opponent key so a worker can attach.
        #[serde(default)]
        vs_ai: bool,
        /// A previously held key to release within the same transaction.
        #[serde(default)]
        key_to_unsubscribe: Option<String>,
    },
    /// Bind this session to an existing key.
    JoinGame { key: String },
    /// Apply a game action under the bound key.
    GameAction { action: GameActionKind },
    /// Send a chat line to both players.
    Chat { message: String },
}

// ---------------------------------------------------------------------------
// Server → client protocol
// ---------------------------------------------------------------------------

/// Error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed JSON, unknown type, or missing/invalid field.
    ClientProtocol,
    /// Action attempted without (or against) a bound key.
    Unauthorized,
    /// `join_game` found the key missing or already managed.
    KeyState,
    /// The rules engine rejected the move. Never persisted.
    IllegalMove,
    /// The store stayed unreachable past the retry budget.
    ServerError,
    /// Invariant violation; the session closes.
    Internal,
}

/// Why a `join_game` request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRejection {
    /// No such key.
    Dne,
    /// Another live connection already manages this key.
    InUse,
}

/// The full authoritative game state pushed to a client.
///
/// Clients must discard any `game_status` whose `version` is older than one
/// they have already seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameStatus {
    pub version: i64,
    pub your_color: Color,
    pub size: u8,
    pub komi: f64,
    pub handicap: u8,
    pub turn: Color,
    pub phase: Phase,
    /// Row-major flat grid; `null` entries are empty points.
    pub board: Vec<Option<Color>>,
    pub prisoners: Prisoners,
    pub dead_marks: BTreeSet<(u8, u8)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_request: Option<PendingRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GameResult>,
    /// Accumulated seconds with at least one player connected.
    pub time_played: f64,
}

/// A chat line as stored and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: i64,
    /// Seconds since the Unix epoch, assigned by the server.
    pub timestamp: f64,
    pub color: Color,
    pub message: String,
}

/// A single JSON message pushed to a WebSocket client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Both minted keys plus the initial state. The opponent key is handed
    /// to the creator so they can share it out of band.
    NewGameResponse {
        your_key: String,
        opponent_key: String,
        status: GameStatus,
    },
    JoinGameResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<JoinRejection>,
    },
    GameStatus(GameStatus),
    Chat(ChatEntry),
    OpponentConnected { connected: bool },
    GameActionResponse { success: bool },
    Error { kind: ErrorKind, message: String },
}
