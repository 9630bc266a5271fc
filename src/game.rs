//! Game state management for the sente Go server.
//!
//! A [`Game`] wraps the board with everything the rules engine does not own:
//! whose turn it is, captured-stone counts, the endgame phase machine, the
//! pending undo/tally request, and the append-only action stack. Undo is
//! implemented by replaying the stack from the start rather than by keeping
//! board copies.
//!
//! Game state never survives in process memory across requests: each client
//! action deserializes the stored blob, mutates, and writes back under the
//! store's version counter. [`Game::to_blob`] / [`Game::from_blob`] are that
//! boundary; the blob is self-describing JSON led by a schema version so a
//! future server can detect and migrate old rows.

use crate::board::{handicap_points, IllegalMove, PositionHash};
use crate::types::{
    Board, Color, GameResult, GameStatus, Move, PendingRequest, Phase, Prisoners, RequestKind,
    BOARD_SIZES,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Version byte of the persisted blob format.
pub const BLOB_SCHEMA: u8 = 1;

/// Komi granted to White in an even game.
pub const DEFAULT_KOMI: f64 = 6.5;

/// Komi granted to White when Black takes handicap stones.
pub const HANDICAP_KOMI: f64 = 0.5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a game action was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The board refused the placement.
    Illegal(IllegalMove),
    /// The game is already complete or resigned.
    GameOver,
    /// The action does not exist in the current phase.
    WrongPhase,
    /// Acting out of turn.
    NotYourTurn,
    /// Dead-stone marks must target a stone.
    PointEmpty,
    /// Accepting with no matching pending request.
    NoPendingRequest,
    /// Responding to one's own request.
    SelfResponse,
    /// No action of the requester's to take back.
    NothingToUndo,
    /// The requested configuration is not a valid game.
    InvalidConfig(String),
    /// The stored blob could not be decoded.
    BadBlob(String),
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::Illegal(reason) => write!(f, "illegal move: {}", reason),
            ActionError::GameOver => write!(f, "the game is over"),
            ActionError::WrongPhase => write!(f, "action not available in this phase"),
            ActionError::NotYourTurn => write!(f, "it is not your turn"),
            ActionError::PointEmpty => write!(f, "no stone at that point"),
            ActionError::NoPendingRequest => write!(f, "no matching request is pending"),
            ActionError::SelfResponse => write!(f, "cannot respond to your own request"),
            ActionError::NothingToUndo => write!(f, "nothing to undo"),
            ActionError::InvalidConfig(msg) => write!(f, "invalid game configuration: {}", msg),
            ActionError::BadBlob(msg) => write!(f, "invalid stored game: {}", msg),
        }
    }
}

impl From<IllegalMove> for ActionError {
    fn from(reason: IllegalMove) -> Self {
        ActionError::Illegal(reason)
    }
}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

/// A complete Go game between two players.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    /// Blob format version; must equal [`BLOB_SCHEMA`].
    pub schema: u8,

    /// Side length of the board.
    pub size: u8,

    /// Points granted to White.
    pub komi: f64,

    /// Number of initial black stones on the star points.
    pub handicap: u8,

    /// Side to move.
    pub turn: Color,

    /// Stones captured by each color.
    pub prisoners: Prisoners,

    /// Current position.
    pub board: Board,

    /// Hash of every position reached so far, the initial one included.
    /// Superko rejects any placement that reproduces an entry.
    pub history: Vec<PositionHash>,

    /// Lifecycle phase.
    pub phase: Phase,

    /// Stones marked dead during the endgame.
    pub dead_marks: BTreeSet<(u8, u8)>,

    /// Outstanding undo or tally request, if any.
    pub pending_request: Option<PendingRequest>,

    /// Board-affecting actions in order. Undo replays a truncated copy.
    pub action_stack: Vec<Move>,

    /// Set once the game is complete or resigned.
    pub result: Option<GameResult>,
}

impl Game {
    /// Creates a fresh game, placing handicap stones on the star points.
    ///
    /// Black moves first in an even game; with a handicap White does.
    pub fn new(size: u8, komi: f64, handicap: u8) -> Result<Game, ActionError> {
        if !BOARD_SIZES.contains(&size) {
            return Err(ActionError::InvalidConfig(format!(
                "unsupported board size {}",
                size
            )));
        }
        let stones = handicap_points(size, handicap).ok_or_else(|| {
            ActionError::InvalidConfig(format!(
                "handicap {} not supported on a {}x{} board",
                handicap, size, size
            ))
        })?;

        let mut board = Board::new(size);
        for (row, col) in stones {
            board.set(row, col, Some(Color::Black));
        }
        let history = vec![board.hash()];

        Ok(Game {
            schema: BLOB_SCHEMA,
            size,
            komi,
            handicap,
            turn: if handicap > 0 { Color::White } else { Color::Black },
            prisoners: Prisoners::default(),
            board,
            history,
            phase: Phase::Play,
            dead_marks: BTreeSet::new(),
            pending_request: None,
            action_stack: Vec::new(),
            result: None,
        })
    }

    /// The default komi for a game with the given handicap.
    pub fn default_komi(handicap: u8) -> f64 {
        if handicap > 0 { HANDICAP_KOMI } else { DEFAULT_KOMI }
    }

    /// Returns `true` once the game has reached a terminal phase.
    pub fn is_over(&self) -> bool {
        matches!(self.phase, Phase::Complete | Phase::Resigned)
    }

    /// Applies one action, dispatching on its kind.
    pub fn apply(&mut self, mv: Move) -> Result<(), ActionError> {
        if self.is_over() {
            return Err(ActionError::GameOver);
        }
        match mv {
            Move::Play { color, row, col } => self.play(color, row, col),
            Move::Pass { color } => self.pass(color),
            Move::Resign { color } => self.resign(color),
            Move::MarkDead { color, row, col, dead } => self.mark_dead(color, row, col, dead),
            Move::RequestUndo { color } => self.request_undo(color),
            Move::AcceptUndo { color } => self.accept_undo(color),
            Move::RequestTally { color } => self.request_tally(color),
            Move::AcceptTally { color } => self.accept_tally(color),
        }
    }

    // -----------------------------------------------------------------------
    // Board actions
    // -----------------------------------------------------------------------

    /// Places a stone for `color`.
    ///
    /// During the endgame a placement is the "continue play" request: it
    /// reverts the phase to `play`, discarding dead marks and any pending
    /// tally, and both players must pass again to re-enter the endgame.
    fn play(&mut self, color: Color, row: u8, col: u8) -> Result<(), ActionError> {
        if color != self.turn {
            return Err(ActionError::NotYourTurn);
        }

        let (next, captured) = self.board.place(color, row, col, &self.history)?;

        if self.phase == Phase::Endgame {
            self.phase = Phase::Play;
            self.dead_marks.clear();
        }
        self.prisoners.credit(color, captured.len() as u32);
        self.board = next;
        self.history.push(self.board.hash());
        self.action_stack.push(Move::Play { color, row, col });
        self.turn = color.opponent();
        self.pending_request = None;
        Ok(())
    }

    /// Passes for `color`. The second consecutive pass enters the endgame
    /// and records an implicit empty-marks tally proposal from the passer.
    fn pass(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Play {
            return Err(ActionError::WrongPhase);
        }
        if color != self.turn {
            return Err(ActionError::NotYourTurn);
        }

        let second_pass = matches!(
            self.action_stack.last(),
            Some(Move::Pass { color: prior }) if *prior == color.opponent()
        );

        self.action_stack.push(Move::Pass { color });
        self.turn = color.opponent();
        self.pending_request = None;

        if second_pass {
            self.phase = Phase::Endgame;
            self.dead_marks.clear();
            self.pending_request = Some(PendingRequest { kind: RequestKind::Tally, by: color });
        }
        Ok(())
    }

    /// Resigns. The opponent wins; the score fields record the area count
    /// at the moment of resignation for the record.
    fn resign(&mut self, color: Color) -> Result<(), ActionError> {
        let dead = self.dead_marks.iter().copied().collect();
        let (white_score, black_score) = self.board.score(self.komi, &dead);
        self.action_stack.push(Move::Resign { color });
        self.phase = Phase::Resigned;
        self.pending_request = None;
        self.result = Some(GameResult {
            winner: color.opponent(),
            white_score,
            black_score,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Endgame scoring protocol
    // -----------------------------------------------------------------------

    /// Marks or unmarks a stone as dead.
    ///
    /// Either player may edit the marks; any edit invalidates a pending
    /// tally so both players must accept the current marks again.
    fn mark_dead(&mut self, _color: Color, row: u8, col: u8, dead: bool) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase);
        }
        if !self.board.in_bounds(row, col) {
            return Err(ActionError::Illegal(IllegalMove::OffBoard));
        }
        if self.board.get(row, col).is_none() {
            return Err(ActionError::PointEmpty);
        }
        if dead {
            self.dead_marks.insert((row, col));
        } else {
            self.dead_marks.remove(&(row, col));
        }
        self.pending_request = None;
        Ok(())
    }

    /// Proposes the current dead marks as the final tally.
    fn request_tally(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase);
        }
        self.pending_request = Some(PendingRequest { kind: RequestKind::Tally, by: color });
        Ok(())
    }

    /// Accepts the opponent's tally proposal, completing the game.
    fn accept_tally(&mut self, color: Color) -> Result<(), ActionError> {
        if self.phase != Phase::Endgame {
            return Err(ActionError::WrongPhase);
        }
        match self.pending_request {
            Some(PendingRequest { kind: RequestKind::Tally, by }) if by != color => {}
            Some(PendingRequest { kind: RequestKind::Tally, .. }) => {
                return Err(ActionError::SelfResponse);
            }
            _ => return Err(ActionError::NoPendingRequest),
        }

        let dead = self.dead_marks.iter().copied().collect();
        let (white_score, black_score) = self.board.score(self.komi, &dead);
        self.phase = Phase::Complete;
        self.pending_request = None;
        // A winner is mandatory. Jigo (an exact tie, reachable when a
        // client supplies an integer komi) is awarded to White, the side
        // compensated for moving second.
        self.result = Some(GameResult {
            winner: if white_score >= black_score { Color::White } else { Color::Black },
            white_score,
            black_score,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Undo protocol
    // -----------------------------------------------------------------------

    /// Requests a takeback. Only the player who is *not* to move — the one
    /// whose action is on top of the stack — may ask.
    fn request_undo(&mut self, color: Color) -> Result<(), ActionError> {
        if color == self.turn {
            return Err(ActionError::NotYourTurn);
        }
        if !self.action_stack.iter().any(|mv| mv.color() == color) {
            return Err(ActionError::NothingToUndo);
        }
        self.pending_request = Some(PendingRequest { kind: RequestKind::Undo, by: color });
        Ok(())
    }

    /// Accepts a takeback, popping one action (or two if needed) so the
    /// requester is to move again, then replaying the stack from scratch.
    /// Captures, prisoners, history, and phase are all restored by replay.
    fn accept_undo(&mut self, color: Color) -> Result<(), ActionError> {
        let requester = match self.pending_request {
            Some(PendingRequest { kind: RequestKind::Undo, by }) if by != color => by,
            Some(PendingRequest { kind: RequestKind::Undo, .. }) => {
                return Err(ActionError::SelfResponse);
            }
            _ => return Err(ActionError::NoPendingRequest),
        };

        // Every stacked action flips the turn, so popping the requester's
        // own last action suffices; the second pop covers a stack whose top
        // is not theirs (the request predates an intervening action).
        for depth in 1..=2usize {
            if depth > self.action_stack.len() {
                break;
            }
            let truncated = &self.action_stack[..self.action_stack.len() - depth];
            let replayed = Game::replay(self.size, self.komi, self.handicap, truncated)?;
            if replayed.turn == requester {
                *self = replayed;
                return Ok(());
            }
        }
        Err(ActionError::NothingToUndo)
    }

    /// Rebuilds a game by applying `actions` to a fresh board.
    pub fn replay(
        size: u8,
        komi: f64,
        handicap: u8,
        actions: &[Move],
    ) -> Result<Game, ActionError> {
        let mut game = Game::new(size, komi, handicap)?;
        for mv in actions {
            game.apply(*mv)?;
        }
        Ok(game)
    }

    // -----------------------------------------------------------------------
    // Persistence & projection
    // -----------------------------------------------------------------------

    /// Serializes the game into the opaque blob stored by the database.
    pub fn to_blob(&self) -> Result<Vec<u8>, ActionError> {
        serde_json::to_vec(self).map_err(|e| ActionError::BadBlob(e.to_string()))
    }

    /// Reconstructs a game from a stored blob, rejecting unknown schemas.
    pub fn from_blob(blob: &[u8]) -> Result<Game, ActionError> {
        let game: Game =
            serde_json::from_slice(blob).map_err(|e| ActionError::BadBlob(e.to_string()))?;
        if game.schema != BLOB_SCHEMA {
            return Err(ActionError::BadBlob(format!(
                "unsupported blob schema {}",
                game.schema
            )));
        }
        Ok(game)
    }

    /// Builds the `game_status` frame for one side of the game.
    pub fn status(&self, version: i64, your_color: Color, time_played: f64) -> GameStatus {
        GameStatus {
            version,
            your_color,
            size: self.size,
            komi: self.komi,
            handicap: self.handicap,
            turn: self.turn,
            phase: self.phase,
            board: self.board.points.clone(),
            prisoners: self.prisoners,
            dead_marks: self.dead_marks.clone(),
            pending_request: self.pending_request,
            result: self.result,
            time_played,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn even_game() -> Game {
        Game::new(9, 6.5, 0).unwrap()
    }

    fn play(game: &mut Game, color: Color, row: u8, col: u8) {
        game.apply(Move::Play { color, row, col }).unwrap();
    }

    fn pass(game: &mut Game, color: Color) {
        game.apply(Move::Pass { color }).unwrap();
    }

    #[test]
    fn test_new_game_defaults() {
        let game = even_game();
        assert_eq!(game.turn, Color::Black);
        assert_eq!(game.phase, Phase::Play);
        assert_eq!(game.history.len(), 1);
        assert!(game.action_stack.is_empty());

        let handicapped = Game::new(19, 0.5, 4).unwrap();
        assert_eq!(handicapped.turn, Color::White);
        assert_eq!(handicapped.board.get(3, 3), Some(Color::Black));
        assert_eq!(handicapped.board.get(15, 15), Some(Color::Black));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Game::new(10, 6.5, 0),
            Err(ActionError::InvalidConfig(_))
        ));
        assert!(matches!(
            Game::new(9, 0.5, 12),
            Err(ActionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_turn_enforced() {
        let mut game = even_game();
        assert_eq!(
            game.apply(Move::Play { color: Color::White, row: 0, col: 0 }),
            Err(ActionError::NotYourTurn)
        );
        play(&mut game, Color::Black, 4, 4);
        assert_eq!(game.turn, Color::White);
    }

    #[test]
    fn test_capture_credits_prisoners() {
        // B(4,4), W(3,4), B pass, W(4,3), B pass, W(4,5), B pass, W(5,4):
        // the black stone is captured and it is Black's turn.
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        play(&mut game, Color::White, 3, 4);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 4, 3);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 4, 5);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 5, 4);

        assert_eq!(game.board.get(4, 4), None);
        assert_eq!(game.prisoners.white, 1);
        assert_eq!(game.prisoners.black, 0);
        assert_eq!(game.turn, Color::Black);
        assert_eq!(game.phase, Phase::Play);
    }

    #[test]
    fn test_two_passes_enter_endgame_with_implicit_proposal() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        pass(&mut game, Color::White);
        pass(&mut game, Color::Black);

        assert_eq!(game.phase, Phase::Endgame);
        assert!(game.dead_marks.is_empty());
        assert_eq!(
            game.pending_request,
            Some(PendingRequest { kind: RequestKind::Tally, by: Color::Black })
        );
    }

    #[test]
    fn test_tally_acceptance_completes_game() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        pass(&mut game, Color::White);
        pass(&mut game, Color::Black);

        // The second passer may not accept their own implicit proposal.
        assert_eq!(
            game.apply(Move::AcceptTally { color: Color::Black }),
            Err(ActionError::SelfResponse)
        );

        game.apply(Move::AcceptTally { color: Color::White }).unwrap();
        assert_eq!(game.phase, Phase::Complete);
        let result = game.result.unwrap();
        // Black owns the whole board: 1 stone + 80 territory; White has komi.
        assert_eq!(result.black_score, 81.0);
        assert_eq!(result.white_score, 6.5);
        assert_eq!(result.winner, Color::Black);
        assert_eq!(game.apply(Move::Pass { color: Color::White }), Err(ActionError::GameOver));
    }

    #[test]
    fn test_jigo_is_awarded_to_white() {
        // With komi 0 an empty-board tally is an exact tie: the lone empty
        // region borders no stones, so nobody scores a point.
        let mut game = Game::new(9, 0.0, 0).unwrap();
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        game.apply(Move::AcceptTally { color: Color::Black }).unwrap();

        let result = game.result.unwrap();
        assert_eq!(result.white_score, 0.0);
        assert_eq!(result.black_score, 0.0);
        assert_eq!(result.winner, Color::White);
    }

    #[test]
    fn test_mark_dead_resets_tally_acceptance() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        play(&mut game, Color::White, 0, 0);
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        assert_eq!(game.phase, Phase::Endgame);

        // White proposed implicitly; Black edits the marks instead of
        // accepting, which clears the proposal.
        game.apply(Move::MarkDead { color: Color::Black, row: 0, col: 0, dead: true })
            .unwrap();
        assert!(game.dead_marks.contains(&(0, 0)));
        assert_eq!(
            game.apply(Move::AcceptTally { color: Color::Black }),
            Err(ActionError::NoPendingRequest)
        );

        // A fresh request/accept cycle over the edited marks completes.
        game.apply(Move::RequestTally { color: Color::Black }).unwrap();
        game.apply(Move::AcceptTally { color: Color::White }).unwrap();
        let result = game.result.unwrap();
        // The dead white stone's point transfers to Black territory.
        assert_eq!(result.black_score, 81.0);
        assert_eq!(result.winner, Color::Black);
    }

    #[test]
    fn test_mark_dead_requires_a_stone() {
        let mut game = even_game();
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        assert_eq!(
            game.apply(Move::MarkDead { color: Color::Black, row: 4, col: 4, dead: true }),
            Err(ActionError::PointEmpty)
        );
    }

    #[test]
    fn test_play_in_endgame_resumes_play() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        play(&mut game, Color::White, 0, 0);
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        game.apply(Move::MarkDead { color: Color::Black, row: 0, col: 0, dead: true })
            .unwrap();

        // It is Black's turn (White passed last); Black plays on.
        play(&mut game, Color::Black, 2, 2);
        assert_eq!(game.phase, Phase::Play);
        assert!(game.dead_marks.is_empty());
        assert!(game.pending_request.is_none());

        // Two more passes re-enter the endgame.
        pass(&mut game, Color::White);
        pass(&mut game, Color::Black);
        assert_eq!(game.phase, Phase::Endgame);
    }

    #[test]
    fn test_pass_rejected_in_endgame() {
        let mut game = even_game();
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        assert_eq!(
            game.apply(Move::Pass { color: Color::Black }),
            Err(ActionError::WrongPhase)
        );
    }

    #[test]
    fn test_resign_is_terminal() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        game.apply(Move::Resign { color: Color::White }).unwrap();
        assert_eq!(game.phase, Phase::Resigned);
        assert_eq!(game.result.unwrap().winner, Color::Black);
        assert_eq!(
            game.apply(Move::Play { color: Color::White, row: 0, col: 0 }),
            Err(ActionError::GameOver)
        );
    }

    #[test]
    fn test_undo_restores_captures_by_replay() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        play(&mut game, Color::White, 3, 4);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 4, 3);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 4, 5);
        pass(&mut game, Color::Black);
        play(&mut game, Color::White, 5, 4);
        assert_eq!(game.prisoners.white, 1);

        // White just captured; it is Black's turn, so White may request.
        game.apply(Move::RequestUndo { color: Color::White }).unwrap();
        assert_eq!(
            game.apply(Move::AcceptUndo { color: Color::White }),
            Err(ActionError::SelfResponse)
        );
        game.apply(Move::AcceptUndo { color: Color::Black }).unwrap();

        // The capture is unwound: stone back, prisoner count reset,
        // White to move again.
        assert_eq!(game.board.get(4, 4), Some(Color::Black));
        assert_eq!(game.prisoners.white, 0);
        assert_eq!(game.turn, Color::White);
        assert!(game.pending_request.is_none());
    }

    #[test]
    fn test_undo_of_endgame_resumption_returns_to_endgame() {
        // Pass, pass, then Black resumes play from the endgame. Undoing the
        // resumption puts the game back in the endgame with Black to move
        // and White's implicit tally proposal restored by replay.
        let mut game = even_game();
        pass(&mut game, Color::Black);
        pass(&mut game, Color::White);
        assert_eq!(game.phase, Phase::Endgame);
        play(&mut game, Color::Black, 2, 2);
        assert_eq!(game.phase, Phase::Play);

        game.apply(Move::RequestUndo { color: Color::Black }).unwrap();
        game.apply(Move::AcceptUndo { color: Color::White }).unwrap();
        assert_eq!(game.phase, Phase::Endgame);
        assert_eq!(game.turn, Color::Black);
        assert_eq!(game.board.get(2, 2), None);
        assert_eq!(
            game.pending_request,
            Some(PendingRequest { kind: RequestKind::Tally, by: Color::White })
        );
    }

    #[test]
    fn test_undo_request_requires_prior_action() {
        let mut game = even_game();
        assert_eq!(
            game.apply(Move::RequestUndo { color: Color::White }),
            Err(ActionError::NothingToUndo)
        );
        // The player to move may not request.
        assert_eq!(
            game.apply(Move::RequestUndo { color: Color::Black }),
            Err(ActionError::NotYourTurn)
        );
    }

    #[test]
    fn test_undo_from_endgame_returns_to_play() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        pass(&mut game, Color::White);
        pass(&mut game, Color::Black);
        assert_eq!(game.phase, Phase::Endgame);

        // Black regrets the closing pass.
        game.apply(Move::RequestUndo { color: Color::Black }).unwrap();
        game.apply(Move::AcceptUndo { color: Color::White }).unwrap();
        assert_eq!(game.phase, Phase::Play);
        assert_eq!(game.turn, Color::Black);
    }

    #[test]
    fn test_superseded_request_is_replaced() {
        let mut game = even_game();
        play(&mut game, Color::Black, 4, 4);
        game.apply(Move::RequestUndo { color: Color::Black }).unwrap();
        // White plays instead of answering; the request dies with the move.
        play(&mut game, Color::White, 2, 2);
        assert!(game.pending_request.is_none());
        assert_eq!(
            game.apply(Move::AcceptUndo { color: Color::White }),
            Err(ActionError::NoPendingRequest)
        );
    }

    #[test]
    fn test_ko_enforced_through_game_history() {
        // Build the corner ko, then check the immediate recapture.
        let mut game = even_game();
        play(&mut game, Color::Black, 0, 1);
        play(&mut game, Color::White, 0, 2);
        play(&mut game, Color::Black, 1, 0);
        play(&mut game, Color::White, 1, 1);
        play(&mut game, Color::Black, 2, 1);
        play(&mut game, Color::White, 1, 3);
        play(&mut game, Color::Black, 8, 8); // tenuki
        play(&mut game, Color::White, 2, 2);

        // Black takes the ko.
        play(&mut game, Color::Black, 1, 2);
        assert_eq!(game.prisoners.black, 1);

        // White may not retake at once.
        assert_eq!(
            game.apply(Move::Play { color: Color::White, row: 1, col: 1 }),
            Err(ActionError::Illegal(IllegalMove::Ko))
        );

        // After an exchange elsewhere the retake is legal.
        play(&mut game, Color::White, 7, 7);
        play(&mut game, Color::Black, 6, 6);
        play(&mut game, Color::White, 1, 1);
        assert_eq!(game.prisoners.white, 1);
    }

    #[test]
    fn test_blob_round_trip_at_every_step() {
        let mut game = even_game();
        let moves = [
            Move::Play { color: Color::Black, row: 4, col: 4 },
            Move::Play { color: Color::White, row: 3, col: 4 },
            Move::Pass { color: Color::Black },
            Move::Play { color: Color::White, row: 4, col: 3 },
            Move::Pass { color: Color::Black },
            Move::Pass { color: Color::White },
        ];
        for mv in moves {
            game.apply(mv).unwrap();
            let blob = game.to_blob().unwrap();
            let restored = Game::from_blob(&blob).unwrap();
            assert_eq!(restored, game);
        }
    }

    #[test]
    fn test_blob_schema_is_checked() {
        let mut game = even_game();
        game.schema = 42;
        let blob = game.to_blob().unwrap();
        assert!(matches!(Game::from_blob(&blob), Err(ActionError::BadBlob(_))));
        assert!(matches!(Game::from_blob(b"not json"), Err(ActionError::BadBlob(_))));
    }

    #[test]
    fn test_replay_matches_incremental_state() {
        let mut game = even_game();
        let moves = [
            Move::Play { color: Color::Black, row: 2, col: 2 },
            Move::Play { color: Color::White, row: 6, col: 6 },
            Move::Play { color: Color::Black, row: 2, col: 6 },
            Move::Pass { color: Color::White },
            Move::Play { color: Color::Black, row: 6, col: 2 },
        ];
        for mv in moves {
            game.apply(mv).unwrap();
        }
        let replayed = Game::replay(9, 6.5, 0, &game.action_stack).unwrap();
        assert_eq!(replayed, game);
    }

    #[test]
    fn test_area_scoring_identity_on_completed_game() {
        let mut game = even_game();
        // Black walls off row 4; White holds nothing.
        for col in 0..9u8 {
            play(&mut game, Color::Black, 4, col);
            if col < 8 {
                pass(&mut game, Color::White);
            }
        }
        pass(&mut game, Color::White);
        pass(&mut game, Color::Black);
        game.apply(Move::AcceptTally { color: Color::White }).unwrap();

        let result = game.result.unwrap();
        assert_eq!(result.white_score + result.black_score, 81.0 + 6.5);
    }
}
