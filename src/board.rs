//! Rules engine for the Go board.
//!
//! Everything here is pure: legality checking, capture resolution, the
//! position hash used for the superko rule, and area scoring. The functions
//! never suspend and never touch the store; the [`crate::game`] module drives
//! them and owns the surrounding game state.
//!
//! ## Legality order
//!
//! A placement is checked in this order: bounds, occupancy, provisional
//! placement, enemy-capture sweep, suicide check on the post-capture
//! position, positional superko against the supplied history. Resolving
//! captures before the suicide check is what permits a move that would be
//! suicide in isolation but captures enemy stones.

use crate::types::{Board, Color};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a placement was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IllegalMove {
    OffBoard,
    Occupied,
    Suicide,
    Ko,
    NotYourTurn,
}

impl fmt::Display for IllegalMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IllegalMove::OffBoard => write!(f, "point is off the board"),
            IllegalMove::Occupied => write!(f, "point is occupied"),
            IllegalMove::Suicide => write!(f, "move would be suicide"),
            IllegalMove::Ko => write!(f, "move repeats a prior position (ko)"),
            IllegalMove::NotYourTurn => write!(f, "it is not your turn"),
        }
    }
}

// ---------------------------------------------------------------------------
// Position hash
// ---------------------------------------------------------------------------

/// A 128-bit hash of a board position, stable across server processes.
///
/// Stored as two `u64` halves so the persisted JSON stays within the range
/// every JSON implementation can represent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionHash {
    pub hi: u64,
    pub lo: u64,
}

/// Fixed seed for the Zobrist construction. Every server process derives the
/// identical per-point keys from it, so ko decisions agree across the fleet.
const ZOBRIST_SEED: u64 = 0x5E17_E5_60_BA_2D_0001;

/// One step of splitmix64 (Steele, Lea, Flood 2014).
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// The Zobrist key for a colored stone on `(row, col)` of a `size` board.
///
/// The key is `splitmix64` run twice from the fixed seed mixed with the
/// cell coordinates, so the full table never needs to be materialized.
fn zobrist_key(size: u8, color: Color, row: u8, col: u8) -> PositionHash {
    let color_bit = match color {
        Color::Black => 0u64,
        Color::White => 1u64,
    };
    let mut state = ZOBRIST_SEED
        ^ ((size as u64) << 48)
        ^ (color_bit << 40)
        ^ ((row as u64) << 20)
        ^ (col as u64);
    let hi = splitmix64(&mut state);
    let lo = splitmix64(&mut state);
    PositionHash { hi, lo }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// A maximal same-color connected set of stones and its liberties.
///
/// Groups are derived on demand from the point grid; they are never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub color: Color,
    pub points: Vec<(u8, u8)>,
    pub liberties: HashSet<(u8, u8)>,
}

impl Board {
    /// Flood-fills the group containing `(row, col)`.
    ///
    /// Returns `None` for an empty or out-of-bounds point.
    pub fn group_at(&self, row: u8, col: u8) -> Option<Group> {
        if !self.in_bounds(row, col) {
            return None;
        }
        let color = self.get(row, col)?;

        let mut points = Vec::new();
        let mut liberties = HashSet::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(row, col)];
        seen.insert((row, col));

        while let Some((r, c)) = stack.pop() {
            points.push((r, c));
            for (nr, nc) in self.neighbors(r, c) {
                match self.get(nr, nc) {
                    None => {
                        liberties.insert((nr, nc));
                    }
                    Some(other) if other == color && seen.insert((nr, nc)) => {
                        stack.push((nr, nc));
                    }
                    Some(_) => {}
                }
            }
        }

        Some(Group { color, points, liberties })
    }

    /// Enemy groups left with zero liberties after provisionally placing a
    /// `color` stone on `(row, col)`.
    pub fn captures_from(&self, color: Color, row: u8, col: u8) -> Vec<Group> {
        let mut provisional = self.clone();
        provisional.set(row, col, Some(color));

        let mut captured: Vec<Group> = Vec::new();
        let mut claimed: HashSet<(u8, u8)> = HashSet::new();
        for (nr, nc) in provisional.neighbors(row, col) {
            if provisional.get(nr, nc) != Some(color.opponent()) || claimed.contains(&(nr, nc)) {
                continue;
            }
            if let Some(group) = provisional.group_at(nr, nc) {
                if group.liberties.is_empty() {
                    claimed.extend(group.points.iter().copied());
                    captured.push(group);
                }
            }
        }
        captured
    }

    /// Attempts to place a `color` stone on `(row, col)`.
    ///
    /// On success returns the resulting board and the captured enemy points.
    /// `history` holds the hashes of every prior position in the game; a
    /// result that matches any of them is rejected as ko (positional
    /// superko).
    pub fn place(
        &self,
        color: Color,
        row: u8,
        col: u8,
        history: &[PositionHash],
    ) -> Result<(Board, Vec<(u8, u8)>), IllegalMove> {
        if !self.in_bounds(row, col) {
            return Err(IllegalMove::OffBoard);
        }
        if self.get(row, col).is_some() {
            return Err(IllegalMove::Occupied);
        }

        let mut next = self.clone();
        next.set(row, col, Some(color));

        let mut captured = Vec::new();
        for group in self.captures_from(color, row, col) {
            for &(r, c) in &group.points {
                next.set(r, c, None);
                captured.push((r, c));
            }
        }

        // Suicide is judged on the post-capture position.
        let own = next
            .group_at(row, col)
            .expect("placed stone must form a group");
        if own.liberties.is_empty() {
            return Err(IllegalMove::Suicide);
        }

        let hash = next.hash();
        if history.contains(&hash) {
            return Err(IllegalMove::Ko);
        }

        Ok((next, captured))
    }

    /// The deterministic 128-bit hash of this position.
    pub fn hash(&self) -> PositionHash {
        let mut acc = PositionHash::default();
        for row in 0..self.size {
            for col in 0..self.size {
                if let Some(color) = self.get(row, col) {
                    let key = zobrist_key(self.size, color, row, col);
                    acc.hi ^= key.hi;
                    acc.lo ^= key.lo;
                }
            }
        }
        acc
    }

    // -----------------------------------------------------------------------
    // Scoring
    // -----------------------------------------------------------------------

    /// Partitions empty points into territory, with `dead` stones lifted off
    /// the board first.
    ///
    /// A maximal empty region bordered exclusively by one color belongs to
    /// that color; regions touching both colors (or no stone at all) count
    /// for no one.
    pub fn territory(&self, dead: &HashSet<(u8, u8)>) -> HashMap<Color, HashSet<(u8, u8)>> {
        let mut cleared = self.clone();
        for &(r, c) in dead {
            cleared.set(r, c, None);
        }

        let mut territory: HashMap<Color, HashSet<(u8, u8)>> = HashMap::new();
        let mut visited: HashSet<(u8, u8)> = HashSet::new();

        for row in 0..cleared.size {
            for col in 0..cleared.size {
                if cleared.get(row, col).is_some() || visited.contains(&(row, col)) {
                    continue;
                }

                // Flood-fill one empty region, collecting bordering colors.
                let mut region = Vec::new();
                let mut borders: HashSet<Color> = HashSet::new();
                let mut stack = vec![(row, col)];
                visited.insert((row, col));
                while let Some((r, c)) = stack.pop() {
                    region.push((r, c));
                    for (nr, nc) in cleared.neighbors(r, c) {
                        match cleared.get(nr, nc) {
                            Some(color) => {
                                borders.insert(color);
                            }
                            None => {
                                if visited.insert((nr, nc)) {
                                    stack.push((nr, nc));
                                }
                            }
                        }
                    }
                }

                if borders.len() == 1 {
                    let owner = *borders.iter().next().expect("non-empty border set");
                    territory.entry(owner).or_default().extend(region);
                }
            }
        }

        territory
    }

    /// Area score for the position: `(white_score, black_score)`.
    ///
    /// Score = stones remaining on the board + territory, plus komi for
    /// White. Stones marked dead are lifted first, so their points fall to
    /// the surrounding color as territory. Prisoners are not counted under
    /// area scoring.
    pub fn score(&self, komi: f64, dead: &HashSet<(u8, u8)>) -> (f64, f64) {
        let mut cleared = self.clone();
        for &(r, c) in dead {
            cleared.set(r, c, None);
        }

        let mut white = komi;
        let mut black = 0.0;
        for row in 0..cleared.size {
            for col in 0..cleared.size {
                match cleared.get(row, col) {
                    Some(Color::White) => white += 1.0,
                    Some(Color::Black) => black += 1.0,
                    None => {}
                }
            }
        }

        let territory = cleared.territory(&HashSet::new());
        if let Some(points) = territory.get(&Color::White) {
            white += points.len() as f64;
        }
        if let Some(points) = territory.get(&Color::Black) {
            black += points.len() as f64;
        }

        (white, black)
    }
}

// ---------------------------------------------------------------------------
// Handicap placement
// ---------------------------------------------------------------------------

/// The canonical handicap points for a board size, in placement order.
///
/// Corners first (opposing diagonal, then the remaining diagonal), then the
/// side stars, with the center stone substituting for a pair at 5 and 7
/// stones. Returns `None` when `handicap` exceeds what the size supports.
pub fn handicap_points(size: u8, handicap: u8) -> Option<Vec<(u8, u8)>> {
    if handicap == 0 {
        return Some(Vec::new());
    }
    if handicap > 9 {
        return None;
    }
    let edge: u8 = match size {
        9 => 2,
        13 | 19 => 3,
        _ => return None,
    };
    let far = size - 1 - edge;
    let mid = size / 2;

    let corners = [(edge, far), (far, edge), (far, far), (edge, edge)];
    let sides = [(mid, edge), (mid, far), (edge, mid), (far, mid)];
    let center = (mid, mid);

    let mut points: Vec<(u8, u8)> = Vec::with_capacity(handicap as usize);
    match handicap {
        1..=4 => points.extend(&corners[..handicap as usize]),
        5 | 7 => {
            points.extend(&corners);
            points.extend(&sides[..(handicap as usize - 5)]);
            points.push(center);
        }
        6 | 8 => {
            points.extend(&corners);
            points.extend(&sides[..(handicap as usize - 4)]);
        }
        9 => {
            points.extend(&corners);
            points.extend(&sides);
            points.push(center);
        }
        _ => unreachable!(),
    }
    Some(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_from(size: u8, stones: &[(Color, u8, u8)]) -> Board {
        let mut board = Board::new(size);
        for &(color, row, col) in stones {
            board.set(row, col, Some(color));
        }
        board
    }

    #[test]
    fn test_place_sets_point() {
        let board = Board::new(9);
        let (next, captured) = board.place(Color::Black, 4, 4, &[]).unwrap();
        assert_eq!(next.get(4, 4), Some(Color::Black));
        assert!(captured.is_empty());
        // The original board is untouched.
        assert_eq!(board.get(4, 4), None);
    }

    #[test]
    fn test_place_rejects_occupied_and_off_board() {
        let board = board_from(9, &[(Color::Black, 4, 4)]);
        assert_eq!(
            board.place(Color::White, 4, 4, &[]).unwrap_err(),
            IllegalMove::Occupied
        );
        assert_eq!(
            board.place(Color::White, 9, 0, &[]).unwrap_err(),
            IllegalMove::OffBoard
        );
    }

    #[test]
    fn test_group_and_liberties() {
        let board = board_from(9, &[
            (Color::Black, 4, 4),
            (Color::Black, 4, 5),
            (Color::White, 3, 4),
        ]);
        let group = board.group_at(4, 4).unwrap();
        assert_eq!(group.color, Color::Black);
        assert_eq!(group.points.len(), 2);
        // Liberties of the pair: (5,4), (4,3), (3,5), (5,5), (4,6) — (3,4) is white.
        assert_eq!(group.liberties.len(), 5);
        assert!(!group.liberties.contains(&(3, 4)));
    }

    #[test]
    fn test_single_stone_capture() {
        // White surrounds a black stone at (4,4) on three sides; the fourth
        // placement removes it.
        let board = board_from(9, &[
            (Color::Black, 4, 4),
            (Color::White, 3, 4),
            (Color::White, 4, 3),
            (Color::White, 4, 5),
        ]);
        let (next, captured) = board.place(Color::White, 5, 4, &[]).unwrap();
        assert_eq!(captured, vec![(4, 4)]);
        assert_eq!(next.get(4, 4), None);
        assert_eq!(next.get(5, 4), Some(Color::White));
    }

    #[test]
    fn test_suicide_forbidden_without_capture() {
        // 5×5 corner: (1,0) and (0,1) white, (0,0) empty. A black stone at
        // (0,0) would have no liberties and captures nothing.
        let board = board_from(5, &[(Color::White, 1, 0), (Color::White, 0, 1)]);
        assert_eq!(
            board.place(Color::Black, 0, 0, &[]).unwrap_err(),
            IllegalMove::Suicide
        );
        // White itself may fill the corner: it connects to its own stones.
        assert!(board.place(Color::White, 0, 0, &[]).is_ok());
    }

    #[test]
    fn test_suicide_permitted_when_it_captures() {
        // Black throw-in at (0,0) captures the white stone at (0,1) whose
        // last liberty is the throw-in point.
        let board = board_from(5, &[
            (Color::White, 0, 1),
            (Color::Black, 1, 0),
            (Color::Black, 1, 1),
            (Color::Black, 0, 2),
        ]);
        let (next, captured) = board.place(Color::Black, 0, 0, &[]).unwrap();
        assert_eq!(captured, vec![(0, 1)]);
        assert_eq!(next.get(0, 0), Some(Color::Black));
    }

    #[test]
    fn test_ko_recapture_blocked_by_history() {
        // Classic corner ko:
        //      c0  c1  c2  c3
        // r0:   .   B   W   .
        // r1:   B   W   .   W
        // r2:   .   B   W   .
        let board = board_from(9, &[
            (Color::Black, 0, 1),
            (Color::Black, 1, 0),
            (Color::Black, 2, 1),
            (Color::White, 0, 2),
            (Color::White, 1, 1),
            (Color::White, 1, 3),
            (Color::White, 2, 2),
        ]);

        let mut history = vec![board.hash()];

        // Black captures the ko stone at (1,1) by playing (1,2).
        let (after_capture, captured) = board.place(Color::Black, 1, 2, &history).unwrap();
        assert_eq!(captured, vec![(1, 1)]);
        history.push(after_capture.hash());

        // Immediate white recapture at (1,1) would recreate `board`.
        assert_eq!(
            after_capture
                .place(Color::White, 1, 1, &history)
                .unwrap_err(),
            IllegalMove::Ko
        );

        // Without that position in the history the recapture is legal.
        let partial = &history[1..];
        assert!(after_capture.place(Color::White, 1, 1, partial).is_ok());
    }

    #[test]
    fn test_hash_is_function_of_grid_only() {
        let a = board_from(9, &[(Color::Black, 2, 3), (Color::White, 6, 6)]);
        // Same stones placed in a different order.
        let b = board_from(9, &[(Color::White, 6, 6), (Color::Black, 2, 3)]);
        assert_eq!(a.hash(), b.hash());

        let c = board_from(9, &[(Color::White, 2, 3), (Color::Black, 6, 6)]);
        assert_ne!(a.hash(), c.hash(), "color swap must change the hash");

        assert_eq!(Board::new(9).hash(), PositionHash::default());
    }

    #[test]
    fn test_territory_ownership() {
        // A black wall across row 4 of a 9×9 board splits the empty points;
        // both regions border only black.
        let mut board = Board::new(9);
        for col in 0..9 {
            board.set(4, col, Some(Color::Black));
        }
        let territory = board.territory(&HashSet::new());
        assert_eq!(territory[&Color::Black].len(), 72);
        assert!(!territory.contains_key(&Color::White));

        // Add one white stone above the wall: the upper region is now
        // disputed and only the lower 36 points remain black's.
        board.set(2, 4, Some(Color::White));
        let territory = board.territory(&HashSet::new());
        assert_eq!(territory[&Color::Black].len(), 36);
    }

    #[test]
    fn test_dead_stones_transfer_as_territory() {
        // Black wall on row 4, lone white stone at (2,4) marked dead: the
        // whole upper region reverts to black.
        let mut board = Board::new(9);
        for col in 0..9 {
            board.set(4, col, Some(Color::Black));
        }
        board.set(2, 4, Some(Color::White));

        let dead: HashSet<(u8, u8)> = [(2u8, 4u8)].into_iter().collect();
        let territory = board.territory(&dead);
        assert_eq!(territory[&Color::Black].len(), 72);

        let (white, black) = board.score(6.5, &dead);
        assert_eq!(white, 6.5);
        assert_eq!(black, 81.0);
        // Area identity: everything on the board plus komi is accounted for.
        assert_eq!(white + black, 81.0 + 6.5);
    }

    #[test]
    fn test_score_with_neutral_region_counts_for_no_one() {
        let board = board_from(9, &[(Color::Black, 0, 0), (Color::White, 8, 8)]);
        let (white, black) = board.score(6.5, &HashSet::new());
        // The single empty region borders both colors.
        assert_eq!(white, 7.5);
        assert_eq!(black, 1.0);
    }

    #[test]
    fn test_handicap_points_per_size() {
        assert_eq!(handicap_points(9, 0).unwrap().len(), 0);
        assert_eq!(handicap_points(19, 2).unwrap(), vec![(3, 15), (15, 3)]);
        assert_eq!(handicap_points(9, 5).unwrap().last(), Some(&(4, 4)));
        assert_eq!(handicap_points(13, 9).unwrap().len(), 9);
        assert!(handicap_points(19, 10).is_none());
        assert!(handicap_points(10, 2).is_none());

        // All points are distinct and on the board.
        for &size in &[9u8, 13, 19] {
            let points = handicap_points(size, 9).unwrap();
            let unique: HashSet<_> = points.iter().collect();
            assert_eq!(unique.len(), 9);
            assert!(points.iter().all(|&(r, c)| r < size && c < size));
        }
    }
}
