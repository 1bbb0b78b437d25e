//! Board reconstruction and move-list rendering helpers

use shakmaty::{
    fen::Fen, san::San, san::SanPlus, uci::UciMove, CastlingMode, Chess, Color, EnPassantMode,
    Position,
};

use crate::db::PositionParams;
use crate::error::EngineError;
use crate::feed::GameSnapshot;

pub fn fen_of(pos: &Chess) -> String {
    Fen::from_position(pos, EnPassantMode::Legal).to_string()
}

/// Replay a snapshot from the starting position into the dense, gap-free
/// position list (ply 0 first) plus the terminal board. Clock readings are
/// threaded forward: a `%clk` annotation updates the clock of the side that
/// made the move, and both clocks are recorded on every ply.
///
/// Deterministic per snapshot, so recomputing the same snapshot yields an
/// identical list; deduplication against already-recorded plies happens at
/// the persistence layer.
pub fn replay_snapshot(
    snapshot: &GameSnapshot,
) -> Result<(Vec<PositionParams>, Chess), EngineError> {
    let mut pos = Chess::default();
    let mut white_clock: Option<i32> = None;
    let mut black_clock: Option<i32> = None;

    let mut positions = vec![PositionParams {
        ply_number: 0,
        fen: fen_of(&pos),
        move_uci: None,
        move_san: None,
        white_clock,
        black_clock,
    }];

    for (i, snapshot_move) in snapshot.moves.iter().enumerate() {
        let san: San = snapshot_move
            .san
            .parse()
            .map_err(|e| EngineError::Chess(format!("bad SAN {:?}: {e}", snapshot_move.san)))?;
        let mv = san
            .to_move(&pos)
            .map_err(|e| EngineError::Chess(format!("illegal SAN {:?}: {e}", snapshot_move.san)))?;

        if let Some(clock) = snapshot_move.clock {
            match pos.turn() {
                Color::White => white_clock = Some(clock),
                Color::Black => black_clock = Some(clock),
            }
        }

        let move_uci = mv.to_uci(CastlingMode::Standard).to_string();
        let move_san = SanPlus::from_move_and_play_unchecked(&mut pos, mv).to_string();

        positions.push(PositionParams {
            ply_number: (i + 1) as i32,
            fen: fen_of(&pos),
            move_uci: Some(move_uci),
            move_san: Some(move_san),
            white_clock,
            black_clock,
        });
    }

    Ok((positions, pos))
}

/// Render a principal variation as a numbered human-readable move list,
/// e.g. `1. e4 e5 2. Nf3` or, with Black to move, `3… Nf6 4. Ng5`.
pub fn pv_san_string(pos: &Chess, pv: &[String]) -> Result<String, EngineError> {
    let mut pos = pos.clone();
    let mut res = String::new();
    if pos.turn() == Color::Black {
        res = format!("{}…", pos.fullmoves());
    }

    for uci_str in pv {
        let uci: UciMove = uci_str
            .parse()
            .map_err(|e| EngineError::Chess(format!("bad UCI move {uci_str:?}: {e}")))?;
        let mv = uci
            .to_move(&pos)
            .map_err(|e| EngineError::Chess(format!("illegal UCI move {uci_str:?}: {e}")))?;

        if pos.turn() == Color::White {
            if !res.is_empty() {
                res.push(' ');
            }
            res.push_str(&format!("{}.", pos.fullmoves()));
        }
        let san = SanPlus::from_move_and_play_unchecked(&mut pos, mv);
        res.push(' ');
        res.push_str(&san.to_string());
    }

    Ok(res.trim_start().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::SnapshotMove;

    const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn snapshot(moves: Vec<SnapshotMove>) -> GameSnapshot {
        GameSnapshot {
            headers: vec![],
            moves,
        }
    }

    fn mv(san: &str, clock: Option<i32>) -> SnapshotMove {
        SnapshotMove {
            san: san.to_string(),
            clock,
        }
    }

    #[test]
    fn test_replay_start_position_only() {
        let (positions, board) = replay_snapshot(&snapshot(vec![])).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].ply_number, 0);
        assert_eq!(positions[0].fen, START_FEN);
        assert_eq!(positions[0].move_uci, None);
        assert_eq!(board.turn(), Color::White);
    }

    #[test]
    fn test_replay_threads_clocks_forward() {
        let moves = vec![
            mv("e4", Some(598)),
            mv("e5", Some(595)),
            mv("Nf3", Some(590)),
        ];
        let (positions, _) = replay_snapshot(&snapshot(moves)).unwrap();
        assert_eq!(positions.len(), 4);

        assert_eq!(positions[1].move_uci.as_deref(), Some("e2e4"));
        assert_eq!(positions[1].move_san.as_deref(), Some("e4"));
        assert_eq!(positions[1].white_clock, Some(598));
        assert_eq!(positions[1].black_clock, None);

        // Black's clock appears at ply 2; White's carries forward.
        assert_eq!(positions[2].white_clock, Some(598));
        assert_eq!(positions[2].black_clock, Some(595));

        assert_eq!(positions[3].move_san.as_deref(), Some("Nf3"));
        assert_eq!(positions[3].white_clock, Some(590));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let moves = vec![mv("d4", Some(100)), mv("d5", None)];
        let first = replay_snapshot(&snapshot(moves.clone())).unwrap().0;
        let second = replay_snapshot(&snapshot(moves)).unwrap().0;
        assert_eq!(first, second);
    }

    #[test]
    fn test_replay_rejects_illegal_san() {
        assert!(replay_snapshot(&snapshot(vec![mv("Ke2", None)])).is_err());
    }

    #[test]
    fn test_pv_string_white_to_move() {
        let pos = Chess::default();
        let pv = ["e2e4", "e7e5", "g1f3"].map(String::from);
        assert_eq!(pv_san_string(&pos, &pv).unwrap(), "1. e4 e5 2. Nf3");
    }

    #[test]
    fn test_pv_string_black_to_move() {
        let mut pos = Chess::default();
        let san: San = "e4".parse().unwrap();
        let mv = san.to_move(&pos).unwrap();
        pos.play_unchecked(mv);

        let pv = ["e7e5", "g1f3", "b8c6"].map(String::from);
        assert_eq!(pv_san_string(&pos, &pv).unwrap(), "1… e5 2. Nf3 Nc6");
    }
}
