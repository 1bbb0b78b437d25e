//! One analysis session: drive the engine on a leaf position, persist and
//! publish every completed bundle

use shakmaty::{CastlingMode, Chess, Color, Position};
use sqlx::PgPool;
use tracing::debug;

use crate::broadcast::{position_frame, thinking_frame, Broadcaster};
use crate::db::{self, EvaluationData, EvaluationMoveData, GamePosition, Thinking};
use crate::error::EngineError;
use crate::notation;
use crate::reconciler::BundleReconciler;
use crate::uci::{AnalysisEvent, UciEngine, UciScore};

/// Centipawn magnitude used to encode forced mates.
const MATE_SCORE: i32 = 20000;

/// Analyze `board` until cancelled (this future being dropped) or until the
/// engine ends the search on its own (terminal position).
///
/// Every completed bundle is persisted as an evaluation with its ranked
/// moves, folded into the session's running totals, and published on both
/// update channels. A bundle that is still accumulating when the future is
/// dropped dies with it; nothing partial is persisted or published. The
/// caller must call [`UciEngine::stop`] afterwards to release the search.
pub async fn think(
    engine: &mut UciEngine,
    pool: &PgPool,
    broadcaster: &Broadcaster,
    position: &GamePosition,
    board: &Chess,
    max_multipv: u32,
) -> Result<(), EngineError> {
    let legal_moves = board.legal_moves().len() as u32;
    // Never expect more variations than legal moves; a terminal position
    // yields no rank-tagged events and therefore no bundles.
    let bundle_len = max_multipv.min(legal_moves).max(1) as usize;

    let fen = notation::fen_of(board);
    engine.go_infinite(&fen, bundle_len as u32).await?;

    let mut thinking = db::create_thinking(pool, position.id).await?;
    debug!(thinking_id = thinking.id, fen = %fen, "analysis session started");

    // Becoming the current target force-disconnects subscribers of the
    // superseded session; publishing the zeroed totals right away lets
    // position watchers see that analysis has started here.
    broadcaster.set_current_thinking(thinking.id);
    broadcaster.publish_positions(position_frame(&[(
        position.clone(),
        Some(thinking.clone()),
    )]));

    let mut reconciler = BundleReconciler::new(bundle_len);
    while let Some(event) = engine.next_event().await? {
        if let Some(bundle) = reconciler.push(event) {
            process_bundle(pool, broadcaster, board, position, &mut thinking, &bundle).await?;
        }
    }

    debug!(thinking_id = thinking.id, "engine ended the search");
    Ok(())
}

async fn process_bundle(
    pool: &PgPool,
    broadcaster: &Broadcaster,
    board: &Chess,
    position: &GamePosition,
    thinking: &mut Thinking,
    bundle: &[AnalysisEvent],
) -> Result<(), EngineError> {
    let data = build_evaluation(board, bundle)?;
    let evaluation = db::create_evaluation(pool, thinking.id, &data).await?;
    db::insert_evaluation_moves(pool, evaluation.id, &data.moves).await?;

    // Rank 0 is authoritative for the session's running totals.
    let best = &data.moves[0];
    thinking.nodes = data.nodes;
    thinking.q_score = best.q_score;
    thinking.white_score = best.white_score;
    thinking.draw_score = best.draw_score;
    thinking.black_score = best.black_score;
    thinking.moves_left = best.moves_left;
    db::update_thinking_totals(pool, thinking).await?;

    broadcaster.publish_positions(position_frame(&[(
        position.clone(),
        Some(thinking.clone()),
    )]));
    broadcaster.publish_analysis(thinking_frame(&evaluation, &data.moves));
    Ok(())
}

/// Convert one complete bundle into persistable form. Scores and WDL counts
/// are reported by the engine from the side to move and stored from White's
/// perspective (the fixed reference side).
pub fn build_evaluation(
    board: &Chess,
    bundle: &[AnalysisEvent],
) -> Result<EvaluationData, EngineError> {
    let first = bundle
        .first()
        .ok_or_else(|| EngineError::Engine("empty evaluation bundle".into()))?;
    let white_to_move = board.turn() == Color::White;

    let moves = bundle
        .iter()
        .map(|event| build_evaluation_move(board, event, white_to_move))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(EvaluationData {
        nodes: bundle.iter().map(|event| event.nodes).sum(),
        time_ms: first.time_ms,
        depth: first.depth,
        seldepth: first.seldepth,
        moves,
    })
}

fn build_evaluation_move(
    board: &Chess,
    event: &AnalysisEvent,
    white_to_move: bool,
) -> Result<EvaluationMoveData, EngineError> {
    let move_uci = event
        .pv
        .first()
        .cloned()
        .ok_or_else(|| EngineError::Engine("variation without principal variation".into()))?;
    let move_opp_uci = event.pv.get(1).cloned();

    let uci: shakmaty::uci::UciMove = move_uci
        .parse()
        .map_err(|e| EngineError::Chess(format!("bad UCI move {move_uci:?}: {e}")))?;
    let mv = uci
        .to_move(board)
        .map_err(|e| EngineError::Chess(format!("illegal engine move {move_uci:?}: {e}")))?;
    let move_uci = mv.to_uci(CastlingMode::Standard).to_string();
    let move_san = shakmaty::san::SanPlus::from_move(board.clone(), mv).to_string();
    let pv_san = notation::pv_san_string(board, &event.pv)?;

    let (q_score, mate_score) = white_score_of(event.score, white_to_move);
    let (white_score, draw_score, black_score) = match event.wdl {
        Some(wdl) if white_to_move => (wdl.wins, wdl.draws, wdl.losses),
        Some(wdl) => (wdl.losses, wdl.draws, wdl.wins),
        None => (0, 1000, 0),
    };

    Ok(EvaluationMoveData {
        nodes: event.nodes,
        move_uci,
        move_opp_uci,
        move_san,
        pv_san,
        q_score,
        mate_score,
        white_score,
        draw_score,
        black_score,
        moves_left: event.moves_left,
    })
}

/// White-relative centipawn score plus the mate distance when the score is a
/// forced mate. Mates are encoded as ±(MATE_SCORE − distance) so deeper
/// mates score closer to zero.
fn white_score_of(score: Option<UciScore>, white_to_move: bool) -> (i32, Option<i32>) {
    match score {
        Some(UciScore::Cp(cp)) => (if white_to_move { cp } else { -cp }, None),
        Some(UciScore::Mate(mate)) => {
            let mate = if white_to_move { mate } else { -mate };
            let q = if mate > 0 {
                MATE_SCORE - mate
            } else {
                -MATE_SCORE - mate
            };
            (q, Some(mate))
        }
        None => (0, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uci::Wdl;
    use shakmaty::san::San;

    fn event(rank: u32, score: UciScore, wdl: (i32, i32, i32), nodes: i64, pv: &[&str]) -> AnalysisEvent {
        AnalysisEvent {
            multipv: Some(rank),
            depth: 20,
            seldepth: 28,
            time_ms: 1500,
            nodes,
            score: Some(score),
            wdl: Some(Wdl {
                wins: wdl.0,
                draws: wdl.1,
                losses: wdl.2,
            }),
            moves_left: Some(40),
            pv: pv.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_build_evaluation_white_to_move() {
        let board = Chess::default();
        let bundle = vec![
            event(1, UciScore::Cp(35), (400, 500, 100), 60_000, &["e2e4", "e7e5"]),
            event(2, UciScore::Cp(-10), (250, 500, 250), 40_000, &["d2d4"]),
        ];

        let data = build_evaluation(&board, &bundle).unwrap();
        assert_eq!(data.nodes, 100_000);
        assert_eq!(data.time_ms, 1500);
        assert_eq!(data.depth, 20);
        assert_eq!(data.moves.len(), 2);

        let best = &data.moves[0];
        assert_eq!(best.move_uci, "e2e4");
        assert_eq!(best.move_opp_uci.as_deref(), Some("e7e5"));
        assert_eq!(best.move_san, "e4");
        assert_eq!(best.pv_san, "1. e4 e5");
        assert_eq!(best.q_score, 35);
        assert_eq!(best.white_score, 400);
        assert_eq!(best.black_score, 100);
        assert_eq!(best.moves_left, Some(40));

        assert_eq!(data.moves[1].move_opp_uci, None);
        assert_eq!(data.moves[1].q_score, -10);
    }

    #[test]
    fn test_build_evaluation_flips_to_white_perspective() {
        // After 1. e4 it is Black to move: engine scores are Black-relative.
        let mut board = Chess::default();
        let san: San = "e4".parse().unwrap();
        let mv = san.to_move(&board).unwrap();
        board.play_unchecked(mv);

        let bundle = vec![event(1, UciScore::Cp(30), (500, 300, 200), 1000, &["e7e5"])];
        let data = build_evaluation(&board, &bundle).unwrap();

        let best = &data.moves[0];
        assert_eq!(best.q_score, -30);
        assert_eq!(best.white_score, 200);
        assert_eq!(best.draw_score, 300);
        assert_eq!(best.black_score, 500);
        assert_eq!(best.pv_san, "1… e5");
    }

    #[test]
    fn test_mate_score_encoding() {
        assert_eq!(
            white_score_of(Some(UciScore::Mate(3)), true),
            (MATE_SCORE - 3, Some(3))
        );
        assert_eq!(
            white_score_of(Some(UciScore::Mate(3)), false),
            (-MATE_SCORE + 3, Some(-3))
        );
        assert_eq!(
            white_score_of(Some(UciScore::Mate(-2)), true),
            (-MATE_SCORE + 2, Some(-2))
        );
        assert_eq!(white_score_of(None, true), (0, None));
    }

    #[test]
    fn test_build_evaluation_rejects_missing_pv() {
        let board = Chess::default();
        let mut bad = event(1, UciScore::Cp(0), (0, 1000, 0), 10, &[]);
        bad.pv.clear();
        assert!(build_evaluation(&board, &[bad]).is_err());
    }
}
