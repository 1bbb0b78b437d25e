//! Self-healing pub/sub fan-out for position and analysis updates

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::db::{Evaluation, EvaluationMoveData, GamePosition, Thinking};

/// One position row as sent to subscribers, with the running totals of its
/// analysis session when one is attached.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    /// 0 for the starting position
    pub ply: i32,
    pub thinking_id: Option<i64>,
    pub move_uci: Option<String>,
    pub move_san: Option<String>,
    pub fen: String,
    pub white_clock: Option<i32>,
    pub black_clock: Option<i32>,
    pub score_q: Option<i32>,
    pub score_w: Option<i32>,
    pub score_d: Option<i32>,
    pub score_b: Option<i32>,
    pub moves_left: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionUpdateFrame {
    pub positions: Vec<PositionUpdate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingMoveUpdate {
    pub nodes: i64,
    pub move_uci: String,
    pub move_opp_uci: Option<String>,
    pub move_san: String,
    pub pv_san: String,
    pub score_q: i32,
    pub score_w: i32,
    pub score_d: i32,
    pub score_b: i32,
    pub mate_score: Option<i32>,
    pub moves_left: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingUpdate {
    pub update_id: i64,
    pub nodes: i64,
    pub time: i64,
    pub depth: i32,
    pub seldepth: i32,
    pub moves: Vec<ThinkingMoveUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingUpdateFrame {
    pub thinkings: Vec<ThinkingUpdate>,
}

/// Build a position frame from rows and their optional session totals.
pub fn position_frame(rows: &[(GamePosition, Option<Thinking>)]) -> PositionUpdateFrame {
    PositionUpdateFrame {
        positions: rows
            .iter()
            .map(|(pos, thinking)| PositionUpdate {
                ply: pos.ply_number,
                thinking_id: thinking.as_ref().map(|t| t.id),
                move_uci: pos.move_uci.clone(),
                move_san: pos.move_san.clone(),
                fen: pos.fen.clone(),
                white_clock: pos.white_clock,
                black_clock: pos.black_clock,
                score_q: thinking.as_ref().map(|t| t.q_score),
                score_w: thinking.as_ref().map(|t| t.white_score),
                score_d: thinking.as_ref().map(|t| t.draw_score),
                score_b: thinking.as_ref().map(|t| t.black_score),
                moves_left: thinking.as_ref().and_then(|t| t.moves_left),
            })
            .collect(),
    }
}

/// Build an analysis frame from one persisted evaluation and its ranked moves.
pub fn thinking_frame(evaluation: &Evaluation, moves: &[EvaluationMoveData]) -> ThinkingUpdateFrame {
    ThinkingUpdateFrame {
        thinkings: vec![ThinkingUpdate {
            update_id: evaluation.id,
            nodes: evaluation.nodes,
            time: evaluation.time_ms,
            depth: evaluation.depth,
            seldepth: evaluation.seldepth,
            moves: moves
                .iter()
                .map(|mv| ThinkingMoveUpdate {
                    nodes: mv.nodes,
                    move_uci: mv.move_uci.clone(),
                    move_opp_uci: mv.move_opp_uci.clone(),
                    move_san: mv.move_san.clone(),
                    pv_san: mv.pv_san.clone(),
                    score_q: mv.q_score,
                    score_w: mv.white_score,
                    score_d: mv.draw_score,
                    score_b: mv.black_score,
                    mate_score: mv.mate_score,
                    moves_left: mv.moves_left,
                })
                .collect(),
        }],
    }
}

#[derive(Default)]
struct Registries {
    position_subs: Vec<mpsc::UnboundedSender<PositionUpdateFrame>>,
    analysis_subs: Vec<mpsc::UnboundedSender<ThinkingUpdateFrame>>,
    current_thinking: Option<i64>,
}

/// Fan-out hub with two independent subscriber registries.
///
/// Position subscribers persist across analysis sessions. Analysis
/// subscribers are bound to the current analysis target: when a new session
/// becomes current, their streams are force-closed and they must re-subscribe
/// with the new thinking id.
///
/// The registries are guarded by a mutex that is never held across an await;
/// delivery uses unbounded channels, so a slow subscriber never blocks the
/// publisher. Subscribers whose channel is closed are dropped on the next
/// publish.
#[derive(Default)]
pub struct Broadcaster {
    inner: Mutex<Registries>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_positions(&self) -> mpsc::UnboundedReceiver<PositionUpdateFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().position_subs.push(tx);
        rx
    }

    /// Subscribe to detailed updates of one analysis session. Returns `None`
    /// unless `thinking_id` is the current analysis target.
    pub fn subscribe_analysis(
        &self,
        thinking_id: i64,
    ) -> Option<mpsc::UnboundedReceiver<ThinkingUpdateFrame>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_thinking != Some(thinking_id) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.analysis_subs.push(tx);
        Some(rx)
    }

    pub fn current_thinking(&self) -> Option<i64> {
        self.inner.lock().unwrap().current_thinking
    }

    /// Record a new analysis target. Every existing analysis subscriber's
    /// stream is closed so that clients observe the target change and
    /// re-subscribe, instead of silently receiving stale data.
    pub fn set_current_thinking(&self, thinking_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current_thinking != Some(thinking_id) {
            inner.current_thinking = Some(thinking_id);
            inner.analysis_subs.clear();
        }
    }

    /// Deliver a position frame to all position subscribers. Subscribers
    /// whose channel is closed are silently removed.
    pub fn publish_positions(&self, frame: PositionUpdateFrame) {
        if frame.positions.is_empty() {
            return;
        }
        self.inner
            .lock()
            .unwrap()
            .position_subs
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }

    /// Deliver an analysis frame to all analysis subscribers, with the same
    /// drop semantics as position delivery.
    pub fn publish_analysis(&self, frame: ThinkingUpdateFrame) {
        if frame.thinkings.is_empty() {
            return;
        }
        self.inner
            .lock()
            .unwrap()
            .analysis_subs
            .retain(|tx| tx.send(frame.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(ply: i32) -> GamePosition {
        GamePosition {
            id: ply as i64 + 1,
            game_id: 1,
            ply_number: ply,
            fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            move_uci: None,
            move_san: None,
            white_clock: None,
            black_clock: None,
        }
    }

    fn sample_frame() -> PositionUpdateFrame {
        position_frame(&[(sample_position(0), None)])
    }

    fn sample_analysis_frame() -> ThinkingUpdateFrame {
        let evaluation = Evaluation {
            id: 7,
            thinking_id: 3,
            nodes: 1000,
            time_ms: 250,
            depth: 12,
            seldepth: 20,
        };
        thinking_frame(&evaluation, &[])
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut rx1 = broadcaster.subscribe_positions();
        let mut rx2 = broadcaster.subscribe_positions();

        broadcaster.publish_positions(sample_frame());

        assert_eq!(rx1.recv().await.unwrap().positions[0].ply, 0);
        assert_eq!(rx2.recv().await.unwrap().positions[0].ply, 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_is_dropped_silently() {
        let broadcaster = Broadcaster::new();
        let _rx1 = broadcaster.subscribe_positions();
        let rx2 = broadcaster.subscribe_positions();
        let _rx3 = broadcaster.subscribe_positions();
        drop(rx2);

        broadcaster.publish_positions(sample_frame());

        assert_eq!(broadcaster.inner.lock().unwrap().position_subs.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_publish_is_noop() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe_positions();

        broadcaster.publish_positions(PositionUpdateFrame { positions: vec![] });

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_change_closes_analysis_subscribers() {
        let broadcaster = Broadcaster::new();
        broadcaster.set_current_thinking(1);
        let mut rx = broadcaster.subscribe_analysis(1).unwrap();

        broadcaster.set_current_thinking(2);
        broadcaster.publish_analysis(sample_analysis_frame());

        // The old subscription observes end-of-stream, never target-2 data.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_with_stale_target_is_rejected() {
        let broadcaster = Broadcaster::new();
        broadcaster.set_current_thinking(5);
        assert!(broadcaster.subscribe_analysis(4).is_none());
        assert!(broadcaster.subscribe_analysis(5).is_some());
    }

    #[tokio::test]
    async fn test_resetting_same_target_keeps_subscribers() {
        let broadcaster = Broadcaster::new();
        broadcaster.set_current_thinking(9);
        let mut rx = broadcaster.subscribe_analysis(9).unwrap();

        broadcaster.set_current_thinking(9);
        broadcaster.publish_analysis(sample_analysis_frame());

        assert_eq!(rx.recv().await.unwrap().thinkings[0].update_id, 7);
    }
}
