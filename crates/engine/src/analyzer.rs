//! Worker loop: claim a game, follow its feed and analyze the leaf position

use std::sync::{Arc, Mutex};

use shakmaty::Chess;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::{position_frame, Broadcaster};
use crate::db::{self, Game, GamePosition};
use crate::error::EngineError;
use crate::feed::{FeedClient, GameSnapshot};
use crate::notation;
use crate::queue::GameQueue;
use crate::session;
use crate::uci::UciEngine;

/// Shared view of one worker, for the serving layer: which game it holds and
/// the broadcaster its updates go out on.
#[derive(Clone)]
pub struct WorkerHandle {
    pub broadcaster: Arc<Broadcaster>,
    current_game: Arc<Mutex<Option<i64>>>,
}

impl WorkerHandle {
    fn new() -> Self {
        Self {
            broadcaster: Arc::new(Broadcaster::new()),
            current_game: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current_game(&self) -> Option<i64> {
        *self.current_game.lock().unwrap()
    }

    fn set_current_game(&self, game_id: Option<i64>) {
        *self.current_game.lock().unwrap() = game_id;
    }
}

enum NextStep {
    Snapshot(Option<GameSnapshot>),
    SessionEnded,
}

/// One analysis worker: a dedicated engine process plus the loop that claims
/// games off the queue and tracks them to completion.
pub struct Analyzer {
    engine: UciEngine,
    pool: PgPool,
    queue: GameQueue,
    handle: WorkerHandle,
    max_multipv: u32,
}

impl Analyzer {
    pub fn new(engine: UciEngine, pool: PgPool, queue: GameQueue, max_multipv: u32) -> Self {
        Self {
            engine,
            pool,
            queue,
            handle: WorkerHandle::new(),
            max_multipv,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Run forever. A failed game is released back and the worker moves on;
    /// only engine start-up failures are fatal to the worker.
    pub async fn run(mut self) {
        loop {
            let game = self.queue.next_game().await;
            info!(game_id = game.id, name = %game.name, "claimed game");
            self.handle.set_current_game(Some(game.id));

            if let Err(e) = self.run_game(&game).await {
                error!(game_id = game.id, error = %e, "game analysis failed");
            }

            if let Err(e) = self.engine.stop().await {
                error!(error = %e, "engine did not stop cleanly, worker exiting");
                self.handle.set_current_game(None);
                self.queue.release(game.id);
                return;
            }
            self.handle.set_current_game(None);
            self.queue.release(game.id);
        }
    }

    async fn run_game(&mut self, game: &Game) -> Result<(), EngineError> {
        let filters = db::fetch_game_filters(&self.pool, game.id).await?;

        // Capacity 1: the feed task parks on send until the tracker has
        // taken the previous snapshot, so only the freshest state is seen.
        let (tx, rx) = mpsc::channel::<GameSnapshot>(1);
        let round_id = game.lichess_round_id.clone();
        let feed_task = tokio::spawn(async move {
            let client = FeedClient::new();
            if let Err(e) = client.stream_round(&round_id, &filters, tx).await {
                warn!(error = %e, "feed stream failed");
            }
        });

        let result = self.track_game(game, rx).await;
        feed_task.abort();
        result
    }

    /// Follow snapshots until the feed ends, racing each analysis session
    /// against the arrival of the next snapshot.
    async fn track_game(
        &mut self,
        game: &Game,
        mut rx: mpsc::Receiver<GameSnapshot>,
    ) -> Result<(), EngineError> {
        let mut next = rx.recv().await;
        let mut analyzed_leaf: Option<i64> = None;

        loop {
            let Some(snapshot) = next else {
                info!(game_id = game.id, "feed ended, marking game finished");
                self.queue.finish_game(game.id).await?;
                return Ok(());
            };

            let (leaf, board) = self.record_snapshot(game, &snapshot).await?;

            if analyzed_leaf == Some(leaf.id) {
                // Snapshot brought no new moves (clock tick or header churn);
                // the running search stays on this leaf.
                next = rx.recv().await;
                continue;
            }
            analyzed_leaf = Some(leaf.id);

            let step = {
                let think = session::think(
                    &mut self.engine,
                    &self.pool,
                    &self.handle.broadcaster,
                    &leaf,
                    &board,
                    self.max_multipv,
                );
                tokio::pin!(think);
                tokio::select! {
                    snapshot = rx.recv() => NextStep::Snapshot(snapshot),
                    res = &mut think => {
                        if let Err(e) = res {
                            warn!(game_id = game.id, error = %e, "analysis session abandoned");
                        }
                        NextStep::SessionEnded
                    }
                }
            };
            // The session future is dropped; release the engine search
            // before touching it again.
            self.engine.stop().await?;

            next = match step {
                NextStep::Snapshot(snapshot) => snapshot,
                NextStep::SessionEnded => rx.recv().await,
            };
        }
    }

    /// Persist the snapshot's position list and publish the newly created
    /// plies. Returns the leaf position and its board.
    async fn record_snapshot(
        &self,
        game: &Game,
        snapshot: &GameSnapshot,
    ) -> Result<(GamePosition, Chess), EngineError> {
        let (params, board) = notation::replay_snapshot(snapshot)?;

        let mut leaf: Option<GamePosition> = None;
        let mut created: Vec<(GamePosition, Option<db::Thinking>)> = Vec::new();
        for position in &params {
            let (row, was_created) =
                db::create_position_if_absent(&self.pool, game.id, position).await?;
            if was_created {
                created.push((row.clone(), None));
            }
            leaf = Some(row);
        }
        if !created.is_empty() {
            debug!(game_id = game.id, new_plies = created.len(), "recorded new positions");
            self.handle.broadcaster.publish_positions(position_frame(&created));
        }

        // replay_snapshot always yields at least the starting position
        let leaf = leaf.ok_or_else(|| EngineError::Feed("snapshot without positions".into()))?;
        Ok((leaf, board))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn empty_snapshot() -> GameSnapshot {
        GameSnapshot {
            headers: vec![],
            moves: vec![],
        }
    }

    #[tokio::test]
    async fn test_arriving_snapshot_drops_running_session() {
        let (tx, mut rx) = mpsc::channel::<GameSnapshot>(1);
        let session_dropped = Arc::new(AtomicBool::new(false));

        tx.send(empty_snapshot()).await.unwrap();

        let step = {
            let flag = DropFlag(session_dropped.clone());
            let think = async move {
                let _flag = flag;
                std::future::pending::<Result<(), EngineError>>().await
            };
            tokio::pin!(think);
            tokio::select! {
                snapshot = rx.recv() => NextStep::Snapshot(snapshot),
                _res = &mut think => NextStep::SessionEnded,
            }
        };

        // The open-ended session future died with its scope; the engine can
        // be stopped and retargeted before the fresh snapshot is processed.
        assert!(session_dropped.load(Ordering::SeqCst));
        assert!(matches!(step, NextStep::Snapshot(Some(_))));
    }

    #[tokio::test]
    async fn test_completed_session_waits_for_next_snapshot() {
        let (tx, mut rx) = mpsc::channel::<GameSnapshot>(1);

        let step = {
            let think = async { Ok::<(), EngineError>(()) };
            tokio::pin!(think);
            tokio::select! {
                snapshot = rx.recv() => NextStep::Snapshot(snapshot),
                _res = &mut think => NextStep::SessionEnded,
            }
        };
        assert!(matches!(step, NextStep::SessionEnded));

        tx.send(empty_snapshot()).await.unwrap();
        assert!(rx.recv().await.is_some());
    }
}
