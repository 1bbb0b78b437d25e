//! Shared application state for the HTTP and WebSocket routes

use std::sync::Arc;

use analysis_engine::analyzer::WorkerHandle;
use analysis_engine::queue::GameQueue;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: GameQueue,
    pub workers: Arc<Vec<WorkerHandle>>,
}

impl AppState {
    /// Worker currently analyzing the given game, if any.
    pub fn worker_for_game(&self, game_id: i64) -> Option<&WorkerHandle> {
        self.workers
            .iter()
            .find(|w| w.current_game() == Some(game_id))
    }

    /// Worker whose current analysis target is the given thinking id.
    pub fn worker_for_thinking(&self, thinking_id: i64) -> Option<&WorkerHandle> {
        self.workers
            .iter()
            .find(|w| w.broadcaster.current_thinking() == Some(thinking_id))
    }
}
