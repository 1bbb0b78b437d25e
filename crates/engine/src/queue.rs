//! Distributes unfinished games across analysis workers

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tracing::warn;

use crate::db::{self, Game};
use crate::error::EngineError;

/// Shared claim registry over the games table. Each worker claims the oldest
/// unfinished game no other worker holds, so a pool of workers spreads over
/// the unfinished games without coordination beyond this set.
#[derive(Clone)]
pub struct GameQueue {
    pool: PgPool,
    claims: Arc<Mutex<HashSet<i64>>>,
    poll_interval: Duration,
}

impl GameQueue {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            claims: Arc::new(Mutex::new(HashSet::new())),
            poll_interval,
        }
    }

    /// Block until an unclaimed game is available, claim it and return it.
    /// The claim holds until [`GameQueue::release`].
    pub async fn next_game(&self) -> Game {
        loop {
            let claimed: Vec<i64> = self.claims.lock().unwrap().iter().copied().collect();
            match db::next_unclaimed_game(&self.pool, &claimed).await {
                Ok(Some(game)) => {
                    self.claims.lock().unwrap().insert(game.id);
                    return game;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to poll for unclaimed games"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn release(&self, game_id: i64) {
        self.claims.lock().unwrap().remove(&game_id);
    }

    /// Ids of the games currently claimed by workers.
    pub fn active_games(&self) -> HashSet<i64> {
        self.claims.lock().unwrap().clone()
    }

    pub async fn finish_game(&self, game_id: i64) -> Result<(), EngineError> {
        db::mark_game_finished(&self.pool, game_id).await
    }
}
