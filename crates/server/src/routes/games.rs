use std::collections::HashMap;

use analysis_engine::broadcast::{position_frame, PositionUpdate};
use analysis_engine::db;
use axum::{extract::Path, Extension, Json};
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: i64,
    pub name: String,
    pub is_finished: bool,
    pub is_being_analyzed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub name: Option<String>,
    pub rating: Option<i32>,
    pub fide_id: Option<i64>,
    pub fed: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameDetail {
    pub id: i64,
    pub name: String,
    pub is_finished: bool,
    pub players: Vec<PlayerInfo>,
    pub feed_url: String,
    pub positions: Vec<PositionUpdate>,
}

pub async fn list_games(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<GameSummary>>, AppError> {
    let games = db::list_games(&state.pool).await?;
    let active = state.queue.active_games();

    let summaries = games
        .into_iter()
        .map(|game| GameSummary {
            is_being_analyzed: active.contains(&game.id),
            id: game.id,
            name: game.name,
            is_finished: game.is_finished,
        })
        .collect();
    Ok(Json(summaries))
}

pub async fn get_game(
    Path(game_id): Path<i64>,
    Extension(state): Extension<AppState>,
) -> Result<Json<GameDetail>, AppError> {
    let game = db::fetch_game(&state.pool, game_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game {game_id} not found")))?;

    let positions = db::fetch_positions(&state.pool, game_id).await?;
    let mut thinkings: HashMap<i64, db::Thinking> = db::fetch_latest_thinkings(&state.pool, game_id)
        .await?
        .into_iter()
        .map(|t| (t.position_id, t))
        .collect();

    let rows: Vec<_> = positions
        .into_iter()
        .map(|pos| {
            let thinking = thinkings.remove(&pos.id);
            (pos, thinking)
        })
        .collect();

    let feed_url = format!(
        "https://lichess.org/api/stream/broadcast/round/{}.pgn",
        game.lichess_round_id
    );
    Ok(Json(GameDetail {
        id: game.id,
        name: game.name,
        is_finished: game.is_finished,
        players: vec![
            PlayerInfo {
                name: game.player1_name,
                rating: game.player1_rating,
                fide_id: game.player1_fide_id,
                fed: game.player1_fed,
            },
            PlayerInfo {
                name: game.player2_name,
                rating: game.player2_rating,
                fide_id: game.player2_fide_id,
                fed: game.player2_fed,
            },
        ],
        feed_url,
        positions: position_frame(&rows).positions,
    }))
}
