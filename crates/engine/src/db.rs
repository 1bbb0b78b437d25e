//! Database pool, schema and queries for games, positions and evaluations

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::EngineError;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run the full Postgres schema migration inline.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Broadcast games (one unit of analysis work)
CREATE TABLE IF NOT EXISTS games (
    id               BIGSERIAL PRIMARY KEY,
    name             TEXT NOT NULL,
    lichess_round_id TEXT NOT NULL,
    lichess_game_id  TEXT,
    is_finished      BOOLEAN NOT NULL DEFAULT FALSE,
    is_hidden        BOOLEAN NOT NULL DEFAULT FALSE,
    player1_name     TEXT,
    player1_rating   INTEGER,
    player1_fide_id  BIGINT,
    player1_fed      TEXT,
    player2_name     TEXT,
    player2_rating   INTEGER,
    player2_fide_id  BIGINT,
    player2_fed      TEXT,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- PGN header filters selecting one game out of a broadcast round
CREATE TABLE IF NOT EXISTS game_filters (
    id      BIGSERIAL PRIMARY KEY,
    game_id BIGINT NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    key     TEXT NOT NULL,
    value   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_game_filters_game_id ON game_filters (game_id);

-- One ply of a game's move sequence; ply 0 is the starting position
CREATE TABLE IF NOT EXISTS game_positions (
    id          BIGSERIAL PRIMARY KEY,
    game_id     BIGINT NOT NULL REFERENCES games(id) ON DELETE CASCADE,
    ply_number  INTEGER NOT NULL,
    fen         TEXT NOT NULL,
    move_uci    TEXT,
    move_san    TEXT,
    white_clock INTEGER,
    black_clock INTEGER,
    UNIQUE (game_id, ply_number)
);

CREATE INDEX IF NOT EXISTS idx_game_positions_game_id ON game_positions (game_id);

-- One live analysis instance attached to a leaf position
CREATE TABLE IF NOT EXISTS position_thinkings (
    id          BIGSERIAL PRIMARY KEY,
    position_id BIGINT NOT NULL REFERENCES game_positions(id) ON DELETE CASCADE,
    nodes       BIGINT NOT NULL DEFAULT 0,
    q_score     INTEGER NOT NULL DEFAULT 0,
    white_score INTEGER NOT NULL DEFAULT 0,
    draw_score  INTEGER NOT NULL DEFAULT 0,
    black_score INTEGER NOT NULL DEFAULT 0,
    moves_left  INTEGER
);

CREATE INDEX IF NOT EXISTS idx_position_thinkings_position_id
    ON position_thinkings (position_id);

-- One complete multi-variation bundle reported by the engine
CREATE TABLE IF NOT EXISTS thinking_evaluations (
    id          BIGSERIAL PRIMARY KEY,
    thinking_id BIGINT NOT NULL REFERENCES position_thinkings(id) ON DELETE CASCADE,
    nodes       BIGINT NOT NULL,
    time_ms     BIGINT NOT NULL,
    depth       INTEGER NOT NULL,
    seldepth    INTEGER NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_thinking_evaluations_thinking_id
    ON thinking_evaluations (thinking_id);

-- One ranked variation within an evaluation bundle
CREATE TABLE IF NOT EXISTS evaluation_moves (
    id            BIGSERIAL PRIMARY KEY,
    evaluation_id BIGINT NOT NULL REFERENCES thinking_evaluations(id) ON DELETE CASCADE,
    rank          INTEGER NOT NULL,
    nodes         BIGINT NOT NULL,
    move_uci      TEXT NOT NULL,
    move_opp_uci  TEXT,
    move_san      TEXT NOT NULL,
    pv_san        TEXT NOT NULL,
    q_score       INTEGER NOT NULL,
    mate_score    INTEGER,
    white_score   INTEGER NOT NULL,
    draw_score    INTEGER NOT NULL,
    black_score   INTEGER NOT NULL,
    moves_left    INTEGER
);

CREATE INDEX IF NOT EXISTS idx_evaluation_moves_evaluation_id
    ON evaluation_moves (evaluation_id);
"#;

/// One broadcast game.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Game {
    pub id: i64,
    pub name: String,
    pub lichess_round_id: String,
    pub lichess_game_id: Option<String>,
    pub is_finished: bool,
    pub is_hidden: bool,
    pub player1_name: Option<String>,
    pub player1_rating: Option<i32>,
    pub player1_fide_id: Option<i64>,
    pub player1_fed: Option<String>,
    pub player2_name: Option<String>,
    pub player2_rating: Option<i32>,
    pub player2_fide_id: Option<i64>,
    pub player2_fed: Option<String>,
}

/// One recorded ply of a game.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GamePosition {
    pub id: i64,
    pub game_id: i64,
    pub ply_number: i32,
    pub fen: String,
    pub move_uci: Option<String>,
    pub move_san: Option<String>,
    pub white_clock: Option<i32>,
    pub black_clock: Option<i32>,
}

/// Running totals of one live analysis session.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Thinking {
    pub id: i64,
    pub position_id: i64,
    pub nodes: i64,
    pub q_score: i32,
    pub white_score: i32,
    pub draw_score: i32,
    pub black_score: i32,
    pub moves_left: Option<i32>,
}

/// One persisted evaluation bundle.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Evaluation {
    pub id: i64,
    pub thinking_id: i64,
    pub nodes: i64,
    pub time_ms: i64,
    pub depth: i32,
    pub seldepth: i32,
}

/// Input for idempotent position creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionParams {
    pub ply_number: i32,
    pub fen: String,
    pub move_uci: Option<String>,
    pub move_san: Option<String>,
    pub white_clock: Option<i32>,
    pub black_clock: Option<i32>,
}

/// One completed bundle, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationData {
    pub nodes: i64,
    pub time_ms: i64,
    pub depth: i32,
    pub seldepth: i32,
    pub moves: Vec<EvaluationMoveData>,
}

/// One ranked variation of a bundle, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationMoveData {
    pub nodes: i64,
    pub move_uci: String,
    pub move_opp_uci: Option<String>,
    pub move_san: String,
    pub pv_san: String,
    pub q_score: i32,
    pub mate_score: Option<i32>,
    pub white_score: i32,
    pub draw_score: i32,
    pub black_score: i32,
    pub moves_left: Option<i32>,
}

const GAME_COLUMNS: &str = "id, name, lichess_round_id, lichess_game_id, is_finished, is_hidden, \
     player1_name, player1_rating, player1_fide_id, player1_fed, \
     player2_name, player2_rating, player2_fide_id, player2_fed";

pub async fn fetch_game(pool: &PgPool, game_id: i64) -> Result<Option<Game>, EngineError> {
    let game = sqlx::query_as::<_, Game>(&format!(
        "SELECT {GAME_COLUMNS} FROM games WHERE id = $1"
    ))
    .bind(game_id)
    .fetch_optional(pool)
    .await?;
    Ok(game)
}

pub async fn list_games(pool: &PgPool) -> Result<Vec<Game>, EngineError> {
    let games = sqlx::query_as::<_, Game>(&format!(
        "SELECT {GAME_COLUMNS} FROM games WHERE is_hidden = FALSE ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(games)
}

/// Oldest unfinished, visible game not currently claimed by any worker.
pub async fn next_unclaimed_game(
    pool: &PgPool,
    claimed: &[i64],
) -> Result<Option<Game>, EngineError> {
    let game = sqlx::query_as::<_, Game>(&format!(
        "SELECT {GAME_COLUMNS} FROM games \
         WHERE is_finished = FALSE AND is_hidden = FALSE AND NOT (id = ANY($1)) \
         ORDER BY id LIMIT 1"
    ))
    .bind(claimed)
    .fetch_optional(pool)
    .await?;
    Ok(game)
}

pub async fn fetch_game_filters(
    pool: &PgPool,
    game_id: i64,
) -> Result<Vec<(String, String)>, EngineError> {
    let filters: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM game_filters WHERE game_id = $1")
            .bind(game_id)
            .fetch_all(pool)
            .await?;
    Ok(filters)
}

pub async fn fetch_positions(
    pool: &PgPool,
    game_id: i64,
) -> Result<Vec<GamePosition>, EngineError> {
    let positions = sqlx::query_as::<_, GamePosition>(
        "SELECT id, game_id, ply_number, fen, move_uci, move_san, white_clock, black_clock \
         FROM game_positions WHERE game_id = $1 ORDER BY ply_number",
    )
    .bind(game_id)
    .fetch_all(pool)
    .await?;
    Ok(positions)
}

/// Create a position if it does not exist yet. Returns the row and whether it
/// was created by this call. On conflict the existing row is kept, except that
/// NULL clocks are back-filled from the incoming snapshot.
pub async fn create_position_if_absent(
    pool: &PgPool,
    game_id: i64,
    params: &PositionParams,
) -> Result<(GamePosition, bool), EngineError> {
    let inserted = sqlx::query_as::<_, GamePosition>(
        "INSERT INTO game_positions \
            (game_id, ply_number, fen, move_uci, move_san, white_clock, black_clock) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (game_id, ply_number) DO NOTHING \
         RETURNING id, game_id, ply_number, fen, move_uci, move_san, white_clock, black_clock",
    )
    .bind(game_id)
    .bind(params.ply_number)
    .bind(&params.fen)
    .bind(&params.move_uci)
    .bind(&params.move_san)
    .bind(params.white_clock)
    .bind(params.black_clock)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok((row, true));
    }

    let existing = sqlx::query_as::<_, GamePosition>(
        "UPDATE game_positions \
         SET white_clock = COALESCE(white_clock, $3), black_clock = COALESCE(black_clock, $4) \
         WHERE game_id = $1 AND ply_number = $2 \
         RETURNING id, game_id, ply_number, fen, move_uci, move_san, white_clock, black_clock",
    )
    .bind(game_id)
    .bind(params.ply_number)
    .bind(params.white_clock)
    .bind(params.black_clock)
    .fetch_one(pool)
    .await?;

    Ok((existing, false))
}

/// Latest analysis totals for each analyzed position of a game.
pub async fn fetch_latest_thinkings(
    pool: &PgPool,
    game_id: i64,
) -> Result<Vec<Thinking>, EngineError> {
    let thinkings = sqlx::query_as::<_, Thinking>(
        "SELECT DISTINCT ON (t.position_id) \
            t.id, t.position_id, t.nodes, t.q_score, t.white_score, t.draw_score, \
            t.black_score, t.moves_left \
         FROM position_thinkings t \
         JOIN game_positions p ON p.id = t.position_id \
         WHERE p.game_id = $1 \
         ORDER BY t.position_id, t.id DESC",
    )
    .bind(game_id)
    .fetch_all(pool)
    .await?;
    Ok(thinkings)
}

pub async fn mark_game_finished(pool: &PgPool, game_id: i64) -> Result<(), EngineError> {
    sqlx::query("UPDATE games SET is_finished = TRUE WHERE id = $1")
        .bind(game_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_thinking(pool: &PgPool, position_id: i64) -> Result<Thinking, EngineError> {
    let thinking = sqlx::query_as::<_, Thinking>(
        "INSERT INTO position_thinkings (position_id) VALUES ($1) \
         RETURNING id, position_id, nodes, q_score, white_score, draw_score, black_score, moves_left",
    )
    .bind(position_id)
    .fetch_one(pool)
    .await?;
    Ok(thinking)
}

pub async fn update_thinking_totals(pool: &PgPool, thinking: &Thinking) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE position_thinkings \
         SET nodes = $2, q_score = $3, white_score = $4, draw_score = $5, black_score = $6, \
             moves_left = $7 \
         WHERE id = $1",
    )
    .bind(thinking.id)
    .bind(thinking.nodes)
    .bind(thinking.q_score)
    .bind(thinking.white_score)
    .bind(thinking.draw_score)
    .bind(thinking.black_score)
    .bind(thinking.moves_left)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_evaluation(
    pool: &PgPool,
    thinking_id: i64,
    data: &EvaluationData,
) -> Result<Evaluation, EngineError> {
    let evaluation = sqlx::query_as::<_, Evaluation>(
        "INSERT INTO thinking_evaluations (thinking_id, nodes, time_ms, depth, seldepth) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING id, thinking_id, nodes, time_ms, depth, seldepth",
    )
    .bind(thinking_id)
    .bind(data.nodes)
    .bind(data.time_ms)
    .bind(data.depth)
    .bind(data.seldepth)
    .fetch_one(pool)
    .await?;
    Ok(evaluation)
}

/// Bulk-create the ranked moves of one evaluation, best variation first.
pub async fn insert_evaluation_moves(
    pool: &PgPool,
    evaluation_id: i64,
    moves: &[EvaluationMoveData],
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;
    for (rank, mv) in moves.iter().enumerate() {
        sqlx::query(
            "INSERT INTO evaluation_moves \
                (evaluation_id, rank, nodes, move_uci, move_opp_uci, move_san, pv_san, \
                 q_score, mate_score, white_score, draw_score, black_score, moves_left) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(evaluation_id)
        .bind((rank + 1) as i32)
        .bind(mv.nodes)
        .bind(&mv.move_uci)
        .bind(&mv.move_opp_uci)
        .bind(&mv.move_san)
        .bind(&mv.pv_san)
        .bind(mv.q_score)
        .bind(mv.mate_score)
        .bind(mv.white_score)
        .bind(mv.draw_score)
        .bind(mv.black_score)
        .bind(mv.moves_left)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}
