use server::routes;
use server::state::AppState;

use std::sync::Arc;
use std::time::Duration;

use analysis_engine::analyzer::Analyzer;
use analysis_engine::config::Config;
use analysis_engine::db;
use analysis_engine::queue::GameQueue;
use analysis_engine::uci::UciEngine;
use axum::{routing::get, Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    // Connect to Postgres
    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run schema migrations
    tracing::info!("Running migrations...");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let queue = GameQueue::new(pool.clone(), Duration::from_secs(config.poll_interval_secs));

    // One engine process per worker
    let mut workers = Vec::with_capacity(config.workers);
    for i in 0..config.workers {
        let engine = UciEngine::new(
            &config.engine_command,
            config.engine_threads,
            config.engine_hash_mb,
        )
        .await
        .expect("Failed to start engine");
        let analyzer = Analyzer::new(engine, pool.clone(), queue.clone(), config.max_multipv);
        workers.push(analyzer.handle());
        tokio::spawn(analyzer.run());
        tracing::info!("Started analysis worker {i}");
    }

    let state = AppState {
        pool,
        queue,
        workers: Arc::new(workers),
    };

    // CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        // Health
        .route("/health", get(routes::health::health_check))
        // Games
        .route("/api/games", get(routes::games::list_games))
        .route("/api/games/{game_id}", get(routes::games::get_game))
        // Live updates
        .route(
            "/api/ws/games/{game_id}/positions",
            get(routes::ws::positions_ws),
        )
        .route(
            "/api/ws/analysis/{thinking_id}",
            get(routes::ws::analysis_ws),
        )
        // Shared state
        .layer(Extension(state))
        .layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
