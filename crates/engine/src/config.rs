//! Configuration from environment variables

use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    /// Postgres connection URL
    pub database_url: String,
    /// Path to the UCI engine binary
    pub engine_command: String,
    /// Threads per engine process
    pub engine_threads: u32,
    /// Hash table size per engine process, in MiB
    pub engine_hash_mb: u32,
    /// Maximum number of variations requested per analysis session
    pub max_multipv: u32,
    /// Number of analyzer workers (one engine process each)
    pub workers: usize,
    /// Seconds between polls of the game queue when it is empty
    pub poll_interval_secs: u64,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            engine_command: env::var("ENGINE_COMMAND")
                .unwrap_or_else(|_| "/usr/local/bin/stockfish".to_string()),
            engine_threads: env::var("ENGINE_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            engine_hash_mb: env::var("ENGINE_HASH_MB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(256),
            max_multipv: env::var("MAX_MULTIPV")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            workers: env::var("WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}
