//! Live broadcast analysis engine.
//!
//! Follows chess games from a live PGN broadcast feed, keeps a UCI engine
//! analyzing the current leaf position, and fans position and evaluation
//! updates out to live subscribers.

pub mod analyzer;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod notation;
pub mod queue;
pub mod reconciler;
pub mod session;
pub mod uci;
