//! UCI engine wrapper (async I/O, streamed multi-variation analysis)

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use tracing::debug;

use crate::error::EngineError;

/// Score of one variation, from the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UciScore {
    Cp(i32),
    Mate(i32),
}

/// Win/draw/loss counts in permille, from the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wdl {
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
}

/// One parsed `info` line of a running search. Most fields are optional on
/// the wire; an event without a rank carries no per-variation data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisEvent {
    /// 1-based variation rank (`multipv` tag)
    pub multipv: Option<u32>,
    pub depth: i32,
    pub seldepth: i32,
    pub time_ms: i64,
    pub nodes: i64,
    pub score: Option<UciScore>,
    pub wdl: Option<Wdl>,
    pub moves_left: Option<i32>,
    /// Principal variation in UCI notation
    pub pv: Vec<String>,
}

/// UCI engine instance. Stdout is drained by a detached reader task into a
/// channel, so waiting for the next line is safe to cancel at any point.
pub struct UciEngine {
    process: Child,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<String>,
    searching: bool,
}

impl UciEngine {
    /// Spawn an engine process and run the UCI handshake.
    pub async fn new(path: &str, threads: u32, hash_mb: u32) -> Result<Self, EngineError> {
        let mut process = Command::new(path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| EngineError::Engine(format!("Failed to spawn engine: {e}")))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| EngineError::Engine("Engine stdin unavailable".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| EngineError::Engine("Engine stdout unavailable".into()))?;

        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut engine = Self {
            process,
            stdin,
            lines,
            searching: false,
        };

        engine.send("uci").await?;
        engine.wait_for("uciok").await?;

        engine
            .send(&format!("setoption name Threads value {threads}"))
            .await?;
        engine
            .send(&format!("setoption name Hash value {hash_mb}"))
            .await?;
        engine.send("setoption name UCI_AnalyseMode value true").await?;
        engine.send("setoption name UCI_ShowWDL value true").await?;
        engine.send("isready").await?;
        engine.wait_for("readyok").await?;

        Ok(engine)
    }

    async fn send(&mut self, cmd: &str) -> Result<(), EngineError> {
        debug!(cmd, "engine <");
        self.stdin
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .map_err(|e| EngineError::Engine(format!("Failed to write to engine: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| EngineError::Engine(format!("Failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String, EngineError> {
        self.lines
            .recv()
            .await
            .ok_or_else(|| EngineError::Engine("Engine closed its stdout".into()))
    }

    /// Wait for a specific response line.
    async fn wait_for(&mut self, expected: &str) -> Result<(), EngineError> {
        loop {
            let line = self.recv_line().await?;
            let trimmed = line.trim();
            debug!(line = trimmed, "engine >");
            if trimmed == expected {
                return Ok(());
            }
        }
    }

    /// Start an open-ended search of `fen` with up to `multipv` variations.
    /// A search that is still running is stopped first.
    pub async fn go_infinite(&mut self, fen: &str, multipv: u32) -> Result<(), EngineError> {
        self.stop().await?;
        self.send(&format!("setoption name MultiPV value {multipv}"))
            .await?;
        self.send(&format!("position fen {fen}")).await?;
        self.send("go infinite").await?;
        self.searching = true;
        Ok(())
    }

    /// Next analysis event of the running search, or `None` once the engine
    /// reports `bestmove` (search over). Safe to cancel between events.
    pub async fn next_event(&mut self) -> Result<Option<AnalysisEvent>, EngineError> {
        loop {
            let line = self.recv_line().await?;
            let trimmed = line.trim();
            if trimmed.starts_with("bestmove") {
                self.searching = false;
                return Ok(None);
            }
            if let Some(event) = parse_info(trimmed) {
                return Ok(Some(event));
            }
        }
    }

    /// Stop the running search and drain engine output up to `bestmove`.
    /// No-op when no search is running.
    pub async fn stop(&mut self) -> Result<(), EngineError> {
        if !self.searching {
            return Ok(());
        }
        self.send("stop").await?;
        loop {
            let line = self.recv_line().await?;
            if line.trim().starts_with("bestmove") {
                self.searching = false;
                return Ok(());
            }
        }
    }

    /// Send quit and wait for the process to exit.
    pub async fn quit(&mut self) {
        let _ = self.send("quit").await;
        let _ = self.process.wait().await;
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        // Best-effort synchronous kill in drop
        let _ = self.process.start_kill();
    }
}

/// Parse one `info` line into an event. Returns `None` for lines that carry
/// no search data (`info string ...`, non-info lines).
pub fn parse_info(line: &str) -> Option<AnalysisEvent> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "info" {
        return None;
    }

    let mut event = AnalysisEvent::default();
    while let Some(token) = tokens.next() {
        match token {
            "string" => return None,
            "depth" => event.depth = parse_next(&mut tokens).unwrap_or(0),
            "seldepth" => event.seldepth = parse_next(&mut tokens).unwrap_or(0),
            "multipv" => event.multipv = parse_next(&mut tokens),
            "nodes" => event.nodes = parse_next(&mut tokens).unwrap_or(0),
            "time" => event.time_ms = parse_next(&mut tokens).unwrap_or(0),
            "movesleft" => event.moves_left = parse_next(&mut tokens),
            "score" => match tokens.next() {
                Some("cp") => event.score = parse_next(&mut tokens).map(UciScore::Cp),
                Some("mate") => event.score = parse_next(&mut tokens).map(UciScore::Mate),
                _ => {}
            },
            "wdl" => {
                let wins = parse_next(&mut tokens);
                let draws = parse_next(&mut tokens);
                let losses = parse_next(&mut tokens);
                if let (Some(wins), Some(draws), Some(losses)) = (wins, draws, losses) {
                    event.wdl = Some(Wdl {
                        wins,
                        draws,
                        losses,
                    });
                }
            }
            "pv" => {
                event.pv = tokens.by_ref().map(String::from).collect();
                break;
            }
            // Value of an unhandled key (nps, hashfull, currmove, ...)
            _ => {}
        }
    }

    Some(event)
}

fn parse_next<'a, T: std::str::FromStr>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<T> {
    tokens.next().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_info_line() {
        let line = "info depth 20 seldepth 28 multipv 1 score cp 35 wdl 402 521 77 \
                    nodes 100000 nps 500000 time 1500 movesleft 42 pv e2e4 e7e5 g1f3";
        let event = parse_info(line).unwrap();
        assert_eq!(event.depth, 20);
        assert_eq!(event.seldepth, 28);
        assert_eq!(event.multipv, Some(1));
        assert_eq!(event.score, Some(UciScore::Cp(35)));
        assert_eq!(
            event.wdl,
            Some(Wdl {
                wins: 402,
                draws: 521,
                losses: 77
            })
        );
        assert_eq!(event.nodes, 100_000);
        assert_eq!(event.time_ms, 1500);
        assert_eq!(event.moves_left, Some(42));
        assert_eq!(event.pv, vec!["e2e4", "e7e5", "g1f3"]);
    }

    #[test]
    fn test_parse_mate_score() {
        let line = "info depth 12 multipv 2 score mate -3 nodes 5000 time 20 pv h7h8q";
        let event = parse_info(line).unwrap();
        assert_eq!(event.score, Some(UciScore::Mate(-3)));
        assert_eq!(event.multipv, Some(2));
    }

    #[test]
    fn test_parse_line_without_rank() {
        let line = "info depth 5 currmove e2e4 currmovenumber 1";
        let event = parse_info(line).unwrap();
        assert_eq!(event.multipv, None);
        assert!(event.pv.is_empty());
    }

    #[test]
    fn test_parse_ignores_string_lines() {
        assert_eq!(parse_info("info string NNUE evaluation using nn.bin"), None);
        assert_eq!(parse_info("bestmove e2e4"), None);
    }
}
