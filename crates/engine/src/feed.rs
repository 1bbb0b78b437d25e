//! Streaming PGN feed client for live broadcast rounds

use futures::StreamExt;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;

/// One full game-record snapshot taken from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSnapshot {
    pub headers: Vec<(String, String)>,
    pub moves: Vec<SnapshotMove>,
}

/// One mainline move with its clock annotation, when present (seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMove {
    pub san: String,
    pub clock: Option<i32>,
}

impl GameSnapshot {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when every (key, value) header filter matches.
    pub fn matches(&self, filters: &[(String, String)]) -> bool {
        filters
            .iter()
            .all(|(key, value)| self.header(key) == Some(value.as_str()))
    }
}

/// Parse one PGN document into a snapshot. Returns `None` for text without
/// any PGN headers (stream keep-alives and the like).
pub fn parse_snapshot(pgn: &str) -> Option<GameSnapshot> {
    let header_re = Regex::new(r#"\[(\w+)\s+"([^"]*)"\]"#).unwrap();
    let headers: Vec<(String, String)> = header_re
        .captures_iter(pgn)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect();
    if headers.is_empty() {
        return None;
    }

    // Movetext starts after the header block; splitting there keeps the
    // bracketed clock annotations inside comments intact.
    let movetext = pgn
        .split_once("\n\n")
        .map(|(_, rest)| rest)
        .unwrap_or_default();
    let strip_variations_re = Regex::new(r"\([^)]*\)").unwrap();
    let movetext = strip_variations_re.replace_all(movetext, "");

    let token_re = Regex::new(
        r"\{[^}]*\}|[KQRBN]?[a-h]?[1-8]?x?[a-h][1-8](?:=[QRBN])?[+#]?|O-O-O[+#]?|O-O[+#]?",
    )
    .unwrap();
    let clock_re = Regex::new(r"%clk\s+(\d+):(\d{1,2}):(\d{1,2})").unwrap();

    let mut moves: Vec<SnapshotMove> = Vec::new();
    for token in token_re.find_iter(&movetext) {
        let token = token.as_str();
        if let Some(comment) = token.strip_prefix('{') {
            if let Some(cap) = clock_re.captures(comment) {
                let hours: i32 = cap[1].parse().unwrap_or(0);
                let minutes: i32 = cap[2].parse().unwrap_or(0);
                let seconds: i32 = cap[3].parse().unwrap_or(0);
                if let Some(last) = moves.last_mut() {
                    last.clock = Some(hours * 3600 + minutes * 60 + seconds);
                }
            }
        } else {
            moves.push(SnapshotMove {
                san: token.to_string(),
                clock: None,
            });
        }
    }

    Some(GameSnapshot { headers, moves })
}

/// Take the next complete PGN document off the stream buffer. A document is
/// complete once the blank line terminating its movetext has arrived, so a
/// finished snapshot is released immediately instead of waiting for a
/// successor document. Trailing partial data is flushed by the caller at end
/// of stream.
fn take_document(buf: &mut String) -> Option<String> {
    let start = buf.find("[Event ")?;
    let headers_end = start + buf[start..].find("\n\n")?;
    let movetext_start = headers_end + 2;
    let end = movetext_start + buf[movetext_start..].find("\n\n")?;
    let doc = buf[start..end].to_string();
    buf.drain(..end + 2);
    Some(doc)
}

pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl FeedClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("live-analysis/1.0")
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap();
        Self {
            client,
            base_url: "https://lichess.org/api/stream/broadcast/round".to_string(),
        }
    }

    /// Stream a broadcast round, forwarding each snapshot that matches the
    /// header filters into `tx`. The channel has capacity 1: sending awaits
    /// until the consumer has taken the previous snapshot, so the feed never
    /// runs ahead of the tracker. Returns when the broadcast ends; dropping
    /// `tx` signals end-of-feed to the consumer.
    pub async fn stream_round(
        &self,
        round_id: &str,
        filters: &[(String, String)],
        tx: mpsc::Sender<GameSnapshot>,
    ) -> Result<(), EngineError> {
        let url = format!("{}/{}.pgn", self.base_url, round_id);
        debug!(url = %url, "connecting to pgn feed");

        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::Feed(format!(
                "feed returned HTTP {}",
                resp.status()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(doc) = take_document(&mut buf) {
                if !self.forward(&doc, filters, &tx).await {
                    return Ok(());
                }
            }
        }

        // Last document of the terminated stream.
        if !buf.trim().is_empty() {
            self.forward(&buf, filters, &tx).await;
        }
        Ok(())
    }

    /// Parse and forward one document; false once the consumer is gone.
    async fn forward(
        &self,
        doc: &str,
        filters: &[(String, String)],
        tx: &mpsc::Sender<GameSnapshot>,
    ) -> bool {
        let Some(snapshot) = parse_snapshot(doc) else {
            warn!("skipping unparseable feed document");
            return true;
        };
        if !snapshot.matches(filters) {
            return true;
        }
        tx.send(snapshot).await.is_ok()
    }
}

impl Default for FeedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_PGN: &str = r#"[Event "Tournament A"]
[White "Player One"]
[Black "Player Two"]
[Result "*"]

1. e4 {[%clk 0:09:58]} e5 {[%clk 0:09:55]} 2. Nf3 *"#;

    #[test]
    fn test_parse_snapshot_headers_and_moves() {
        let snapshot = parse_snapshot(SAMPLE_PGN).unwrap();
        assert_eq!(snapshot.header("White"), Some("Player One"));
        assert_eq!(snapshot.header("Missing"), None);

        assert_eq!(snapshot.moves.len(), 3);
        assert_eq!(snapshot.moves[0].san, "e4");
        assert_eq!(snapshot.moves[0].clock, Some(598));
        assert_eq!(snapshot.moves[1].clock, Some(595));
        assert_eq!(snapshot.moves[2].san, "Nf3");
        assert_eq!(snapshot.moves[2].clock, None);
    }

    #[test]
    fn test_parse_snapshot_ignores_variations() {
        let pgn = "[Event \"X\"]\n\n1. d4 (1. e4 e5) d5 *";
        let snapshot = parse_snapshot(pgn).unwrap();
        let sans: Vec<&str> = snapshot.moves.iter().map(|m| m.san.as_str()).collect();
        assert_eq!(sans, vec!["d4", "d5"]);
    }

    #[test]
    fn test_parse_snapshot_castling() {
        let pgn = "[Event \"X\"]\n\n1. e4 e5 2. Nf3 Nc6 3. Bc4 Nf6 4. O-O *";
        let snapshot = parse_snapshot(pgn).unwrap();
        assert_eq!(snapshot.moves.last().unwrap().san, "O-O");
    }

    #[test]
    fn test_parse_snapshot_rejects_non_pgn() {
        assert_eq!(parse_snapshot("\n\n"), None);
    }

    #[test]
    fn test_filters_match_headers() {
        let snapshot = parse_snapshot(SAMPLE_PGN).unwrap();
        let matching = vec![
            ("White".to_string(), "Player One".to_string()),
            ("Black".to_string(), "Player Two".to_string()),
        ];
        let mismatched = vec![("White".to_string(), "Somebody Else".to_string())];
        assert!(snapshot.matches(&matching));
        assert!(snapshot.matches(&[]));
        assert!(!snapshot.matches(&mismatched));
    }

    #[test]
    fn test_take_document_splits_on_terminator() {
        let mut buf = String::from(
            "[Event \"A\"]\n\n1. e4 *\n\n[Event \"B\"]\n\n1. d4 *\n\n[Event \"C\"]\n",
        );
        let first = take_document(&mut buf).unwrap();
        assert!(first.starts_with("[Event \"A\"]"));
        assert!(first.contains("1. e4"));

        let second = take_document(&mut buf).unwrap();
        assert!(second.starts_with("[Event \"B\"]"));

        // "C" is still mid-arrival, so it stays buffered.
        assert_eq!(take_document(&mut buf), None);
        assert!(buf.contains("[Event \"C\"]"));
    }

    #[test]
    fn test_take_document_releases_terminated_document_immediately() {
        // The freshest snapshot must come out as soon as its terminating
        // blank line arrives, not when the next snapshot starts.
        let mut buf = String::from("[Event \"A\"]\n\n1. e4 {[%clk 0:09:58]} *\n\n");
        let doc = take_document(&mut buf).unwrap();
        assert!(doc.contains("e4"));
        assert_eq!(take_document(&mut buf), None);
        assert!(buf.trim().is_empty());
    }

    #[test]
    fn test_take_document_waits_for_movetext_terminator() {
        let mut buf = String::from("[Event \"A\"]\n\n1. e4 ");
        assert_eq!(take_document(&mut buf), None);

        buf.push_str("e5 *\n\n");
        let doc = take_document(&mut buf).unwrap();
        assert!(doc.contains("e5"));
    }
}
