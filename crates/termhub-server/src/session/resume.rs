//! Resume-token discovery in session output.
//!
//! Agent CLIs print a conversation id (a UUID) early in their output. The
//! first one seen is captured so a later spawn can pass it back to resume the
//! same conversation.

use regex::Regex;
use std::sync::LazyLock;

/// Length of a hyphenated UUID. The carry-over tail is one byte shorter so a
/// token already fully inside the previous window is never matched twice.
const TOKEN_LEN: usize = 36;

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("invalid resume token pattern")
});

/// Scans successive output chunks for the first UUID-shaped token.
///
/// A short tail of each chunk is carried into the next scan so a token split
/// across two PTY reads is still found.
#[derive(Debug, Default)]
pub struct ResumeTokenScanner {
    tail: Vec<u8>,
    found: bool,
}

impl ResumeTokenScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a token has already been captured.
    pub fn is_done(&self) -> bool {
        self.found
    }

    /// Scan one chunk. Returns the token the first time one is seen, and
    /// `None` forever after.
    pub fn scan(&mut self, chunk: &[u8]) -> Option<String> {
        if self.found {
            return None;
        }

        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);

        let text = String::from_utf8_lossy(&window);
        if let Some(m) = TOKEN_PATTERN.find(&text) {
            self.found = true;
            return Some(m.as_str().to_string());
        }

        let keep = window.len().min(TOKEN_LEN - 1);
        self.tail = window[window.len() - keep..].to_vec();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: &str = "3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b";
    const SECOND: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";

    #[test]
    fn finds_token_in_one_chunk() {
        let mut scanner = ResumeTokenScanner::new();
        let line = format!("\x1b[2mSession: {FIRST}\x1b[0m\r\n");
        assert_eq!(scanner.scan(line.as_bytes()).as_deref(), Some(FIRST));
        assert!(scanner.is_done());
    }

    #[test]
    fn only_first_of_two_tokens_is_reported() {
        let mut scanner = ResumeTokenScanner::new();
        let a = format!("resume with {FIRST}\n");
        let b = format!("other id {SECOND}\n");
        assert_eq!(scanner.scan(a.as_bytes()).as_deref(), Some(FIRST));
        assert_eq!(scanner.scan(b.as_bytes()), None);
    }

    #[test]
    fn token_split_across_chunks() {
        let mut scanner = ResumeTokenScanner::new();
        let (head, rest) = FIRST.split_at(15);
        assert_eq!(scanner.scan(format!("id={head}").as_bytes()), None);
        assert_eq!(scanner.scan(format!("{rest} ok").as_bytes()).as_deref(), Some(FIRST));
    }

    #[test]
    fn token_is_reported_as_printed() {
        let mut scanner = ResumeTokenScanner::new();
        let upper = FIRST.to_ascii_uppercase();
        assert_eq!(scanner.scan(upper.as_bytes()), Some(upper));

        let mut scanner = ResumeTokenScanner::new();
        let mixed = "3F2b8C1e-9A4d-4E6f-8B7a-1C2d3E4f5A6b";
        assert_eq!(scanner.scan(format!("id {mixed}\n").as_bytes()).as_deref(), Some(mixed));
    }

    #[test]
    fn plain_output_finds_nothing() {
        let mut scanner = ResumeTokenScanner::new();
        for _ in 0..10 {
            assert_eq!(scanner.scan(b"$ ls -la\r\ntotal 0\r\n"), None);
        }
        assert!(!scanner.is_done());
    }
}
