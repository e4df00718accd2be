//! Incremental server-sent-event parser.
//!
//! Bytes are fed as they arrive from the HTTP body; complete lines are split out and the
//! payload of each `data:` line is returned. Comment lines (`:`) and other fields
//! (`event:`, `id:`, `retry:`) are ignored; frames here carry their type in the JSON.

use crate::error::ChannelError;

/// Longest line held while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
    max_line: usize,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
        }
    }

    /// Append a chunk and return the data payloads of every line it completed.
    ///
    /// Fails with `Malformed` when an unterminated line exceeds the limit; the partial
    /// line is discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, ChannelError> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(pos) = self.buffer[from..].iter().position(|&b| b == b'\n') {
            let end = from + pos;
            let line = String::from_utf8_lossy(&self.buffer[start..end]);
            if let Some(data) = data_payload(&line) {
                out.push(data.to_string());
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line {
            let held = self.buffer.len();
            self.buffer.clear();
            self.scanned = 0;
            return Err(ChannelError::Malformed(format!(
                "event stream line exceeds {} bytes ({} buffered)",
                self.max_line, held
            )));
        }
        Ok(out)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// The payload of a `data:` line, without the marker and one optional leading space.
pub fn data_payload(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let rest = line.strip_prefix("data:")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    if rest.trim().is_empty() {
        return None;
    }
    Some(rest)
}
