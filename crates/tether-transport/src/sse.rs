//! Incremental Server-Sent Events decoding.
//!
//! Streamable-HTTP servers may answer a POST with `text/event-stream`.
//! [`SseDecoder`] buffers raw chunks, splits on newlines, and yields the
//! joined `data:` payload of each complete event. Comment lines, `event:`,
//! `id:`, and `retry:` fields are ignored.

use bytes::BytesMut;

/// Line-buffering SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    data: Vec<String>,
}

impl SseDecoder {
    /// Empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            data: Vec::new(),
        }
    }

    /// Feed a chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline_pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            // invalid UTF-8 lines are dropped
            let Ok(line) = std::str::from_utf8(&line) else {
                continue;
            };
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = self.buffer.split();
            if let Ok(line) = std::str::from_utf8(&rest) {
                let _ = self.feed_line(line.trim_end_matches('\r'));
            }
        }
        self.take_event()
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_event();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let event = self.data.join("\n");
        self.data.clear();
        Some(event)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
