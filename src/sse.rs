//! Server-sent-event framing, both directions.
//!
//! Outbound frames wrap exactly one fragment: `data: {"content":"..."}\n\n`.
//! Inbound bytes are buffered until a full line is available so multi-byte
//! UTF-8 sequences split across network chunks are decoded intact.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
struct Frame<'a> {
    content: std::borrow::Cow<'a, str>,
}

pub fn encode_frame(fragment: &str) -> String {
    let body = serde_json::to_string(&Frame {
        content: fragment.into(),
    })
    .unwrap_or_else(|_| String::from("{\"content\":\"\"}"));
    format!("data: {}\n\n", body)
}

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// One parsed line of a provider's chat-completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Delta(String),
    Done,
}

/// Parses an OpenAI-style `data:` line. Comments, keep-alives, role-only
/// deltas and unparseable payloads yield `None`.
pub fn parse_upstream_line(line: &str) -> Option<UpstreamEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return Some(UpstreamEvent::Done);
    }
    let json: Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            warn!("Skipping unparseable upstream line: {}", e);
            return None;
        }
    };

    let choice = json.get("choices").and_then(|c| c.get(0))?;
    let content = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(|c| c.as_str())?;
    Some(UpstreamEvent::Delta(content.to_string()))
}

/// Client-side decoder for the relay's own frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineBuffer,
    malformed: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, get back the `content` of every complete frame. A
    /// malformed frame is logged and skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let lines = self.lines.push(bytes);
        lines.iter().filter_map(|line| self.decode_line(line)).collect()
    }

    pub fn finish(&mut self) -> Vec<String> {
        match self.lines.finish() {
            Some(line) => self.decode_line(&line).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    fn decode_line(&mut self, line: &str) -> Option<String> {
        let data = line.strip_prefix("data: ")?;
        match serde_json::from_str::<Frame<'_>>(data) {
            Ok(frame) => Some(frame.content.into_owned()),
            Err(e) => {
                warn!("Error parsing frame JSON: {}", e);
                self.malformed += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_escapes_json() {
        assert_eq!(
            encode_frame("**结构**：\"8.5\"\n"),
            "data: {\"content\":\"**结构**：\\\"8.5\\\"\\n\"}\n\n"
        );
    }

    #[test]
    fn line_buffer_keeps_split_utf8_intact() {
        let text = "data: 笔法\n".as_bytes();
        // Split inside the three-byte encoding of 笔.
        let (a, b) = text.split_at(7);
        let mut buf = LineBuffer::new();
        assert!(buf.push(a).is_empty());
        assert_eq!(buf.push(b), vec!["data: 笔法".to_string()]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn upstream_lines() {
        let delta = r#"data: {"choices":[{"delta":{"content":"好"}}]}"#;
        assert_eq!(parse_upstream_line(delta), Some(UpstreamEvent::Delta("好".into())));
        assert_eq!(parse_upstream_line("data: [DONE]"), Some(UpstreamEvent::Done));
        assert_eq!(parse_upstream_line(": keep-alive"), None);
        assert_eq!(
            parse_upstream_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(parse_upstream_line("data: {oops"), None);
    }

    #[test]
    fn decoder_skips_malformed_frames_and_continues() {
        let mut decoder = FrameDecoder::new();
        let mut wire = encode_frame("一");
        wire.push_str("data: {not json}\n\n");
        wire.push_str(&encode_frame("二"));

        let bytes = wire.as_bytes();
        let (head, tail) = bytes.split_at(5);
        let mut out = decoder.push(head);
        out.extend(decoder.push(tail));
        out.extend(decoder.finish());

        assert_eq!(out, vec!["一".to_string(), "二".to_string()]);
        assert_eq!(decoder.malformed(), 1);
    }
}
