//! Newline-delimited JSON framing.
//!
//! Parsing is incremental: bytes are appended to a carry-over buffer, every
//! complete `\n`-terminated line is decoded, and whatever follows the last
//! newline is returned untouched for the next call. Working on bytes keeps
//! multi-byte UTF-8 sequences intact when a chunk boundary splits them.

use crate::RpcMessage;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed frame {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result of one incremental parse step.
#[derive(Debug)]
pub struct ParseOutput {
    /// One entry per complete line, in wire order. Malformed lines are reported
    /// in place and do not affect their neighbours.
    pub messages: Vec<Result<RpcMessage, FrameError>>,
    /// Bytes after the final newline, preserved verbatim.
    pub remaining: Vec<u8>,
}

/// Parse `chunk` appended to `buffer`.
pub fn parse_chunk(chunk: &[u8], buffer: &[u8]) -> ParseOutput {
    let mut pending = Vec::with_capacity(buffer.len() + chunk.len());
    pending.extend_from_slice(buffer);
    pending.extend_from_slice(chunk);

    let mut messages = Vec::new();
    let mut start = 0;
    while let Some(offset) = pending[start..].iter().position(|&b| b == b'\n') {
        let line = &pending[start..start + offset];
        start += offset + 1;
        if let Some(parsed) = decode_line(line) {
            messages.push(parsed);
        }
    }

    ParseOutput {
        messages,
        remaining: pending[start..].to_vec(),
    }
}

fn decode_line(line: &[u8]) -> Option<Result<RpcMessage, FrameError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => return Some(Err(e.into())),
    };
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(text).map_err(|source| FrameError::Json {
            line: text.chars().take(200).collect(),
            source,
        }),
    )
}

/// Serialize one message as a single line, including the trailing `\n`.
pub fn encode(msg: &RpcMessage) -> Result<String, FrameError> {
    let mut line = serde_json::to_string(msg).map_err(FrameError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Stateful wrapper around [`parse_chunk`] for read loops.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<RpcMessage, FrameError>> {
        let out = parse_chunk(chunk, &self.buffer);
        self.buffer = out.remaining;
        out.messages
    }

    /// Bytes received after the last complete line.
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.buffer
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{RpcError, methods},
        rstest::rstest,
        serde_json::json,
    };

    fn sample_stream() -> Vec<u8> {
        let msgs = [
            RpcMessage::request("1", methods::AGENT_RUN, json!({"prompt": "héllo wörld"})),
            RpcMessage::event(methods::AGENT_DELTA, json!({"text": "日本語"})),
            RpcMessage::response_ok("1", json!({"status": "success", "result": "done"})),
            RpcMessage::response_err("2", RpcError::new("TIMEOUT", "slow")),
            RpcMessage::event(methods::AGENT_READY, serde_json::Value::Null),
        ];
        msgs.iter()
            .map(|m| encode(m).unwrap())
            .collect::<String>()
            .into_bytes()
    }

    fn ok_messages(out: Vec<Result<RpcMessage, FrameError>>) -> Vec<RpcMessage> {
        out.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn every_single_split_point_matches_unsplit_parse() {
        let stream = sample_stream();
        let whole = ok_messages(parse_chunk(&stream, &[]).messages);
        assert_eq!(whole.len(), 5);

        for split in 0..=stream.len() {
            let first = parse_chunk(&stream[..split], &[]);
            let second = parse_chunk(&stream[split..], &first.remaining);
            let mut got = ok_messages(first.messages);
            got.extend(ok_messages(second.messages));
            assert_eq!(got, whole, "split at byte {split}");
            assert!(second.remaining.is_empty());
        }
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[case(64)]
    fn fixed_size_chunks_match_unsplit_parse(#[case] size: usize) {
        let stream = sample_stream();
        let whole = ok_messages(parse_chunk(&stream, &[]).messages);

        let mut decoder = FrameDecoder::new();
        let mut got = Vec::new();
        for chunk in stream.chunks(size) {
            got.extend(ok_messages(decoder.push(chunk)));
        }
        assert_eq!(got, whole);
        assert!(decoder.remaining().is_empty());
    }

    #[test]
    fn partial_tail_is_preserved_verbatim() {
        let out = parse_chunk(b"{\"type\":\"event\",\"method\":\"a\"}\n{\"type\":\"ev", b"");
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.remaining, b"{\"type\":\"ev");
    }

    #[test]
    fn malformed_line_does_not_poison_neighbours() {
        let raw = b"not json\n{\"type\":\"event\",\"method\":\"agent.delta\"}\n";
        let out = parse_chunk(raw, &[]);
        assert_eq!(out.messages.len(), 2);
        assert!(matches!(out.messages[0], Err(FrameError::Json { .. })));
        assert!(out.messages[1].is_ok());
    }

    #[test]
    fn blank_and_crlf_lines_are_tolerated() {
        let raw = b"\n\r\n{\"type\":\"event\",\"method\":\"x\"}\r\n";
        let out = parse_chunk(raw, &[]);
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn serialize_of_parse_is_identity() {
        let lines = [
            r#"{"type":"request","id":"a1","method":"tool.call","params":{"name":"list_tasks","args":{}}}"#,
            r#"{"type":"response","id":"a1","result":{"content":"ok"}}"#,
            r#"{"type":"response","id":"a2","error":{"code":"BUSY","message":"busy"}}"#,
            r#"{"type":"event","method":"agent.thinking","params":{"text":"hmm"}}"#,
        ];
        for line in lines {
            let framed = format!("{line}\n");
            let out = parse_chunk(framed.as_bytes(), &[]);
            let msg = out.messages.into_iter().next().unwrap().unwrap();
            assert_eq!(encode(&msg).unwrap(), framed);
        }
    }
}
