//! Streaming codecs for the two envelope framings.
//!
//! NDJSON framing carries one compact JSON envelope per `\n`-terminated
//! line; SSE framing carries one JSON envelope per event in the `data:`
//! field, with multi-line data joined by `\n` and a blank line ending the
//! event. Both decoders accept arbitrary chunk boundaries and scope parse
//! failures to the offending line or event so the stream keeps flowing.

use crate::error::{Error, Result};
use crate::protocol::envelope::Envelope;

/// Encode an envelope as one NDJSON line, trailing newline included.
pub fn encode_line(envelope: &Envelope) -> Result<String> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Encode an envelope as one SSE `data:` block, blank-line terminated.
pub fn encode_sse_block(envelope: &Envelope) -> Result<String> {
    Ok(format!("data: {}\n\n", serde_json::to_string(envelope)?))
}

/// Decode a single NDJSON line into an envelope, validating its shape.
pub fn decode_line(line: &str) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("invalid envelope line: {}", e)))?;
    envelope.kind()?;
    Ok(envelope)
}

/// Streaming NDJSON decoder.
///
/// Buffers partial chunks and emits one decode outcome per completed line.
/// A line boundary falling mid-chunk is handled by retaining the remainder;
/// a line that fails to parse yields an `Err` item and the decoder keeps
/// going.
#[derive(Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope>> {
        self.buffer.extend_from_slice(chunk);
        self.drain(false)
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Vec<Result<Envelope>> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Vec<Result<Envelope>> {
        let mut out = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            if let Some(item) = decode_bytes(&self.buffer[search_index..line_end]) {
                out.push(item);
            }
            search_index = newline_index + 1;
        }

        if flush {
            if let Some(item) = decode_bytes(&self.buffer[search_index..]) {
                out.push(item);
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        out
    }
}

fn decode_bytes(bytes: &[u8]) -> Option<Result<Envelope>> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(Error::Protocol(format!("non-UTF8 line: {}", e)))),
    };
    if text.is_empty() {
        return None;
    }
    Some(decode_line(text))
}

/// Streaming SSE decoder.
///
/// Assembles events from `data:` lines; a blank line terminates the event
/// and its joined payload is parsed as one envelope. Non-data fields
/// (`event:`, `id:`, comments) are ignored.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            let line = String::from_utf8_lossy(&self.buffer[search_index..line_end]).into_owned();
            if let Some(item) = self.accept_line(&line) {
                out.push(item);
            }
            search_index = newline_index + 1;
        }

        if search_index > 0 {
            self.buffer.drain(..search_index);
        }
        out
    }

    /// Flush a final event left open when the stream ends.
    pub fn finish(&mut self) -> Vec<Result<Envelope>> {
        self.buffer.clear();
        self.terminate_event().into_iter().collect()
    }

    fn accept_line(&mut self, line: &str) -> Option<Result<Envelope>> {
        if line.is_empty() {
            return self.terminate_event();
        }
        if let Some(payload) = line.strip_prefix("data:") {
            self.data_lines
                .push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
        }
        // event:, id:, retry:, and comment lines carry no envelope payload.
        None
    }

    fn terminate_event(&mut self) -> Option<Result<Envelope>> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        if payload.trim().is_empty() {
            return None;
        }
        Some(decode_line(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::RequestId;
    use serde_json::json;

    fn ok_envelopes(items: Vec<Result<Envelope>>) -> Vec<Envelope> {
        items.into_iter().map(|i| i.unwrap()).collect()
    }

    #[test]
    fn ndjson_round_trip() {
        let env = Envelope::request(1, "tools/call", Some(json!({"text": "hi\nthere"})));
        let line = encode_line(&env).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let mut decoder = NdjsonDecoder::new();
        let decoded = ok_envelopes(decoder.push(line.as_bytes()));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn ndjson_handles_chunk_boundary_mid_line() {
        let env = Envelope::response(RequestId::Number(4), json!({"value": 42}));
        let line = encode_line(&env).unwrap();
        let (a, b) = line.as_bytes().split_at(line.len() / 2);

        let mut decoder = NdjsonDecoder::new();
        assert!(decoder.push(a).is_empty());
        let decoded = ok_envelopes(decoder.push(b));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn ndjson_multiple_lines_in_one_chunk() {
        let a = Envelope::request(1, "ping", None);
        let b = Envelope::request(2, "ping", None);
        let chunk = format!(
            "{}{}",
            encode_line(&a).unwrap(),
            encode_line(&b).unwrap()
        );

        let mut decoder = NdjsonDecoder::new();
        let decoded = ok_envelopes(decoder.push(chunk.as_bytes()));
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn ndjson_bad_line_is_scoped() {
        let good = Envelope::request(9, "ping", None);
        let chunk = format!("this is not json\n{}", encode_line(&good).unwrap());

        let mut decoder = NdjsonDecoder::new();
        let items = decoder.push(chunk.as_bytes());
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert_eq!(items[1].as_ref().unwrap(), &good);
    }

    #[test]
    fn ndjson_skips_blank_lines_and_crlf() {
        let env = Envelope::request(1, "ping", None);
        let chunk = format!("\r\n{}\r\n\n", serde_json::to_string(&env).unwrap());

        let mut decoder = NdjsonDecoder::new();
        let decoded = ok_envelopes(decoder.push(chunk.as_bytes()));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn ndjson_finish_flushes_unterminated_line() {
        let env = Envelope::request(2, "ping", None);
        let mut decoder = NdjsonDecoder::new();
        assert!(decoder
            .push(serde_json::to_string(&env).unwrap().as_bytes())
            .is_empty());
        let decoded = ok_envelopes(decoder.finish());
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn sse_round_trip() {
        let env = Envelope::response(RequestId::Number(1), json!({"tools": []}));
        let block = encode_sse_block(&env).unwrap();
        assert!(block.starts_with("data: "));
        assert!(block.ends_with("\n\n"));

        let mut decoder = SseDecoder::new();
        let decoded = ok_envelopes(decoder.push(block.as_bytes()));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn sse_joins_multi_line_data() {
        // Two data lines belong to one event; payloads join with \n, which
        // inside a JSON string literal is only legal when split between
        // data fields by the SSE framing.
        let mut decoder = SseDecoder::new();
        let items = decoder.push(b"data: {\"id\":1,\ndata: \"result\":{}}\n\n");
        let decoded = ok_envelopes(items);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, Some(RequestId::Number(1)));
    }

    #[test]
    fn sse_ignores_non_data_fields() {
        let env = Envelope::notification("notifications/progress", Some(json!({"progress": 1})));
        let stream = format!(
            ": keep-alive\nevent: message\nid: 7\n{}",
            encode_sse_block(&env).unwrap()
        );

        let mut decoder = SseDecoder::new();
        let decoded = ok_envelopes(decoder.push(stream.as_bytes()));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn sse_event_split_across_chunks() {
        let env = Envelope::response(RequestId::Number(3), json!({"ok": true}));
        let block = encode_sse_block(&env).unwrap();
        let (a, b) = block.as_bytes().split_at(7);

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(a).is_empty());
        let decoded = ok_envelopes(decoder.push(b));
        assert_eq!(decoded, vec![env]);
    }

    #[test]
    fn sse_finish_flushes_open_event() {
        let env = Envelope::response(RequestId::Number(5), json!({}));
        let mut decoder = SseDecoder::new();
        let block = format!("data: {}\n", serde_json::to_string(&env).unwrap());
        assert!(decoder.push(block.as_bytes()).is_empty());
        let decoded = ok_envelopes(decoder.finish());
        assert_eq!(decoded, vec![env]);
    }
}
