//! Server-sent-event reassembly over raw byte chunks.
//!
//! Upstream sockets deliver bytes with no alignment to line or event
//! boundaries. The reassembler keeps a single growing buffer, extracts
//! complete lines, and groups them into frames at each blank line. A chunk
//! boundary falling mid-line, mid-frame, or mid-UTF-8-codepoint never loses
//! or duplicates a byte: only complete `\n`-terminated lines leave the
//! buffer, and `\n` cannot occur inside a multi-byte codepoint.

use bytes::BytesMut;
use serde_json::Value;

/// One complete server-sent event.
///
/// `data` is the joined payload of the frame's `data:` lines, preserved
/// verbatim. Whether it parses as JSON is the consumer's concern: frames
/// this layer does not understand still pass through intact.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
}

impl SseFrame {
    /// The literal stream-termination sentinel.
    pub fn is_done(&self) -> bool {
        self.data.as_deref() == Some("[DONE]")
    }

    /// Parse the `data:` payload as JSON, unless it is the sentinel.
    pub fn data_json(&self) -> Option<Value> {
        if self.is_done() {
            return None;
        }
        self.data
            .as_deref()
            .and_then(|d| serde_json::from_str(d).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none()
    }
}

#[derive(Default)]
pub struct SseReassembler {
    buffer: BytesMut,
    pending_event: Option<String>,
    pending_data: Vec<String>,
    done_seen: bool,
}

impl SseReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame completed by it, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.done_seen {
            return frames;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes = self.buffer.split_to(pos + 1);
            let line = match std::str::from_utf8(&line_bytes[..pos]) {
                Ok(s) => s.trim_end_matches('\r'),
                Err(_) => {
                    log::warn!("skipping non-UTF-8 SSE line ({} bytes)", pos);
                    continue;
                }
            };

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    let done = frame.is_done();
                    frames.push(frame);
                    if done {
                        self.done_seen = true;
                        break;
                    }
                }
            } else {
                self.accept_line(line);
            }
        }
        frames
    }

    /// Flush a trailing frame when the stream ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.done_seen {
            return None;
        }
        // A partial trailing line still counts toward the final frame.
        if !self.buffer.is_empty() {
            let tail = self.buffer.split();
            match std::str::from_utf8(&tail) {
                Ok(s) => {
                    let line = s.trim_end_matches('\r');
                    if !line.is_empty() {
                        self.accept_line(line);
                    }
                }
                Err(_) => log::warn!("discarding non-UTF-8 trailing bytes at stream end"),
            }
        }
        self.take_frame()
    }

    fn accept_line(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("data:") {
            self.pending_data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.pending_event = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if line.starts_with(':') {
            // SSE comment (keep-alive), ignored by convention
        } else {
            // Unknown field in an otherwise well-formed stream: skip the
            // line, not the stream.
            log::debug!("skipping unrecognized SSE line: {}", line);
        }
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        let frame = SseFrame {
            event: self.pending_event.take(),
            data: if self.pending_data.is_empty() {
                None
            } else {
                Some(self.pending_data.drain(..).collect::<Vec<_>>().join("\n"))
            },
        };
        if frame.is_empty() {
            None
        } else {
            Some(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_frames(reassembler: &mut SseReassembler, chunks: &[&[u8]]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(reassembler.push_chunk(chunk));
        }
        frames.extend(reassembler.finish());
        frames
    }

    #[test]
    fn test_single_complete_frame() {
        let mut r = SseReassembler::new();
        let frames = r.push_chunk(b"data: {\"type\":\"start\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some("{\"type\":\"start\"}"));
        assert!(frames[0].data_json().is_some());
    }

    #[test]
    fn test_three_chunk_scenario_reassembles_exactly_three_frames() {
        // Chunk boundaries fall mid-frame and mid-JSON; the frame sequence
        // must be identical to the unsplit stream.
        let chunks: [&[u8]; 3] = [
            b"data: {\"type\":\"start\"}\n\n",
            b"data: {\"type\":\"delta\",\"text\":\"Hel",
            b"lo\"}\n\ndata: {\"type\":\"stop\"}\n\n",
        ];
        let mut r = SseReassembler::new();
        let frames = collect_frames(&mut r, &chunks);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].data_json().unwrap()["text"], "Hello");
        assert_eq!(frames[2].data_json().unwrap()["type"], "stop");
    }

    #[test]
    fn test_all_split_points_yield_identical_frames() {
        let stream: &[u8] = b"event: message_start\ndata: {\"id\":\"msg_1\"}\n\nevent: content_block_delta\ndata: {\"text\":\"caf\xc3\xa9\"}\n\ndata: [DONE]\n\n";

        let mut reference = SseReassembler::new();
        let expected = collect_frames(&mut reference, &[stream]);
        assert_eq!(expected.len(), 3);

        // Every possible two-way split, including mid-line and mid-codepoint
        // (the é above spans two bytes).
        for split in 1..stream.len() {
            let mut r = SseReassembler::new();
            let frames = collect_frames(&mut r, &[&stream[..split], &stream[split..]]);
            assert_eq!(frames, expected, "split at byte {} diverged", split);
        }

        // And byte-at-a-time delivery.
        let mut r = SseReassembler::new();
        let singles: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(collect_frames(&mut r, &singles), expected);
    }

    #[test]
    fn test_done_sentinel_terminates_stream() {
        let mut r = SseReassembler::new();
        let frames = r.push_chunk(b"data: [DONE]\n\ndata: {\"late\":true}\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
        assert!(frames[0].data_json().is_none());
        // Nothing after the sentinel is yielded.
        assert!(r.push_chunk(b"data: {\"more\":true}\n\n").is_empty());
    }

    #[test]
    fn test_non_json_payload_passes_through_raw() {
        let mut r = SseReassembler::new();
        let frames = r.push_chunk(b"data: not json at all\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_deref(), Some("not json at all"));
        assert!(frames[0].data_json().is_none());
    }

    #[test]
    fn test_unrecognized_lines_skipped_without_aborting() {
        let mut r = SseReassembler::new();
        let frames =
            r.push_chunk(b"id: 7\n: keep-alive comment\ndata: {\"ok\":true}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data_json().unwrap()["ok"], true);
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut r = SseReassembler::new();
        let frames = r.push_chunk(b"event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
    }

    #[test]
    fn test_multiline_data_joined_with_newline() {
        let mut r = SseReassembler::new();
        let frames = r.push_chunk(b"data: line one\ndata: line two\n\n");
        assert_eq!(frames[0].data.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_finish_flushes_unterminated_trailing_frame() {
        let mut r = SseReassembler::new();
        assert!(r.push_chunk(b"data: {\"tail\":true}").is_empty());
        let tail = r.finish().unwrap();
        assert_eq!(tail.data_json().unwrap()["tail"], true);
    }
}
