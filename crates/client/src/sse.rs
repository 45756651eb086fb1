/// Incremental decoder for the `/chat/stream` response body.
///
/// Records are newline-delimited `data: <json>` lines. Everything else (blank
/// separator lines, comments, other SSE fields) is skipped. Network chunks
/// never line up with records, so a partial trailing line is carried over
/// to the next `feed`.
use serde::Deserialize;
use shared::error::StreamError;
use shared::protocol::{SourceDescriptor, StreamEvent};

const DATA_PREFIX: &[u8] = b"data:";

/// The JSON payload of one record, before it is checked against its kind.
#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sources: Option<Vec<SourceDescriptor>>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Pull-based decoder: bytes in, complete events out.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a `done`/`error` record or a decode error has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes from the response. Returns every event completed by
    /// this chunk, in order. Input after a terminal event is ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;
        while let Some(offset) = self.buffer[search..].iter().position(|b| *b == b'\n') {
            let end = search + offset;
            let parsed = parse_line(&self.buffer[start..end]);
            start = end + 1;
            search = start;
            match parsed {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        self.finished = true;
                        self.buffer.clear();
                        self.scanned = 0;
                        return Ok(events);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    self.buffer.clear();
                    self.scanned = 0;
                    return Err(e);
                }
            }
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        Ok(events)
    }

    /// End of input: decode a final line that had no trailing newline.
    pub fn finish(&mut self) -> Result<Option<StreamEvent>, StreamError> {
        if self.finished {
            return Ok(None);
        }
        self.finished = true;
        self.scanned = 0;
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<StreamEvent>, StreamError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);
    let text = std::str::from_utf8(payload)
        .map_err(|e| StreamError::Decode(format!("record is not UTF-8: {}", e)))?;
    parse_record(text)
}

fn parse_record(text: &str) -> Result<Option<StreamEvent>, StreamError> {
    let record: WireRecord = serde_json::from_str(text)
        .map_err(|e| StreamError::Decode(format!("{} in {}", e, preview(text))))?;

    let event = match record.kind.as_str() {
        "sources" => StreamEvent::Sources(record.sources.ok_or_else(|| missing("sources"))?),
        "token" => StreamEvent::Token(record.content.ok_or_else(|| missing("content"))?),
        "done" => StreamEvent::Done,
        "error" => StreamEvent::Error(
            record
                .error
                .unwrap_or_else(|| "The service reported an error".to_string()),
        ),
        other => {
            tracing::warn!("Skipping stream record of unknown type {:?}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

fn missing(field: &str) -> StreamError {
    StreamError::Decode(format!("record is missing `{}`", field))
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut cut = MAX;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = concat!(
        "data: {\"type\":\"sources\",\"sources\":[{\"source\":\"a.pdf\",\"path\":\"/x/a.pdf\"}]}\n",
        "\n",
        "data: {\"type\":\"token\",\"content\":\"Hi\"}\n",
        "\n",
        "data: {\"type\":\"token\",\"content\":\" th\u{00e9}re \u{1f600}\"}\n",
        "\n",
        "data: {\"type\":\"done\"}\n",
        "\n",
    );

    fn decode_chunks(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut decoder = StreamDecoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(decoder.feed(chunk).unwrap());
        }
        out.extend(decoder.finish().unwrap());
        out
    }

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Sources(vec![SourceDescriptor {
                name: "a.pdf".into(),
                locator: "/x/a.pdf".into(),
                page: None,
            }]),
            StreamEvent::Token("Hi".into()),
            StreamEvent::Token(" th\u{00e9}re \u{1f600}".into()),
            StreamEvent::Done,
        ]
    }

    #[test]
    fn whole_body_in_one_chunk() {
        assert_eq!(decode_chunks(&[SCENARIO.as_bytes()]), expected());
    }

    #[test]
    fn every_single_split_point_gives_the_same_events() {
        let bytes = SCENARIO.as_bytes();
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_chunks(&[a, b]), expected(), "split at {}", split);
        }
    }

    #[test]
    fn single_byte_chunks_split_multibyte_characters() {
        let bytes = SCENARIO.as_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_chunks(&chunks), expected());
    }

    #[test]
    fn long_record_in_single_bytes_is_scanned_once() {
        let text = "x".repeat(20_000);
        let body = format!(
            "data: {{\"type\":\"token\",\"content\":\"{}\"}}\ndata: {{\"type\":\"done\"}}\n",
            text
        );
        let mut decoder = StreamDecoder::new();
        let mut events = Vec::new();
        for byte in body.as_bytes().chunks(1) {
            events.extend(decoder.feed(byte).unwrap());
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }
        assert_eq!(events, vec![StreamEvent::Token(text), StreamEvent::Done]);
        assert!(decoder.is_finished());
    }

    #[test]
    fn irregular_chunkings_are_equivalent() {
        let bytes = SCENARIO.as_bytes();
        // Deterministic pseudo-random chunk sizes.
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..200 {
            let mut chunks = Vec::new();
            let mut pos = 0;
            while pos < bytes.len() {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let len = 1 + (seed >> 16) as usize % 17;
                let end = (pos + len).min(bytes.len());
                chunks.push(&bytes[pos..end]);
                pos = end;
            }
            assert_eq!(decode_chunks(&chunks), expected());
        }
    }

    #[test]
    fn crlf_and_unspaced_marker_are_accepted() {
        let events = decode_chunks(&[&b"data:{\"type\":\"token\",\"content\":\"x\"}\r\n\r\n"[..]]);
        assert_eq!(events, vec![StreamEvent::Token("x".into())]);
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let events = decode_chunks(&[&b": keep-alive\nevent: message\nid: 7\n\ndata: {\"type\":\"done\"}\n"[..]]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn malformed_json_is_fatal() {
        let mut decoder = StreamDecoder::new();
        let ok = decoder
            .feed(b"data: {\"type\":\"token\",\"content\":\"a\"}\n")
            .unwrap();
        assert_eq!(ok.len(), 1);

        let err = decoder.feed(b"data: {\"type\":\"tok\n").unwrap_err();
        assert!(matches!(err, StreamError::Decode(_)));
        assert!(decoder.is_finished());
        assert!(decoder
            .feed(b"data: {\"type\":\"done\"}\n")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn token_without_content_is_fatal() {
        let mut decoder = StreamDecoder::new();
        let err = decoder.feed(b"data: {\"type\":\"token\"}\n").unwrap_err();
        assert_eq!(err, StreamError::Decode("record is missing `content`".into()));
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let events = decode_chunks(&[&b"data: {\"type\":\"progress\",\"pct\":10}\ndata: {\"type\":\"done\"}\n"[..]]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn nothing_after_terminal_event_is_decoded() {
        let events = decode_chunks(&[&b"data: {\"type\":\"error\",\"error\":\"boom\"}\ndata: {\"type\":\"token\",\"content\":\"late\"}\n"[..]]);
        assert_eq!(events, vec![StreamEvent::Error("boom".into())]);
    }

    #[test]
    fn trailing_record_without_newline_is_decoded_at_eof() {
        let events = decode_chunks(&[&b"data: {\"type\":\"token\",\"content\":\"end\"}"[..]]);
        assert_eq!(events, vec![StreamEvent::Token("end".into())]);
    }

    #[test]
    fn eof_without_done_is_not_an_error() {
        let mut decoder = StreamDecoder::new();
        decoder
            .feed(b"data: {\"type\":\"sources\",\"sources\":[]}\n\n")
            .unwrap();
        assert_eq!(decoder.finish().unwrap(), None);
    }
}
