//! Incremental decoder for `text/event-stream` bodies

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    /// `event:` field, `message` when absent
    pub event: String,
    /// `data:` lines joined with `\n`
    pub data: String,
    /// `id:` field
    pub id: Option<String>,
}

/// Feeds arbitrary chunks in, gets complete events out
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Tail of the last byte chunk that ends inside a UTF-8 sequence
    carry: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    /// Empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completed
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = line.split_once(':').unwrap_or((line, ""));
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                _ => {}
            }
        }
        events
    }

    /// Append raw body bytes. A multi-byte character split across chunks
    /// is held back until its remaining bytes arrive.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.carry.extend_from_slice(chunk);
        let mut text = String::new();
        let mut rest: &[u8] = &self.carry;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Checked by from_utf8 above
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                    }
                }
            }
        }
        self.carry = rest.to_vec();
        self.push(&text)
    }

    /// Flush a trailing event that was not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.carry.is_empty() {
            let carry = std::mem::take(&mut self.carry);
            self.buffer.push_str(&String::from_utf8_lossy(&carry));
        }
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let mut events = self.push(&rest);
            events.extend(self.push("\n"));
            if let Some(event) = events.pop() {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn events_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push("event: endpoint\nda").is_empty());
        let events = d.push("ta: /messages?session_id=abc\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "endpoint".into(),
                data: "/messages?session_id=abc".into(),
                id: None,
            }]
        );
    }

    #[test]
    fn default_event_name_and_multiline_data() {
        let mut d = SseDecoder::new();
        let events = d.push(": keep-alive\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "{\"a\":\n1}");
    }

    #[test]
    fn characters_split_across_byte_chunks() {
        let body = "data: caf\u{e9} \u{1f600}\n\n".as_bytes();
        // Split inside the two-byte é and again inside the four-byte emoji
        let cut_a = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let cut_b = body.iter().position(|&b| b == 0xF0).unwrap() + 2;

        let mut d = SseDecoder::new();
        assert!(d.push_bytes(&body[..cut_a]).is_empty());
        assert!(d.push_bytes(&body[cut_a..cut_b]).is_empty());
        let events = d.push_bytes(&body[cut_b..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "caf\u{e9} \u{1f600}");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut d = SseDecoder::new();
        let events = d.push_bytes(b"data: a\xFFb\n\n");
        assert_eq!(events[0].data, "a\u{fffd}b");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut d = SseDecoder::new();
        assert!(d.push("data: last").is_empty());
        assert_eq!(d.finish().map(|e| e.data), Some("last".to_string()));
        assert_eq!(d.finish(), None);
    }
}
