//! Server-sent event framing for the subscription stream.
//!
//! A frame is a block of `field: value` lines ended by a blank line:
//!
//! ```text
//! event: INIT
//! data: 42
//!
//! ```
//!
//! Comment lines (starting with `:`) carry keep-alives and are ignored.

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{NodeId, TableId};

/// An event on the subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseEvent {
    /// First event of every stream; carries the server's node id.
    Init(NodeId),
    /// The subscriber has new pending rows in this table.
    Invalidate(TableId),
}

impl SseEvent {
    /// Event type name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SseEvent::Init(_) => "INIT",
            SseEvent::Invalidate(_) => "INVALIDATE",
        }
    }

    /// Encodes the event as one frame.
    pub fn encode(&self) -> String {
        let data = match self {
            SseEvent::Init(node_id) => node_id.to_string(),
            SseEvent::Invalidate(table_id) => table_id.to_string(),
        };
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }

    fn parse(event: &str, data: &str) -> ProtocolResult<Self> {
        let data = data.trim();
        match event {
            "INIT" => data
                .parse()
                .map(SseEvent::Init)
                .map_err(|_| ProtocolError::invalid_frame(format!("bad node id {data:?}"))),
            "INVALIDATE" => data
                .parse()
                .map(SseEvent::Invalidate)
                .map_err(|_| ProtocolError::invalid_frame(format!("bad table id {data:?}"))),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

/// Incremental SSE decoder.
///
/// Feed it chunks as they arrive; chunk boundaries may fall anywhere,
/// including inside a line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every frame it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<ProtocolResult<SseEvent>> {
        self.buffer.push_str(chunk);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..end + 2).collect();
            if let Some(result) = Self::decode_frame(&frame) {
                events.push(result);
            }
        }
        events
    }

    /// Returns true if a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn decode_frame(frame: &str) -> Option<ProtocolResult<SseEvent>> {
        let mut event: Option<&str> = None;
        let mut data: Vec<&str> = Vec::new();
        for line in frame.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value),
                "data" => data.push(value),
                // id and retry are not used by this protocol
                _ => {}
            }
        }
        match event {
            Some(event) => Some(SseEvent::parse(event, &data.join("\n"))),
            None if data.is_empty() => None,
            None => Some(Err(ProtocolError::UnknownEvent("message".into()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_init_then_invalidate() {
        let mut decoder = SseDecoder::new();
        let stream = format!(
            "{}{}",
            SseEvent::Init(7).encode(),
            SseEvent::Invalidate(42).encode()
        );
        let events: Vec<SseEvent> = decoder
            .push(&stream)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(events, vec![SseEvent::Init(7), SseEvent::Invalidate(42)]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn ignores_keepalive_comments() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(": keep-alive\n\n").is_empty());
        let events = decoder.push("event: INVALIDATE\r\ndata: 3\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &SseEvent::Invalidate(3));
    }

    #[test]
    fn rejects_unknown_and_malformed_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push("event: HELLO\ndata: 1\n\nevent: INIT\ndata: abc\n\ndata: x\n\n");
        assert!(matches!(events[0], Err(ProtocolError::UnknownEvent(_))));
        assert!(matches!(events[1], Err(ProtocolError::InvalidFrame(_))));
        assert!(matches!(events[2], Err(ProtocolError::UnknownEvent(_))));
    }

    fn event_strategy() -> impl Strategy<Value = SseEvent> {
        prop_oneof![
            any::<i64>().prop_map(SseEvent::Init),
            any::<i32>().prop_map(SseEvent::Invalidate),
        ]
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_decoded_events(
            events in prop::collection::vec(event_strategy(), 1..8),
            split in any::<prop::sample::Index>(),
        ) {
            let stream: String = events.iter().map(SseEvent::encode).collect();
            let at = split.index(stream.len() + 1);
            let mut decoder = SseDecoder::new();
            let mut decoded = decoder.push(&stream[..at]);
            decoded.extend(decoder.push(&stream[at..]));
            let decoded: Vec<SseEvent> = decoded.into_iter().map(Result::unwrap).collect();
            prop_assert_eq!(decoded, events);
        }
    }
}
