//! Envelope framing over raw byte streams.
//!
//! A wire message is a JSON payload bracketed by two magic marker lines:
//!
//! ```text
//! [== "kiln server" ==[
//! { ... payload ... }
//! ]== "kiln server" ==]
//! ```
//!
//! The decoder consumes whole newline-terminated lines from an accumulating
//! inbound buffer. Bytes that do not yet form a complete line stay in the
//! buffer, so arbitrary fragmentation of the stream never loses or duplicates
//! input. An unterminated envelope is not an error, merely incomplete.

/// Marker line opening an envelope.
pub const START_MAGIC: &str = "[== \"kiln server\" ==[";

/// Marker line closing an envelope.
pub const END_MAGIC: &str = "]== \"kiln server\" ==]";

/// Converts a raw byte stream into complete message payloads and wraps
/// outgoing payloads in the wire envelope.
///
/// Implementations hold whatever capture state the wire format needs between
/// reads; the connection owns one instance per transport endpoint.
pub trait FramingStrategy: Send {
    /// Extracts the next complete message from `inbound`, consuming the bytes
    /// that formed it. Returns `None` when no complete message is available
    /// yet; callers should invoke this in a loop after each read, since one
    /// read may complete several envelopes.
    fn extract_message(&mut self, inbound: &mut Vec<u8>) -> Option<String>;

    /// Wraps an outgoing payload in the wire envelope.
    fn frame_outgoing(&self, payload: &str) -> Vec<u8>;

    /// Discards any partially captured message.
    fn reset(&mut self);
}

/// Framing strategy for the kiln server envelope.
///
/// Per line: a trailing carriage return is stripped, a [`START_MAGIC`] line
/// resets the capture (a later start always wins over an earlier unterminated
/// one), an [`END_MAGIC`] line finalises the capture into one message, and
/// anything else is appended to the capture. On finalise the capture's single
/// trailing newline is dropped, so `extract(frame(m)) == m` for any payload
/// that does not itself end in a newline.
#[derive(Debug, Default)]
pub struct EnvelopeFraming {
    capture: String,
}

impl EnvelopeFraming {
    /// Creates a framing strategy with an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FramingStrategy for EnvelopeFraming {
    fn extract_message(&mut self, inbound: &mut Vec<u8>) -> Option<String> {
        while let Some(newline) = inbound.iter().position(|byte| *byte == b'\n') {
            let mut line = String::from_utf8_lossy(&inbound[..newline]).into_owned();
            inbound.drain(..=newline);
            if line.ends_with('\r') {
                line.pop();
            }
            if line == START_MAGIC {
                self.capture.clear();
                continue;
            }
            if line == END_MAGIC {
                let mut message = std::mem::take(&mut self.capture);
                if message.ends_with('\n') {
                    message.pop();
                }
                return Some(message);
            }
            self.capture.push_str(&line);
            self.capture.push('\n');
        }
        None
    }

    fn frame_outgoing(&self, payload: &str) -> Vec<u8> {
        let mut frame =
            String::with_capacity(payload.len() + START_MAGIC.len() + END_MAGIC.len() + 4);
        frame.push('\n');
        frame.push_str(START_MAGIC);
        frame.push('\n');
        frame.push_str(payload);
        if !payload.ends_with('\n') {
            frame.push('\n');
        }
        frame.push_str(END_MAGIC);
        frame.push('\n');
        frame.into_bytes()
    }

    fn reset(&mut self) {
        self.capture.clear();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut framing = EnvelopeFraming::new();
        let mut buffer = input.to_vec();
        let mut messages = Vec::new();
        while let Some(message) = framing.extract_message(&mut buffer) {
            messages.push(message);
        }
        messages
    }

    #[rstest]
    #[case::object("{\"type\":\"handshake\"}")]
    #[case::empty("")]
    #[case::multiline("{\n  \"a\": 1\n}")]
    #[case::interior_blank_line("a\n\nb")]
    fn round_trips_payloads(#[case] payload: &str) {
        let framing = EnvelopeFraming::new();
        let wire = framing.frame_outgoing(payload);
        let messages = decode_all(&wire);
        assert_eq!(messages, vec![payload.to_owned()]);
    }

    #[test]
    fn tolerates_byte_at_a_time_delivery() {
        let framing = EnvelopeFraming::new();
        let wire = framing.frame_outgoing("{\"type\":\"reply\"}");

        let mut decoder = EnvelopeFraming::new();
        let mut buffer = Vec::new();
        let mut messages = Vec::new();
        for byte in wire {
            buffer.push(byte);
            while let Some(message) = decoder.extract_message(&mut buffer) {
                messages.push(message);
            }
        }
        assert_eq!(messages, vec!["{\"type\":\"reply\"}".to_owned()]);
    }

    #[test]
    fn later_start_discards_unfinished_capture() {
        let input = format!("{START_MAGIC}\ngarbage\n{START_MAGIC}\nreal\n{END_MAGIC}\n");
        assert_eq!(decode_all(input.as_bytes()), vec!["real".to_owned()]);
    }

    #[test]
    fn strips_carriage_returns_from_lines() {
        let input = format!("{START_MAGIC}\r\n{{\"a\":1}}\r\n{END_MAGIC}\r\n");
        assert_eq!(decode_all(input.as_bytes()), vec!["{\"a\":1}".to_owned()]);
    }

    #[test]
    fn emits_multiple_messages_from_one_buffer() {
        let framing = EnvelopeFraming::new();
        let mut wire = framing.frame_outgoing("first");
        wire.extend_from_slice(&framing.frame_outgoing("second"));
        assert_eq!(
            decode_all(&wire),
            vec!["first".to_owned(), "second".to_owned()]
        );
    }

    #[test]
    fn unterminated_envelope_is_not_emitted() {
        let input = format!("{START_MAGIC}\npartial payload\n");
        assert_eq!(decode_all(input.as_bytes()), Vec::<String>::new());
    }

    #[test]
    fn preserves_unconsumed_tail_between_reads() {
        let mut framing = EnvelopeFraming::new();
        let mut buffer = format!("{START_MAGIC}\npay").into_bytes();
        assert!(framing.extract_message(&mut buffer).is_none());
        assert_eq!(buffer, b"pay");

        buffer.extend_from_slice(format!("load\n{END_MAGIC}\n").as_bytes());
        assert_eq!(
            framing.extract_message(&mut buffer),
            Some("payload".to_owned())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn reset_discards_partial_capture() {
        let mut framing = EnvelopeFraming::new();
        let mut buffer = format!("{START_MAGIC}\nstale\n").into_bytes();
        assert!(framing.extract_message(&mut buffer).is_none());
        framing.reset();

        buffer.extend_from_slice(format!("fresh\n{END_MAGIC}\n").as_bytes());
        assert_eq!(
            framing.extract_message(&mut buffer),
            Some("fresh".to_owned())
        );
    }
}
