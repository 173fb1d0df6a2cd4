//! Chart Protocol Codec
//!
//! Encodes outbound calls and splits inbound text into frames.
//!
//! # Wire Format
//!
//! Every message is a frame `~m~<len>~m~<payload>`, where `<len>` is the
//! decimal byte length of `<payload>`. Calls carry compact JSON
//! `{"m":"<function>","p":[...]}`; heartbeats carry `~h~<n>` and must be
//! echoed back verbatim. One WebSocket message may hold several frames, and
//! a frame may be split across messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker surrounding the frame length.
pub const FRAME_MARKER: &str = "~m~";

/// Prefix of heartbeat payloads.
pub const HEARTBEAT_PREFIX: &str = "~h~";

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame length header was not a valid byte count.
    #[error("invalid frame length: {0}")]
    InvalidLength(String),

    /// Text did not start with a frame marker.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

#[derive(Serialize)]
struct Envelope<'a> {
    m: &'a str,
    p: &'a [Value],
}

/// Encode a call as a framed compact-JSON message.
///
/// # Errors
///
/// Returns an error if a parameter cannot be serialized.
pub fn encode_message(function: &str, params: &[Value]) -> Result<String, CodecError> {
    let payload = serde_json::to_string(&Envelope {
        m: function,
        p: params,
    })?;
    Ok(frame(&payload))
}

/// Prefix `payload` with its length header.
#[must_use]
pub fn frame(payload: &str) -> String {
    format!("{FRAME_MARKER}{}{FRAME_MARKER}{payload}", payload.len())
}

// =============================================================================
// Decoding
// =============================================================================

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keep-alive, e.g. `~h~3`.
    Heartbeat(String),
    /// Any other payload, usually a JSON object.
    Payload(String),
}

impl Frame {
    /// The framed reply a heartbeat expects, `None` for payloads.
    #[must_use]
    pub fn echo(&self) -> Option<String> {
        match self {
            Self::Heartbeat(beat) => Some(frame(beat)),
            Self::Payload(_) => None,
        }
    }
}

/// Incremental frame splitter.
///
/// Feed raw text with [`push`](Self::push) and drain complete frames with
/// [`next_frame`](Self::next_frame). A trailing partial frame stays buffered
/// until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Append received text.
    pub fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    /// Bytes waiting for the rest of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer is empty or holds only a partial
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns an error on text that cannot start a frame. The offending
    /// text up to the next frame marker is discarded so decoding can resume.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let Some(rest) = self.buffer.strip_prefix(FRAME_MARKER) else {
            if FRAME_MARKER.starts_with(self.buffer.as_str()) {
                return Ok(None);
            }
            return Err(self.discard_until_marker(0));
        };

        let Some(header_len) = rest.find(FRAME_MARKER) else {
            // Length digits, possibly followed by part of the closing marker.
            let after_digits = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            if FRAME_MARKER.starts_with(after_digits) {
                return Ok(None);
            }
            return Err(self.discard_until_marker(FRAME_MARKER.len()));
        };

        let header = &rest[..header_len];
        let Ok(len) = header.parse::<usize>() else {
            let err = CodecError::InvalidLength(header.to_string());
            self.buffer.drain(..FRAME_MARKER.len() * 2 + header_len);
            return Err(err);
        };

        let start = FRAME_MARKER.len() * 2 + header_len;
        let Some(end) = start.checked_add(len) else {
            let err = CodecError::InvalidLength(header.to_string());
            self.buffer.drain(..start);
            return Err(err);
        };
        if self.buffer.len() < end {
            return Ok(None);
        }

        let Some(payload) = self.buffer.get(start..end).map(str::to_string) else {
            self.buffer.drain(..start);
            return Err(CodecError::InvalidLength(format!(
                "{len} does not end on a character boundary"
            )));
        };
        self.buffer.drain(..end);

        if payload.starts_with(HEARTBEAT_PREFIX) {
            Ok(Some(Frame::Heartbeat(payload)))
        } else {
            Ok(Some(Frame::Payload(payload)))
        }
    }

    fn discard_until_marker(&mut self, from: usize) -> CodecError {
        let cut = self
            .buffer
            .get(from..)
            .and_then(|tail| tail.find(FRAME_MARKER))
            .map_or(self.buffer.len(), |pos| pos + from);
        let dropped: String = self.buffer.drain(..cut).collect();
        CodecError::InvalidFormat(dropped.chars().take(50).collect())
    }
}

/// A decoded `{"m":..,"p":[..]}` server call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerMessage {
    /// Function name.
    #[serde(rename = "m")]
    pub method: String,
    /// Positional parameters.
    #[serde(rename = "p", default)]
    pub params: Vec<Value>,
}

/// Decode a frame payload as a server call.
///
/// Returns `Ok(None)` for JSON objects without a method, such as the
/// session greeting sent on connect.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON.
pub fn decode_message(payload: &str) -> Result<Option<ServerMessage>, CodecError> {
    let value: Value = serde_json::from_str(payload)?;
    if value.get("m").is_none() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}
