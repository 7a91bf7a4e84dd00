//! Wire framing for the `/api/generate` response body.
//!
//! Narration is written as raw UTF-8 with no envelope. Tool calls travel in a
//! length-prefixed envelope:
//!
//! ```text
//! $<byte length of payload> JSON://<tool call json>
//! ```
//!
//! [`FrameDecoder`] rebuilds frames from arbitrarily split byte chunks. It
//! never emits a partial envelope and never splits a UTF-8 character.

use thiserror::Error;

use crate::models::ToolCallDescriptor;

/// First byte of a structured envelope.
pub const ENVELOPE_MARKER: u8 = b'$';
/// Marker every structured payload starts with.
pub const JSON_PAYLOAD_PREFIX: &str = "JSON://";
/// Largest payload a decoder accepts before giving up on the stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const MAX_LENGTH_DIGITS: usize = 10;

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    ToolCall(ToolCallDescriptor),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to encode tool call frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed tool call frame: {0}")]
    MalformedToolCall(#[source] serde_json::Error),
    #[error("structured frame payload does not start with {JSON_PAYLOAD_PREFIX}")]
    UnknownPayload,
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge { len: usize },
    #[error("stream ended inside a frame ({received} of {expected} payload bytes)")]
    TruncatedFrame { expected: usize, received: usize },
}

impl Frame {
    /// Serialize the frame exactly as it appears on the wire.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Frame::Text(text) => Ok(text.as_bytes().to_vec()),
            Frame::ToolCall(call) => encode_tool_call(call),
        }
    }
}

/// Build the `$<len> JSON://...` envelope for one tool call.
pub fn encode_tool_call(call: &ToolCallDescriptor) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_string(call).map_err(FrameError::Encode)?;
    let payload = format!("{JSON_PAYLOAD_PREFIX}{json}");
    Ok(format!("${} {payload}", payload.len()).into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Header {
    /// Header fully parsed; the payload follows `header_len` bytes in.
    Complete {
        payload_len: usize,
        header_len: usize,
    },
    /// Could still become an envelope once more bytes arrive.
    Partial,
    /// Not an envelope; the `$` belongs to narration.
    Invalid,
}

/// Inspect a buffer that starts with [`ENVELOPE_MARKER`].
fn parse_header(bytes: &[u8]) -> Header {
    let digits = bytes[1..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits > MAX_LENGTH_DIGITS {
        return Header::Invalid;
    }
    let after_digits = 1 + digits;
    if after_digits == bytes.len() {
        return Header::Partial;
    }
    if digits == 0 || bytes[after_digits] != b' ' {
        return Header::Invalid;
    }

    let payload_start = after_digits + 1;
    let prefix = JSON_PAYLOAD_PREFIX.as_bytes();
    let available = &bytes[payload_start..];
    let compared = available.len().min(prefix.len());
    if available[..compared] != prefix[..compared] {
        return Header::Invalid;
    }

    let Some(payload_len) = std::str::from_utf8(&bytes[1..after_digits])
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
    else {
        return Header::Invalid;
    };
    if payload_len < prefix.len() {
        return Header::Invalid;
    }
    if compared < prefix.len() {
        return Header::Partial;
    }
    Header::Complete {
        payload_len,
        header_len: payload_start,
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => bytes.len(),
    }
}

fn decode_payload(payload: &[u8]) -> Result<Frame, FrameError> {
    let Some(json) = payload.strip_prefix(JSON_PAYLOAD_PREFIX.as_bytes()) else {
        return Err(FrameError::UnknownPayload);
    };
    let call = serde_json::from_slice(json).map_err(FrameError::MalformedToolCall)?;
    Ok(Frame::ToolCall(call))
}

/// Incremental decoder for one response body.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Flush at end of stream. Held narration is emitted as-is; a
    /// half-received envelope is an error.
    pub fn finish(&mut self) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        if self.buffer.is_empty() {
            return Ok(frames);
        }
        if self.buffer[0] == ENVELOPE_MARKER
            && let Header::Complete {
                payload_len,
                header_len,
            } = parse_header(&self.buffer)
        {
            let received = self.buffer.len() - header_len;
            self.buffer.clear();
            return Err(FrameError::TruncatedFrame {
                expected: payload_len,
                received,
            });
        }
        let rest = std::mem::take(&mut self.buffer);
        frames.push(Frame::Text(String::from_utf8_lossy(&rest).into_owned()));
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        if self.buffer[0] == ENVELOPE_MARKER {
            match parse_header(&self.buffer) {
                Header::Complete {
                    payload_len,
                    header_len,
                } => {
                    if payload_len > MAX_FRAME_BYTES {
                        self.buffer.clear();
                        return Err(FrameError::FrameTooLarge { len: payload_len });
                    }
                    let end = header_len + payload_len;
                    if self.buffer.len() < end {
                        return Ok(None);
                    }
                    let frame: Vec<u8> = self.buffer.drain(..end).collect();
                    return decode_payload(&frame[header_len..]).map(Some);
                }
                Header::Partial => return Ok(None),
                Header::Invalid => {}
            }
        }

        // Narration runs up to the next byte that could open an envelope.
        let stop = self
            .buffer
            .iter()
            .enumerate()
            .skip(1)
            .find(|(index, byte)| {
                **byte == ENVELOPE_MARKER && parse_header(&self.buffer[*index..]) != Header::Invalid
            })
            .map_or(self.buffer.len(), |(index, _)| index);
        let text_len = complete_utf8_len(&self.buffer[..stop]);
        if text_len == 0 {
            return Ok(None);
        }
        let text: Vec<u8> = self.buffer.drain(..text_len).collect();
        Ok(Some(Frame::Text(String::from_utf8_lossy(&text).into_owned())))
    }
}
