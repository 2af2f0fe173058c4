//! Message frame and its line-oriented wire codec.
//!
//! A frame travels as four newline-terminated fields:
//!
//! ```text
//! <peer>\n<stream id>\n<payload length>\n<payload bytes>\n
//! ```
//!
//! The peer field names the sender. The payload is raw bytes of exactly the
//! announced length, followed by a single separator newline. A stream reset
//! carries the token `RST` in place of the length and no payload:
//!
//! ```text
//! <peer>\n<stream id>\nRST\n\n
//! ```

use crate::StreamId;
use thiserror::Error;

/// Largest payload a single frame may carry (16 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Longest accepted header field (peer name, stream id, length).
const MAX_FIELD_LEN: usize = 1024;

/// Length-field token marking a reset frame.
const RESET_TOKEN: &[u8] = b"RST";

/// Frame codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Peer name is empty, not UTF-8 or contains a newline
    #[error("invalid peer name")]
    InvalidPeer,

    /// Stream id field is not an unsigned integer
    #[error("invalid stream id field: {0:?}")]
    InvalidStreamId(String),

    /// Length field is not an unsigned integer
    #[error("invalid length field: {0:?}")]
    InvalidLength(String),

    /// Announced payload exceeds [`MAX_FRAME_PAYLOAD`]
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A header field ran past the field limit without a newline
    #[error("header field exceeds {MAX_FIELD_LEN} bytes")]
    FieldTooLong,

    /// Payload was not followed by the separator newline
    #[error("missing frame separator")]
    MissingSeparator,
}

/// One logical send on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Sender (on receipt) or destination (before sending) endpoint name
    pub peer: String,
    /// Stream the payload belongs to
    pub stream_id: StreamId,
    /// Raw payload; empty marks end-of-stream
    pub payload: Vec<u8>,
    /// Abort the stream; the receiver discards whatever it buffered for it
    pub reset: bool,
}

impl MessageFrame {
    /// Create a data frame
    pub fn new(peer: impl Into<String>, stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            peer: peer.into(),
            stream_id,
            payload,
            reset: false,
        }
    }

    /// Create an end-of-stream frame
    pub fn fin(peer: impl Into<String>, stream_id: StreamId) -> Self {
        Self::new(peer, stream_id, Vec::new())
    }

    /// Create a reset frame
    pub fn reset(peer: impl Into<String>, stream_id: StreamId) -> Self {
        Self {
            reset: true,
            ..Self::new(peer, stream_id, Vec::new())
        }
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this frame ends its stream normally
    #[must_use]
    pub fn is_fin(&self) -> bool {
        !self.reset && self.payload.is_empty()
    }

    /// Whether this frame aborts its stream
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.reset
    }
}

/// Encode a frame into its wire form.
///
/// # Errors
/// Returns `FrameError::InvalidPeer` for an empty peer or one containing a
/// newline, and `FrameError::PayloadTooLarge` for oversized payloads.
/// A reset frame never carries payload.
pub fn encode_frame(frame: &MessageFrame) -> Result<Vec<u8>, FrameError> {
    if frame.peer.is_empty() || frame.peer.contains('\n') || frame.peer.len() > MAX_FIELD_LEN {
        return Err(FrameError::InvalidPeer);
    }
    if frame.reset {
        return Ok(format!("{}\n{}\nRST\n\n", frame.peer, frame.stream_id).into_bytes());
    }
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(frame.payload.len()));
    }

    let header = format!(
        "{}\n{}\n{}\n",
        frame.peer,
        frame.stream_id,
        frame.payload.len()
    );
    let mut out = Vec::with_capacity(header.len() + frame.payload.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&frame.payload);
    out.push(b'\n');
    Ok(out)
}

/// Incremental frame decoder.
///
/// Bytes can be fed in arbitrary slices; complete frames come out in the
/// order they were written. After an error the buffered input is discarded,
/// since a corrupted stream has no resynchronisation point.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw input
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// # Errors
    /// Returns `FrameError` when the buffered input is malformed.
    pub fn next_frame(&mut self) -> Result<Option<MessageFrame>, FrameError> {
        match self.try_decode() {
            Ok(Some((frame, consumed))) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.buf.clear();
                Err(e)
            }
        }
    }

    fn try_decode(&self) -> Result<Option<(MessageFrame, usize)>, FrameError> {
        let mut pos = 0;
        let mut fields: [&[u8]; 3] = [&[], &[], &[]];
        for field in &mut fields {
            let rest = &self.buf[pos..];
            match rest.iter().position(|&b| b == b'\n') {
                Some(end) if end > MAX_FIELD_LEN => return Err(FrameError::FieldTooLong),
                Some(end) => {
                    *field = &rest[..end];
                    pos += end + 1;
                }
                None if rest.len() > MAX_FIELD_LEN => return Err(FrameError::FieldTooLong),
                None => return Ok(None),
            }
        }

        let peer = std::str::from_utf8(fields[0]).map_err(|_| FrameError::InvalidPeer)?;
        if peer.is_empty() {
            return Err(FrameError::InvalidPeer);
        }
        let stream_id = parse_number::<StreamId>(fields[1])
            .ok_or_else(|| FrameError::InvalidStreamId(lossy(fields[1])))?;
        if fields[2] == RESET_TOKEN {
            return match self.buf.get(pos) {
                None => Ok(None),
                Some(b'\n') => Ok(Some((MessageFrame::reset(peer, stream_id), pos + 1))),
                Some(_) => Err(FrameError::MissingSeparator),
            };
        }
        let len = parse_number::<usize>(fields[2])
            .ok_or_else(|| FrameError::InvalidLength(lossy(fields[2])))?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }

        let end = pos + len;
        if self.buf.len() <= end {
            return Ok(None);
        }
        if self.buf[end] != b'\n' {
            return Err(FrameError::MissingSeparator);
        }

        let frame = MessageFrame::new(peer, stream_id, self.buf[pos..end].to_vec());
        Ok(Some((frame, end + 1)))
    }
}

fn parse_number<N: std::str::FromStr>(field: &[u8]) -> Option<N> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}
