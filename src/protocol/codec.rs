//! Length-prefixed frame codec
//!
//! Every record on the wire is a 4-byte little-endian body length followed by
//! the protobuf body. Decoding is incremental: callers push raw chunks as they
//! arrive and collect whole frames once enough bytes are buffered.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes in the length prefix
pub const LEN_PREFIX: usize = 4;

/// Largest body length accepted before a frame is considered corrupt (4 MiB)
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors raised while decoding frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Length prefix exceeds the accepted maximum
    CorruptFrame { declared_len: u64, max_len: usize },
    /// Body bytes are not a valid protobuf message
    InvalidBody(String),
    /// Body carries a type tag this relay does not know
    UnknownFrameType(i32),
    /// Type tag requires a payload the body does not carry
    MissingPayload(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::CorruptFrame {
                declared_len,
                max_len,
            } => write!(
                f,
                "Corrupt frame: declared length {} exceeds maximum {}",
                declared_len, max_len
            ),
            CodecError::InvalidBody(msg) => write!(f, "Invalid frame body: {}", msg),
            CodecError::UnknownFrameType(tag) => write!(f, "Unknown frame type: {}", tag),
            CodecError::MissingPayload(what) => write!(f, "Frame is missing its {}", what),
        }
    }
}

impl std::error::Error for CodecError {}

/// A message that can travel as a length-prefixed record
pub trait Frame: Sized {
    fn encode_body(&self) -> Vec<u8>;
    fn decode_body(body: &[u8]) -> Result<Self, CodecError>;
}

/// Result of a single decode attempt
#[derive(Debug, PartialEq)]
pub enum Decoded<F> {
    /// A whole frame, plus how many buffer bytes it occupied
    Frame { frame: F, consumed: usize },
    /// The buffer holds only part of a frame (possibly nothing)
    NeedMoreData,
}

/// Encode one frame as `len:u32le ++ body`
pub fn encode<F: Frame>(frame: &F) -> Bytes {
    let body = frame.encode_body();
    let mut out = BytesMut::with_capacity(LEN_PREFIX + body.len());
    out.put_u32_le(body.len() as u32);
    out.put_slice(&body);
    out.freeze()
}

/// Decode the first frame in `buf`
pub fn decode<F: Frame>(buf: &[u8]) -> Result<Decoded<F>, CodecError> {
    decode_with_limit(buf, MAX_FRAME_LEN)
}

/// Decode the first frame in `buf`, rejecting bodies longer than `max_len`.
///
/// Nothing is consumed on `NeedMoreData`; the caller keeps the bytes and
/// retries once more arrive.
pub fn decode_with_limit<F: Frame>(buf: &[u8], max_len: usize) -> Result<Decoded<F>, CodecError> {
    if buf.len() < LEN_PREFIX {
        return Ok(Decoded::NeedMoreData);
    }

    let mut prefix = &buf[..LEN_PREFIX];
    let declared_len = prefix.get_u32_le() as usize;
    if declared_len > max_len {
        return Err(CodecError::CorruptFrame {
            declared_len: declared_len as u64,
            max_len,
        });
    }

    let total = LEN_PREFIX + declared_len;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let frame = F::decode_body(&buf[LEN_PREFIX..total])?;
    Ok(Decoded::Frame {
        frame,
        consumed: total,
    })
}

/// Accumulates chunks of a byte stream and yields complete frames.
///
/// On any decode error the whole buffer is discarded so the next chunk starts
/// from a clean state.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    max_len: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }

    pub fn with_limit(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Bytes currently buffered waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and move every complete frame into `out`.
    ///
    /// Frames decoded before an error are still delivered. On error all
    /// buffered bytes are dropped.
    pub fn push<F: Frame>(&mut self, chunk: &[u8], out: &mut Vec<F>) -> Result<(), CodecError> {
        self.buf.extend_from_slice(chunk);
        loop {
            match decode_with_limit::<F>(&self.buf, self.max_len) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.buf.advance(consumed);
                    out.push(frame);
                }
                Ok(Decoded::NeedMoreData) => return Ok(()),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
