//! Wire payload codec.
//!
//! Two encodings are supported and must not be mixed within one message stream:
//!
//! ```text
//! Integer  [ i64 big-endian, 8 bytes ]
//! Text     [ len: u32 big-endian ][ len ASCII bytes ]
//! ```
//!
//! Decoding is strict: a buffer shorter than the encoded length, a buffer with
//! trailing bytes, or text containing non-ASCII bytes is rejected. Decoders
//! never index past the end of the input.

use std::fmt;

use thiserror::Error;

/// Size of an encoded integer payload.
pub const INTEGER_LENGTH: usize = 8;

/// Size of the text length prefix.
pub const TEXT_PREFIX_LENGTH: usize = 4;

/// Decode failures. All of them classify as a malformed payload.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Buffer ends before the encoded value does.
    #[error("truncated payload: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Buffer carries bytes after the encoded value.
    #[error("trailing bytes: encoded length {expected}, buffer length {actual}")]
    TrailingBytes { expected: usize, actual: usize },

    /// Text contains a byte outside the ASCII range.
    #[error("non-ASCII byte 0x{byte:02x} at offset {offset}")]
    NonAscii { offset: usize, byte: u8 },

    /// Text too long for the length prefix.
    #[error("text of {0} bytes exceeds the u32 length prefix")]
    TooLong(usize),
}

/// A value with a fixed wire encoding.
pub trait Payload: Sized {
    /// Append the encoding of `self` to `buf`.
    fn encode_into(&self, buf: &mut Vec<u8>);

    /// Decode a value that must occupy all of `bytes`.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Encode into a fresh buffer.
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }
}

impl Payload for i64 {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < INTEGER_LENGTH {
            return Err(CodecError::Truncated {
                needed: INTEGER_LENGTH,
                available: bytes.len(),
            });
        }
        if bytes.len() > INTEGER_LENGTH {
            return Err(CodecError::TrailingBytes {
                expected: INTEGER_LENGTH,
                actual: bytes.len(),
            });
        }
        let mut raw = [0u8; INTEGER_LENGTH];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }
}

/// Validated ASCII text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsciiText(String);

impl AsciiText {
    /// Wrap `text`, rejecting non-ASCII content and lengths the prefix cannot hold.
    pub fn new(text: impl Into<String>) -> Result<Self, CodecError> {
        let text = text.into();
        if let Some((offset, byte)) = text.bytes().enumerate().find(|(_, b)| !b.is_ascii()) {
            return Err(CodecError::NonAscii { offset, byte });
        }
        if text.len() > u32::MAX as usize {
            return Err(CodecError::TooLong(text.len()));
        }
        Ok(AsciiText(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AsciiText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Payload for AsciiText {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        // Length fits: checked in `new`.
        buf.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        buf.extend_from_slice(self.0.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let prefix = bytes.get(..TEXT_PREFIX_LENGTH).ok_or(CodecError::Truncated {
            needed: TEXT_PREFIX_LENGTH,
            available: bytes.len(),
        })?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let expected = TEXT_PREFIX_LENGTH.saturating_add(len);

        let body = bytes
            .get(TEXT_PREFIX_LENGTH..expected)
            .ok_or(CodecError::Truncated {
                needed: expected,
                available: bytes.len(),
            })?;
        if bytes.len() > expected {
            return Err(CodecError::TrailingBytes {
                expected,
                actual: bytes.len(),
            });
        }
        if let Some((offset, byte)) = body.iter().copied().enumerate().find(|(_, b)| !b.is_ascii()) {
            return Err(CodecError::NonAscii {
                offset: TEXT_PREFIX_LENGTH + offset,
                byte,
            });
        }
        // ASCII is valid UTF-8.
        let text = String::from_utf8_lossy(body).into_owned();
        Ok(AsciiText(text))
    }
}

/// Which of the two encodings a stream carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Integer,
    Text,
}

impl PayloadKind {
    /// Check that `bytes` decodes under this encoding.
    pub fn validate(&self, bytes: &[u8]) -> Result<(), CodecError> {
        match self {
            PayloadKind::Integer => i64::decode(bytes).map(|_| ()),
            PayloadKind::Text => AsciiText::decode(bytes).map(|_| ()),
        }
    }

    /// Render a payload for diagnostics.
    pub fn describe(&self, bytes: &[u8]) -> Result<String, CodecError> {
        match self {
            PayloadKind::Integer => i64::decode(bytes).map(|v| v.to_string()),
            PayloadKind::Text => AsciiText::decode(bytes).map(AsciiText::into_string),
        }
    }
}
