//! TLS-record-shaped framing of the byte stream.
//!
//! ```text
//! +--------+------------------+------------------+-----------------+
//! | Type   | Version (0x0303) | Length (BE16)    | Body            |
//! | 1 byte | 2 bytes          | 2 bytes          | Length bytes    |
//! +--------+------------------+------------------+-----------------+
//! ```
//!
//! The data phase of every connection starts with a 6-byte ChangeCipherSpec
//! wrapper that carries no information and is skipped once by the reader.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{
    FrameError, DATA_PHASE_PREFIX, MAX_RECORD_BODY, RECORD_HEADER_SIZE, RECORD_TYPE_CONTROL,
    RECORD_TYPE_FRAME, RECORD_TYPE_HANDSHAKE, RECORD_VERSION,
};

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Encrypted connection frame.
    Frame,
    /// Encrypted connection control.
    Control,
    /// Plaintext hello.
    Handshake,
}

impl RecordType {
    /// Parse a record type byte.
    pub fn from_byte(byte: u8) -> Result<Self, FrameError> {
        match byte {
            RECORD_TYPE_FRAME => Ok(Self::Frame),
            RECORD_TYPE_CONTROL => Ok(Self::Control),
            RECORD_TYPE_HANDSHAKE => Ok(Self::Handshake),
            other => Err(FrameError::InvalidRecordType(other)),
        }
    }

    /// Wire byte of this type.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Frame => RECORD_TYPE_FRAME,
            Self::Control => RECORD_TYPE_CONTROL,
            Self::Handshake => RECORD_TYPE_HANDSHAKE,
        }
    }
}

/// Append one record to `out`.
pub fn encode_record(
    record_type: RecordType,
    body: &[u8],
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    if body.len() > MAX_RECORD_BODY {
        return Err(FrameError::RecordTooLarge(body.len()));
    }
    out.reserve(RECORD_HEADER_SIZE + body.len());
    out.put_u8(record_type.as_byte());
    out.put_u16(RECORD_VERSION);
    out.put_u16(body.len() as u16);
    out.put_slice(body);
    Ok(())
}

/// Incremental record parser over a TCP byte stream.
#[derive(Debug)]
pub struct RecordReader {
    buf: BytesMut,
    prefix_remaining: usize,
}

impl RecordReader {
    /// Create a reader; `skip_prefix` discards the data-phase wrapper first.
    pub fn new(skip_prefix: bool) -> Self {
        Self {
            buf: BytesMut::new(),
            prefix_remaining: if skip_prefix {
                DATA_PHASE_PREFIX.len()
            } else {
                0
            },
        }
    }

    /// Feed bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet parsed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete record, if one is buffered.
    pub fn next_record(&mut self) -> Result<Option<(RecordType, Bytes)>, FrameError> {
        if self.prefix_remaining > 0 {
            let skip = self.prefix_remaining.min(self.buf.len());
            self.buf.advance(skip);
            self.prefix_remaining -= skip;
            if self.prefix_remaining > 0 {
                return Ok(None);
            }
        }

        if self.buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let record_type = RecordType::from_byte(self.buf[0])?;
        let len = u16::from_be_bytes([self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < RECORD_HEADER_SIZE + len {
            return Ok(None);
        }
        self.buf.advance(RECORD_HEADER_SIZE);
        let body = self.buf.split_to(len).freeze();
        Ok(Some((record_type, body)))
    }

    /// Hand back whatever is still buffered, consuming the reader.
    pub fn into_remaining(self) -> BytesMut {
        self.buf
    }
}
