//! Gateway wire format — the bytes every codec agrees on.
//!
//! Every application message, whatever the transport, carries the same
//! envelope:
//!
//!   auth_key_id (8) | msg_key (16) | body
//!
//! The binary TCP transport prefixes the envelope with a u32 little-endian
//! length covering everything after the length itself. HTTP carries the
//! envelope as the request/response body, WebSocket as the payload of a
//! data message.
//!
//! A zero msg_key means the body is plaintext. A non-zero msg_key means the
//! body is AES-CBC ciphertext and the msg_key was derived from the plaintext
//! (see crypto.rs).

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Envelope Header ──────────────────────────────────────────────────────────

/// Length of the key id that names the negotiated shared secret.
pub const KEY_ID_LEN: usize = 8;

/// Length of the per-message key.
pub const MSG_KEY_LEN: usize = 16;

/// Envelope header size: key id + message key.
pub const ENVELOPE_HEADER_LEN: usize = KEY_ID_LEN + MSG_KEY_LEN;

/// Size of the TCP length prefix.
pub const TCP_LENGTH_PREFIX_LEN: usize = 4;

/// TCP length values at or below this are framing errors: the 24-byte header
/// must be followed by at least one 4-byte word of body.
pub const MIN_TCP_FRAME_LEN: u32 = 28;

/// Ceiling on a single envelope when no `max_msg_size` is configured.
pub const MAX_ENVELOPE_LEN: u64 = 16 * 1024 * 1024;

/// Effective envelope limit for a configured `max_msg_size`; 0 falls back to
/// `MAX_ENVELOPE_LEN`.
pub fn envelope_limit(max_msg_size: u64) -> u64 {
    match max_msg_size {
        0 => MAX_ENVELOPE_LEN,
        n => n,
    }
}

/// Fixed header in front of every message body.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct EnvelopeHeader {
    /// Names the shared secret the sender used. All zero = none announced.
    pub auth_key_id: [u8; KEY_ID_LEN],

    /// Message key derived from the plaintext. All zero = body is plaintext.
    pub msg_key: [u8; MSG_KEY_LEN],
}

assert_eq_size!(EnvelopeHeader, [u8; ENVELOPE_HEADER_LEN]);

impl EnvelopeHeader {
    pub fn new(auth_key_id: [u8; KEY_ID_LEN], msg_key: [u8; MSG_KEY_LEN]) -> Self {
        Self {
            auth_key_id,
            msg_key,
        }
    }

    /// Split an envelope into its header and body.
    pub fn split(envelope: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if envelope.len() < ENVELOPE_HEADER_LEN {
            return Err(WireError::Truncated {
                need: ENVELOPE_HEADER_LEN,
                got: envelope.len(),
            });
        }
        let (head, body) = envelope.split_at(ENVELOPE_HEADER_LEN);
        let header = Self::read_from(head).ok_or(WireError::Truncated {
            need: ENVELOPE_HEADER_LEN,
            got: head.len(),
        })?;
        Ok((header, body))
    }

    /// True when the body is encrypted.
    pub fn is_encrypted(&self) -> bool {
        let msg_key = self.msg_key;
        !is_all_zero(&msg_key)
    }

    /// The key id, or None when the sender left it blank.
    pub fn key_id(&self) -> Option<[u8; KEY_ID_LEN]> {
        let id = self.auth_key_id;
        (!is_all_zero(&id)).then_some(id)
    }
}

/// True when every byte is zero. Empty input counts as zero.
pub fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Growable output buffer with the fixed-width encoders the codecs need.
///
/// Integers are little-endian unless the method name says otherwise; the
/// big-endian variants exist for WebSocket frame headers.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u24_le(&mut self, v: u32) {
        self.buf.put_slice(&v.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_u64_be(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Append several slices in order.
    pub fn write_all(&mut self, parts: &[&[u8]]) {
        for part in parts {
            self.buf.put_slice(part);
        }
    }

    pub fn write_str(&mut self, v: &str) {
        self.buf.put_slice(v.as_bytes());
    }

    pub fn zero_pad(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Write a length prefix: one byte below 254, otherwise the 254 marker
    /// followed by a 24-bit little-endian length.
    ///
    /// Returns the number of zero bytes the caller must append after the
    /// payload to reach 4-byte alignment.
    pub fn write_string_len(&mut self, len: usize) -> Result<usize, WireError> {
        if len < 254 {
            self.write_u8(len as u8);
            Ok(padding_of(1 + len))
        } else if len <= MAX_LONG_STRING {
            self.write_u8(254);
            self.write_u24_le(len as u32);
            Ok(padding_of(4 + len))
        } else {
            Err(WireError::StringTooLong(len))
        }
    }

    /// Length-prefixed, 4-byte aligned byte string.
    pub fn write_string(&mut self, v: &[u8]) -> Result<(), WireError> {
        let pad = self.write_string_len(v.len())?;
        self.write_bytes(v);
        self.zero_pad(pad);
        Ok(())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Longest string the 24-bit length prefix can describe.
pub const MAX_LONG_STRING: usize = 0x00FF_FFFF;

/// Zero bytes needed to round `len` up to a multiple of 4.
pub fn padding_of(len: usize) -> usize {
    match len % 4 {
        0 => 0,
        rem => 4 - rem,
    }
}

/// Build `auth_key_id | msg_key | body` into `w`.
pub fn write_envelope(w: &mut Writer, header: &EnvelopeHeader, body: &[u8]) {
    w.write_bytes(header.as_bytes());
    w.write_bytes(body);
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated envelope: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("frame length {0} is outside the accepted range")]
    FrameLength(u64),

    #[error("string of {0} bytes does not fit a 24-bit length prefix")]
    StringTooLong(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
