//! RFC 6455 building blocks: opcodes, close codes, frame encoding, masking
//! and the opening handshake.
//!
//! Frame layout (RFC 6455 §5.2):
//!
//!   byte 0   FIN | RSV1..3 | opcode(4)
//!   byte 1   MASK | len7
//!   len7 == 126 → u16 BE extended length
//!   len7 == 127 → u64 BE extended length (top bit must be clear)
//!   MASK set    → 4-byte masking key
//!   payload
//!
//! The server never masks. The streaming reader that consumes frames lives in
//! chatgate-net, on top of its buffered reader.

use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::http::http_date;
use crate::wire::Writer;

pub const FINAL_BIT: u8 = 0x80;
pub const RSV_BITS: u8 = 0x70;
pub const OPCODE_BITS: u8 = 0x0f;
pub const MASK_BIT: u8 = 0x80;
pub const LEN7_BITS: u8 = 0x7f;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 + 8 length + 4 mask.
pub const MAX_FRAME_HEADER: usize = 14;

/// Appended to Sec-WebSocket-Key before hashing.
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// ── Opcodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WsError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(OpCode::Continuation),
            1 => Ok(OpCode::Text),
            2 => Ok(OpCode::Binary),
            8 => Ok(OpCode::Close),
            9 => Ok(OpCode::Ping),
            10 => Ok(OpCode::Pong),
            other => Err(WsError::Protocol(format!("unknown opcode {other}"))),
        }
    }
}

// ── Close codes ───────────────────────────────────────────────────────────────

pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    pub const TRY_AGAIN_LATER: u16 = 1013;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

/// Whether a peer may send `code` in a close frame. 1005, 1006 and 1015 are
/// reserved for local reporting and never valid on the wire.
pub fn is_valid_received_close_code(code: u16) -> bool {
    matches!(
        code,
        close::NORMAL
            | close::GOING_AWAY
            | close::PROTOCOL_ERROR
            | close::UNSUPPORTED_DATA
            | close::INVALID_PAYLOAD
            | close::POLICY_VIOLATION
            | close::MESSAGE_TOO_BIG
            | close::MANDATORY_EXTENSION
            | close::INTERNAL_ERROR
            | close::SERVICE_RESTART
            | close::TRY_AGAIN_LATER
            | 3000..=4999
    )
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode one unmasked final frame.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Result<Bytes, WsError> {
    if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(WsError::Protocol(format!(
            "control payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
            payload.len()
        )));
    }
    let mut w = Writer::with_capacity(MAX_FRAME_HEADER + payload.len());
    w.write_u8(FINAL_BIT | opcode as u8);
    match payload.len() {
        n if n <= 125 => w.write_u8(n as u8),
        n if n <= u16::MAX as usize => {
            w.write_u8(126);
            w.write_u16_be(n as u16);
        }
        n => {
            w.write_u8(127);
            w.write_u64_be(n as u64);
        }
    }
    w.write_bytes(payload);
    Ok(w.into_bytes())
}

/// Close payload: u16 BE code followed by the UTF-8 reason, truncated on a
/// char boundary to fit a control frame.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = Vec::with_capacity(2 + end);
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&reason.as_bytes()[..end]);
    out
}

/// A complete close frame.
pub fn close_frame(code: u16, reason: &str) -> Bytes {
    let payload = close_payload(code, reason);
    let mut w = Writer::with_capacity(2 + payload.len());
    w.write_u8(FINAL_BIT | OpCode::Close as u8);
    w.write_u8(payload.len() as u8);
    w.write_bytes(&payload);
    w.into_bytes()
}

/// XOR `buf` with the masking key starting at key offset `pos`. Returns the
/// offset to continue from.
pub fn mask_bytes(key: [u8; 4], mut pos: usize, buf: &mut [u8]) -> usize {
    for b in buf.iter_mut() {
        *b ^= key[pos & 3];
        pos += 1;
    }
    pos & 3
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Sec-WebSocket-Accept for a client's Sec-WebSocket-Key.
pub fn accept_key(sec_key: &str) -> String {
    let mut h = Sha1::new();
    h.update(sec_key.as_bytes());
    h.update(ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(h.finalize())
}

/// The 101 response completing the opening handshake.
pub fn upgrade_response(sec_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Date: {}\r\n\
         \r\n",
        accept_key(sec_key),
        http_date()
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Terminal WebSocket read error. Clone so the engine can keep returning the
/// same error after the first failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("websocket protocol violation: {0}")]
    Protocol(String),

    #[error("message of {len} bytes exceeds limit of {max}")]
    MessageTooBig { len: u64, max: u64 },

    #[error("peer closed the connection ({code}): {reason}")]
    PeerClosed { code: u16, reason: String },

    #[error("connection ended in the middle of a frame")]
    UnexpectedEof,

    #[error("i/o error: {0}")]
    Io(String),
}

impl WsError {
    /// Close code to send back for this error, if any.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            WsError::Protocol(_) => Some(close::PROTOCOL_ERROR),
            WsError::MessageTooBig { .. } => Some(close::MESSAGE_TOO_BIG),
            WsError::PeerClosed { .. } | WsError::UnexpectedEof | WsError::Io(_) => None,
        }
    }
}

impl From<std::io::Error> for WsError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WsError::UnexpectedEof
        } else {
            WsError::Io(e.to_string())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
