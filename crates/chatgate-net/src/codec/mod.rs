//! Codec family — one envelope, three transports.
//!
//! Every codec moves the same `auth_key_id | msg_key | body` envelope
//! (see chatgate_core::wire). They differ only in how the envelope is framed
//! on the socket:
//!
//!   Tcp        u32 LE length prefix
//!   Http       request / response with Content-Length
//!   WebSocket  one binary message
//!
//! Sealing and opening the envelope (encryption, key id bookkeeping) is
//! shared and lives in [`KeyState`].

mod http;
mod tcp;
mod ws;

use bytes::Bytes;
use tokio::io::AsyncRead;

use chatgate_core::crypto::{self, ShareKey};
use chatgate_core::wire::{
    envelope_limit, write_envelope, EnvelopeHeader, Writer, ENVELOPE_HEADER_LEN, KEY_ID_LEN,
    MSG_KEY_LEN,
};

use crate::error::SessionError;
use crate::reader::Reader;
use crate::session::{BoxRead, ConnType};
use crate::websocket::WsReadState;

/// Something to put on the wire.
#[derive(Debug, Clone)]
pub enum OutMessage {
    /// Application payload. Sealed and framed by the session's codec when it
    /// is written.
    Payload(Bytes),
    /// Pre-framed bytes written verbatim (handshake responses, control frames).
    Raw(Bytes),
}

/// Transport framing of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Tcp,
    Http,
    WebSocket,
}

/// Read half of a session plus the per-connection parser state.
pub struct RecvState<R = BoxRead> {
    pub reader: Reader<R>,
    pub ws: WsReadState,
}

impl<R: AsyncRead + Unpin> RecvState<R> {
    pub fn new(read: R, max_msg_size: u64) -> Self {
        Self {
            reader: Reader::new(read),
            ws: WsReadState::new(envelope_limit(max_msg_size)),
        }
    }
}

impl Codec {
    /// Encode an outbound message into socket bytes.
    pub fn pack(self, msg: &OutMessage, keys: &KeyState) -> Result<Bytes, SessionError> {
        match msg {
            OutMessage::Raw(bytes) => Ok(bytes.clone()),
            OutMessage::Payload(payload) => self.frame(&keys.seal(payload)),
        }
    }

    /// Wrap a sealed envelope in this transport's framing.
    pub fn frame(self, envelope: &[u8]) -> Result<Bytes, SessionError> {
        match self {
            Codec::Tcp => tcp::frame(envelope),
            Codec::Http => Ok(http::frame(envelope)),
            Codec::WebSocket => Ok(ws::frame(envelope)?),
        }
    }

    /// Read the next inbound envelope. `max_msg_size` of 0 means the built-in
    /// ceiling, `MAX_ENVELOPE_LEN`.
    pub async fn read_envelope<R: AsyncRead + Unpin>(
        self,
        recv: &mut RecvState<R>,
        max_msg_size: u64,
    ) -> Result<Bytes, SessionError> {
        match self {
            Codec::Tcp => tcp::read_envelope(&mut recv.reader, max_msg_size).await,
            Codec::Http => http::read_envelope(&mut recv.reader, max_msg_size).await,
            Codec::WebSocket => ws::read_envelope(&mut recv.reader, &mut recv.ws).await,
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Maps a connection type to the codec that serves it. Injected into every
/// session at construction.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    tcp: Codec,
    http: Codec,
    websocket: Codec,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            tcp: Codec::Tcp,
            http: Codec::Http,
            websocket: Codec::WebSocket,
        }
    }
}

impl CodecRegistry {
    pub fn get(&self, conn_type: ConnType) -> Codec {
        match conn_type {
            ConnType::Tcp => self.tcp,
            ConnType::Http => self.http,
            ConnType::WebSocket => self.websocket,
        }
    }

    /// Replace the codec used for one connection type.
    pub fn with(mut self, conn_type: ConnType, codec: Codec) -> Self {
        match conn_type {
            ConnType::Tcp => self.tcp = codec,
            ConnType::Http => self.http = codec,
            ConnType::WebSocket => self.websocket = codec,
        }
        self
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Key id and share key of a session.
#[derive(Debug, Default)]
pub struct KeyState {
    key_id: [u8; KEY_ID_LEN],
    share_key: Option<ShareKey>,
}

impl KeyState {
    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.key_id
    }

    pub fn has_share_key(&self) -> bool {
        self.share_key.is_some()
    }

    /// Install the negotiated secret. Only once per session.
    pub fn set_share_key(
        &mut self,
        key_id: [u8; KEY_ID_LEN],
        share_key: ShareKey,
    ) -> Result<(), SessionError> {
        if self.share_key.is_some() {
            return Err(SessionError::KeyAlreadySet);
        }
        self.key_id = key_id;
        self.share_key = Some(share_key);
        Ok(())
    }

    /// Build an envelope around `payload`, encrypted when a share key exists.
    pub fn seal(&self, payload: &[u8]) -> Bytes {
        let mut w = Writer::with_capacity(ENVELOPE_HEADER_LEN + payload.len() + crypto::BLOCK_LEN);
        match &self.share_key {
            Some(key) => {
                let (msg_key, ciphertext) = crypto::encrypt(key, payload);
                write_envelope(&mut w, &EnvelopeHeader::new(self.key_id, msg_key), &ciphertext);
            }
            None => {
                write_envelope(&mut w, &EnvelopeHeader::new(self.key_id, [0; MSG_KEY_LEN]), payload);
            }
        }
        w.into_bytes()
    }

    /// Check and strip an inbound envelope, decrypting when needed.
    pub fn open(&mut self, envelope: Bytes) -> Result<Bytes, SessionError> {
        let (header, body) = EnvelopeHeader::split(&envelope)?;

        if let Some(key_id) = header.key_id() {
            if self.share_key.is_none() {
                self.key_id = key_id;
            }
        }
        if !header.is_encrypted() {
            return Ok(envelope.slice(ENVELOPE_HEADER_LEN..));
        }

        let share_key = self.share_key.as_ref().ok_or(SessionError::MissingShareKey)?;
        let key_id = header.auth_key_id;
        if key_id != self.key_id {
            return Err(SessionError::UnknownKeyId(hex::encode(key_id)));
        }
        let msg_key = header.msg_key;
        let plaintext = crypto::decrypt(share_key, &msg_key, body)?;
        Ok(Bytes::from(plaintext))
    }
}
