use chatgate_core::websocket::WsError;
use chatgate_core::{CryptoError, WireError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,

    #[error("session was already closed")]
    AlreadyClosed,

    #[error("session is closing, new payloads are refused")]
    Waiting,

    #[error("send queue is full")]
    Blocked,

    #[error("connection closed by peer")]
    Eof,

    #[error("tcp frame length {0} is out of range")]
    FrameLength(u32),

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("share key already negotiated")]
    KeyAlreadySet,

    #[error("encrypted message without a negotiated share key")]
    MissingShareKey,

    #[error("unknown auth key id {0}")]
    UnknownKeyId(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    WebSocket(#[from] WsError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("connection ended inside the request head")]
    Truncated,

    #[error("request has no Content-Length")]
    MissingContentLength,

    #[error("invalid Content-Length")]
    BadContentLength,

    #[error("chunked request bodies are not supported")]
    Chunked,

    #[error("request body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: u64, max: u64 },

    #[error("request body of {0} bytes is shorter than the envelope header")]
    BodyTooShort(u64),

    #[error("bad websocket upgrade: {0}")]
    BadUpgrade(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("manager is shutting down")]
    Disposed,

    #[error("session is closed")]
    SessionClosed,

    #[error("session is already bound to user {0}")]
    AlreadyBound(u64),

    #[error("user id 0 is reserved for unauthenticated sessions")]
    InvalidUser,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server stopped")]
    Stopped,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}
