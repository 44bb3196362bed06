//! Protocol detection on the first bytes of a connection, and request-head
//! parsing shared by the sniffer and the HTTP codec.

use std::io;

use tokio::io::AsyncRead;

use chatgate_core::http::{is_method, MAX_HEADER_BYTES};

use crate::error::{HttpError, SessionError};
use crate::reader::Reader;

const MAX_HEADERS: usize = 64;

/// True when the buffered input starts with an HTTP request method.
///
/// Peeks 4 to 8 bytes looking for the space after the method token. Nothing
/// is consumed. A stream that ends before a space shows up is not HTTP.
pub async fn is_http<R: AsyncRead + Unpin>(reader: &mut Reader<R>) -> io::Result<bool> {
    for n in 4..=8 {
        let head = reader.peek(n).await?;
        if head.len() < n {
            return Ok(false);
        }
        if let Some(sp) = head.iter().position(|b| *b == b' ') {
            return Ok(is_method(&head[..sp]));
        }
    }
    Ok(false)
}

/// Outcome of sniffing a new connection.
#[derive(Debug)]
pub enum Transport {
    Tcp,
    Http,
    /// A valid upgrade request. The head has been consumed.
    WebSocket { key: String },
    /// An upgrade request that failed validation.
    BadUpgrade(HttpError),
}

/// Classify the connection from its first bytes. Only a WebSocket upgrade
/// consumes input; an HTTP head is left for the HTTP codec.
pub async fn sniff_transport<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
) -> Result<Transport, SessionError> {
    if !is_http(reader).await? {
        return Ok(Transport::Tcp);
    }
    let head = peek_request_head(reader).await?;
    match head.websocket_key() {
        Ok(Some(key)) => {
            let key = key.to_string();
            reader.consume(head.head_len);
            Ok(Transport::WebSocket { key })
        }
        Ok(None) => Ok(Transport::Http),
        Err(e) => Ok(Transport::BadUpgrade(e)),
    }
}

/// Owned copy of a parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Bytes of input the head occupies, including the blank line.
    pub head_len: usize,
}

impl RequestHead {
    /// First header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpError> {
        match self.header_str("content-length") {
            None => Ok(None),
            Some(v) => v.parse().map(Some).map_err(|_| HttpError::BadContentLength),
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.header_str("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether the client asked to switch to WebSocket.
    pub fn wants_websocket(&self) -> bool {
        self.header_str("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// Sec-WebSocket-Key of a valid upgrade request. None when the request is
    /// not an upgrade at all.
    pub fn websocket_key(&self) -> Result<Option<&str>, HttpError> {
        if !self.wants_websocket() {
            return Ok(None);
        }
        if !self.method.eq_ignore_ascii_case("GET") {
            return Err(HttpError::BadUpgrade("upgrade requires GET"));
        }
        if self.header_str("sec-websocket-version") != Some("13") {
            return Err(HttpError::BadUpgrade("unsupported Sec-WebSocket-Version"));
        }
        match self.header_str("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(Some(key)),
            _ => Err(HttpError::BadUpgrade("missing Sec-WebSocket-Key")),
        }
    }
}

/// Parse the request head at the front of the buffer without consuming it.
/// Reads more input until the head is complete or exceeds `MAX_HEADER_BYTES`.
pub async fn peek_request_head<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
) -> Result<RequestHead, SessionError> {
    loop {
        if let Some(head) = try_parse(reader.buffered())? {
            return Ok(head);
        }
        if reader.buffered().len() >= MAX_HEADER_BYTES {
            return Err(HttpError::HeadTooLarge(MAX_HEADER_BYTES).into());
        }
        if reader.fill_more().await? == 0 {
            return Err(HttpError::Truncated.into());
        }
    }
}

fn try_parse(buf: &[u8]) -> Result<Option<RequestHead>, HttpError> {
    let buf = &buf[..buf.len().min(MAX_HEADER_BYTES)];
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf)? {
        httparse::Status::Partial => Ok(None),
        httparse::Status::Complete(head_len) => Ok(Some(RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
            head_len,
        })),
    }
}
