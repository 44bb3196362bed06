//! chatgate integration test harness.
//!
//! Every test starts its own gateway on an ephemeral loopback port and talks
//! to it over real TCP sockets, speaking the client side of each transport
//! by hand. The gateway runs a dispatcher that echoes payloads back, and
//! installs a share key when it sees a `KEY:` message.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use chatgate_core::config::GatewayConfig;
use chatgate_core::websocket::mask_bytes;
use chatgate_core::ShareKey;
use chatgate_net::{serve, Dispatcher, Server, ServerError, Session};

mod http;
mod lifecycle;
mod tcp;
mod websocket;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound on any single wait in a test.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of the message that installs a share key:
/// `KEY:` | key_id (8) | secret (32).
pub const KEY_PREFIX: &[u8] = b"KEY:";

pub struct TestDispatcher;

impl Dispatcher for TestDispatcher {
    async fn dispatch(&self, session: &Arc<Session>, payload: Bytes) -> Result<()> {
        if let Some(rest) = payload.strip_prefix(KEY_PREFIX) {
            let key_id: [u8; 8] = rest
                .get(..8)
                .context("key message too short")?
                .try_into()?;
            let secret = ShareKey::from_slice(rest.get(8..40).context("key message too short")?)?;
            session.set_share_key(key_id, secret)?;
            session.send_payload(Bytes::from_static(b"OK")).await?;
            return Ok(());
        }
        session.send_payload(payload).await?;
        Ok(())
    }
}

pub struct Gateway {
    pub server: Arc<Server>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl Gateway {
    pub async fn start() -> Result<Self> {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut GatewayConfig)) -> Result<Self> {
        let mut config = GatewayConfig::default();
        config.server.addr = "127.0.0.1:0".to_string();
        config.session.read_deadline_secs = 5;
        tweak(&mut config);

        let server = Arc::new(Server::bind(&config).await.context("bind failed")?);
        let task = tokio::spawn(serve(server.clone(), Arc::new(TestDispatcher)));
        Ok(Self { server, task })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        TcpStream::connect(self.server.local_addr())
            .await
            .context("connect failed")
    }

    /// Stop the server and wait for the serve loop to return.
    pub async fn shutdown(self) -> Result<()> {
        within(self.server.stop()).await?;
        within(self.task).await???;
        Ok(())
    }
}

/// Await `fut`, failing the test if it takes longer than `STEP_TIMEOUT`.
pub async fn within<F: Future>(fut: F) -> Result<F::Output> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .context("timed out")
}

// ── Client-side wire helpers ──────────────────────────────────────────────────

/// `key_id(0) | msg_key(0) | body`.
pub fn plain_envelope(body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 24];
    out.extend_from_slice(body);
    out
}

pub fn tcp_frame(envelope: &[u8]) -> Vec<u8> {
    let mut out = (envelope.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(envelope);
    out
}

pub async fn read_tcp_envelope(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = within(stream.read_u32_le()).await??;
    let mut buf = vec![0u8; len as usize];
    within(stream.read_exact(&mut buf)).await??;
    Ok(buf)
}

/// Read up to and including the blank line ending an HTTP head.
pub async fn read_http_head(stream: &mut TcpStream) -> Result<String> {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(within(stream.read_u8()).await??);
        if head.len() > 8192 {
            bail!("response head too long");
        }
    }
    Ok(String::from_utf8(head)?)
}

/// Value of `name` in an HTTP head, case-insensitively.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Masked client frame with a random key.
pub fn ws_client_frame(fin: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key: [u8; 4] = rand::random();
    let mut out = vec![if fin { 0x80 } else { 0 } | opcode];
    match payload.len() {
        n if n <= 125 => out.push(0x80 | n as u8),
        n if n <= 0xffff => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&key);
    let mut body = payload.to_vec();
    mask_bytes(key, 0, &mut body);
    out.extend_from_slice(&body);
    out
}

/// One unmasked server frame: (first header byte, payload).
pub async fn read_ws_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut head = [0u8; 2];
    within(stream.read_exact(&mut head)).await??;
    if head[1] & 0x80 != 0 {
        bail!("server frames must not be masked");
    }
    let len = match head[1] & 0x7f {
        126 => within(stream.read_u16()).await?? as usize,
        127 => within(stream.read_u64()).await?? as usize,
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    within(stream.read_exact(&mut payload)).await??;
    Ok((head[0], payload))
}

/// Perform the opening handshake; returns the 101 response head.
pub async fn ws_handshake(stream: &mut TcpStream) -> Result<String> {
    let request = "GET /chat HTTP/1.1\r\n\
                   Host: localhost\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).await?;
    read_http_head(stream).await
}

/// True once the peer has closed its side.
pub async fn reaches_eof(stream: &mut TcpStream) -> Result<bool> {
    let mut buf = [0u8; 256];
    loop {
        match within(stream.read(&mut buf)).await? {
            Ok(0) => return Ok(true),
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(true),
            Err(e) => return Err(e.into()),
        }
    }
}
