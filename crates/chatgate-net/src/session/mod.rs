//! Session — one accepted connection, whatever its transport.
//!
//! A session owns both halves of its connection. The read half sits behind
//! a buffered [`Reader`](crate::reader::Reader) together with the WebSocket
//! read state; the write half is shared by the send worker, synchronous
//! sends and control-frame replies.
//!
//! Lifecycle:
//!
//!   Open ──► Waiting ──► Closed
//!
//! Waiting refuses new application payloads but still lets raw frames out
//! (close handshake). Closed is reached exactly once, through a CAS on the
//! close flag; a second close reports `AlreadyClosed`.

mod send_worker;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use chatgate_core::config::GatewayConfig;
use chatgate_core::http::bad_request_response;
use chatgate_core::websocket::{close_frame, upgrade_response};
use chatgate_core::wire::KEY_ID_LEN;
use chatgate_core::ShareKey;

use crate::codec::{Codec, CodecRegistry, KeyState, OutMessage, RecvState};
use crate::error::SessionError;
use crate::manager::Manager;
use crate::sniff::{sniff_transport, Transport};

use send_worker::{Queued, SendWorker};

pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

// ── Connection type ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnType {
    Tcp = 0,
    Http = 1,
    WebSocket = 2,
}

impl ConnType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnType::Http,
            2 => ConnType::WebSocket,
            _ => ConnType::Tcp,
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnType::Tcp => "tcp",
            ConnType::Http => "http",
            ConnType::WebSocket => "websocket",
        })
    }
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Per-session limits, resolved once from the gateway config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on reading one message once its first byte arrived.
    pub read_deadline: Option<Duration>,
    /// Bound on each socket write.
    pub write_deadline: Option<Duration>,
    /// 0 = the built-in envelope ceiling.
    pub max_msg_size: u64,
    /// 0 = no queue, sends write synchronously.
    pub send_queue_size: usize,
}

impl SessionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            read_deadline: config.session.read_deadline(),
            write_deadline: config.session.write_deadline(),
            max_msg_size: config.session.max_msg_size,
            send_queue_size: config.server.send_queue_size,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    on_timeout: SessionError,
    fut: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .unwrap_or(Err(on_timeout)),
        None => fut.await,
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    id: u64,
    user_id: AtomicU64,
    conn_type: AtomicU8,
    peer_addr: Option<SocketAddr>,

    codec: RwLock<Codec>,
    codecs: CodecRegistry,
    keys: Mutex<KeyState>,

    recv: tokio::sync::Mutex<Option<RecvState>>,
    writer: tokio::sync::Mutex<Option<BoxWrite>>,
    send_tx: Option<mpsc::Sender<Queued>>,

    closed: AtomicBool,
    waiting: AtomicBool,
    cancel: CancellationToken,

    manager: Weak<Manager>,
    settings: SessionSettings,
}

impl Session {
    /// Wrap a connection and start its send worker when a queue is configured.
    pub(crate) fn spawn<S>(
        id: u64,
        stream: S,
        peer_addr: Option<SocketAddr>,
        settings: SessionSettings,
        codecs: CodecRegistry,
        manager: Weak<Manager>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let (send_tx, send_rx) = match settings.send_queue_size {
            0 => (None, None),
            n => {
                let (tx, rx) = mpsc::channel(n);
                (Some(tx), Some(rx))
            }
        };

        let session = Arc::new(Self {
            id,
            user_id: AtomicU64::new(0),
            conn_type: AtomicU8::new(ConnType::Tcp as u8),
            peer_addr,
            codec: RwLock::new(codecs.get(ConnType::Tcp)),
            codecs,
            keys: Mutex::new(KeyState::default()),
            recv: tokio::sync::Mutex::new(Some(RecvState::new(
                Box::new(read) as BoxRead,
                settings.max_msg_size,
            ))),
            writer: tokio::sync::Mutex::new(Some(Box::new(write) as BoxWrite)),
            send_tx,
            closed: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            manager,
            settings,
        });

        if let Some(rx) = send_rx {
            let worker = SendWorker::new(Arc::downgrade(&session), rx, session.cancel.clone());
            tokio::spawn(worker.run());
        }
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// 0 until the session is bound to a user.
    pub fn user_id(&self) -> u64 {
        self.user_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_user_id(&self, uid: u64) {
        self.user_id.store(uid, Ordering::Release);
    }

    pub fn conn_type(&self) -> ConnType {
        ConnType::from_u8(self.conn_type.load(Ordering::Acquire))
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn codec(&self) -> Codec {
        *self.codec.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub(crate) fn mark_waiting(&self) {
        self.waiting.store(true, Ordering::Release);
    }

    fn set_conn_type(&self, conn_type: ConnType) {
        self.conn_type.store(conn_type as u8, Ordering::Release);
        *self.codec.write() = self.codecs.get(conn_type);
    }

    // ── Keys ──────────────────────────────────────────────────────────────────

    /// Install the secret negotiated by the authentication layer. Once set it
    /// never changes.
    pub fn set_share_key(
        &self,
        key_id: [u8; KEY_ID_LEN],
        share_key: ShareKey,
    ) -> Result<(), SessionError> {
        self.keys.lock().set_share_key(key_id, share_key)?;
        tracing::debug!(
            session_id = self.id,
            key_id = hex::encode(key_id),
            "share key installed"
        );
        Ok(())
    }

    /// Key id announced by the peer, or installed with the share key.
    pub fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.keys.lock().key_id()
    }

    pub fn has_share_key(&self) -> bool {
        self.keys.lock().has_share_key()
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    /// Sniff the transport and pick the codec. Must run before the first
    /// receive. A WebSocket upgrade is answered here. The read deadline
    /// covers the whole sniff, including the wait for the first byte.
    pub async fn init_codec(&self) -> Result<ConnType, SessionError> {
        match self.init_codec_inner().await {
            Ok(conn_type) => {
                tracing::debug!(
                    session_id = self.id,
                    peer = ?self.peer_addr,
                    conn_type = %conn_type,
                    "transport detected"
                );
                Ok(conn_type)
            }
            Err(e) => {
                tracing::debug!(session_id = self.id, error = %e, "transport detection failed");
                let _ = self.close().await;
                Err(e)
            }
        }
    }

    async fn init_codec_inner(&self) -> Result<ConnType, SessionError> {
        let transport = {
            let mut guard = self.recv.lock().await;
            let recv = guard.as_mut().ok_or(SessionError::Closed)?;
            let read_deadline = self.settings.read_deadline;
            // unlike receive, the wait for the first byte is not idle time
            let sniff = async {
                if !recv.reader.fill_if_empty().await? {
                    return Err(SessionError::Eof);
                }
                sniff_transport(&mut recv.reader).await
            };
            tokio::select! {
                _ = self.cancel.cancelled() => Err(SessionError::Closed),
                r = with_deadline(read_deadline, SessionError::ReadTimeout, sniff) => r,
            }
        }?;

        let conn_type = match transport {
            Transport::Tcp => ConnType::Tcp,
            Transport::Http => ConnType::Http,
            Transport::WebSocket { key } => {
                self.write_raw(upgrade_response(&key).as_bytes()).await?;
                ConnType::WebSocket
            }
            Transport::BadUpgrade(e) => {
                let _ = self.write_raw(bad_request_response().as_bytes()).await;
                return Err(e.into());
            }
        };
        self.set_conn_type(conn_type);
        Ok(conn_type)
    }

    /// Next application payload, decrypted. Any error closes the session.
    pub async fn receive(&self) -> Result<Bytes, SessionError> {
        let res = self.receive_inner().await;
        if let Err(e) = &res {
            if !matches!(e, SessionError::Closed) {
                tracing::debug!(session_id = self.id, error = %e, "receive failed, closing session");
            }
            let _ = self.close().await;
        }
        res
    }

    async fn receive_inner(&self) -> Result<Bytes, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let codec = self.codec();
        let (res, replies, close_sent) = {
            let mut guard = self.recv.lock().await;
            let recv = guard.as_mut().ok_or(SessionError::Closed)?;
            let settings = &self.settings;
            let read = async {
                // idle until the peer starts a message; the deadline covers
                // the message itself
                if !recv.reader.fill_if_empty().await? {
                    return Err(SessionError::Eof);
                }
                with_deadline(
                    settings.read_deadline,
                    SessionError::ReadTimeout,
                    codec.read_envelope(recv, settings.max_msg_size),
                )
                .await
            };
            let res = tokio::select! {
                _ = self.cancel.cancelled() => Err(SessionError::Closed),
                r = read => r,
            };
            let replies = recv.ws.take_replies();
            (res, replies, recv.ws.close_sent())
        };

        for frame in replies {
            if let Err(e) = self.write_raw(&frame).await {
                if res.is_ok() {
                    return Err(e);
                }
                break;
            }
        }
        if close_sent {
            self.mark_waiting();
        }

        let envelope = res?;
        let payload = self.keys.lock().open(envelope)?;
        Ok(payload)
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    /// Queue a message, or write it directly when the session has no queue.
    pub async fn send(&self, msg: OutMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.is_waiting() && matches!(msg, OutMessage::Payload(_)) {
            return Err(SessionError::Waiting);
        }
        match &self.send_tx {
            Some(tx) => tx.try_send(Queued::Message(msg)).map_err(|e| match e {
                TrySendError::Full(_) => SessionError::Blocked,
                TrySendError::Closed(_) => SessionError::Closed,
            }),
            None => {
                let res = self.write_message(&msg).await;
                if let Err(e) = &res {
                    if !matches!(e, SessionError::Closed) {
                        tracing::debug!(session_id = self.id, error = %e, "send failed, closing session");
                        let _ = self.close().await;
                    }
                }
                res
            }
        }
    }

    /// Shorthand for sending an application payload.
    pub async fn send_payload(&self, payload: Bytes) -> Result<(), SessionError> {
        self.send(OutMessage::Payload(payload)).await
    }

    /// Pack with the current codec and write.
    pub(crate) async fn write_message(&self, msg: &OutMessage) -> Result<(), SessionError> {
        let codec = self.codec();
        let bytes = codec.pack(msg, &self.keys.lock())?;
        self.write_raw(&bytes).await
    }

    /// Write bytes verbatim under the write deadline.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await?;
            Ok::<(), SessionError>(())
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Closed),
            r = with_deadline(self.settings.write_deadline, SessionError::WriteTimeout, write) => r,
        }
    }

    // ── Close ─────────────────────────────────────────────────────────────────

    /// Tear the session down. Unblocks pending reads and writes, shuts the
    /// connection and leaves the manager. Only the first call does anything.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::AlreadyClosed);
        }
        self.mark_waiting();
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let shutdown = async {
                writer.shutdown().await?;
                Ok::<(), SessionError>(())
            };
            let _ = with_deadline(self.settings.write_deadline, SessionError::WriteTimeout, shutdown).await;
        }
        let recv = self.recv.lock().await.take();
        drop(recv);

        if let Some(manager) = self.manager.upgrade() {
            manager.release(self);
        }
        tracing::debug!(
            session_id = self.id,
            user_id = self.user_id(),
            conn_type = %self.conn_type(),
            "session closed"
        );
        Ok(())
    }

    /// Stop taking payloads, write out everything already accepted followed
    /// by a WebSocket close frame (other transports have none), then close.
    pub async fn close_with(&self, code: u16, reason: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::AlreadyClosed);
        }
        let was_waiting = self.waiting.swap(true, Ordering::AcqRel);
        let last = (self.conn_type() == ConnType::WebSocket && !was_waiting)
            .then(|| OutMessage::Raw(close_frame(code, reason)));
        if let Err(e) = self.drain(last).await {
            tracing::debug!(session_id = self.id, error = %e, "send queue not drained");
        }
        self.close().await
    }

    /// Wait until the send queue is empty, optionally appending `last` first.
    async fn drain(&self, last: Option<OutMessage>) -> Result<(), SessionError> {
        let Some(tx) = &self.send_tx else {
            return match last {
                Some(msg) => self.write_message(&msg).await,
                None => Ok(()),
            };
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        let flush = async {
            if let Some(msg) = last {
                tx.send(Queued::Message(msg))
                    .await
                    .map_err(|_| SessionError::Closed)?;
            }
            tx.send(Queued::Flush(ack_tx))
                .await
                .map_err(|_| SessionError::Closed)?;
            // dropped unanswered when the worker stops early
            ack_rx.await.map_err(|_| SessionError::Closed)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Closed),
            r = flush => r,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("conn_type", &self.conn_type())
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
