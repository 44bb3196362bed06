//! Server — TCP listener, accept backoff and the per-session serve loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chatgate_core::config::GatewayConfig;

use crate::error::ServerError;
use crate::manager::Manager;
use crate::session::Session;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// Linux errno values for file-table exhaustion.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// Consumer of decoded payloads. Routing and business logic live behind
/// this seam.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        session: &Arc<Session>,
        payload: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    manager: Arc<Manager>,
    stop: CancellationToken,
}

impl Server {
    /// Bind the configured address with a fresh manager.
    pub async fn bind(config: &GatewayConfig) -> Result<Self, ServerError> {
        Self::bind_with(&config.server.addr, Manager::new(config)).await
    }

    pub async fn bind_with(addr: &str, manager: Arc<Manager>) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        Ok(Self {
            listener,
            local_addr,
            manager,
            stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Next connection, wrapped in a session. Transient accept errors are
    /// retried with exponential backoff; `Stopped` means a clean shutdown.
    pub async fn accept(&self) -> Result<Arc<Session>, ServerError> {
        let mut delay = Duration::ZERO;
        loop {
            let res = tokio::select! {
                _ = self.stop.cancelled() => return Err(ServerError::Stopped),
                r = self.listener.accept() => r,
            };
            match res {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::trace!(%peer, error = %e, "set_nodelay failed");
                    }
                    // the manager only refuses once it is disposing
                    return self
                        .manager
                        .new_session(stream, Some(peer))
                        .map_err(|_| ServerError::Stopped);
                }
                Err(e) if is_transient(&e) => {
                    delay = next_backoff(delay);
                    tracing::warn!(error = %e, retry_in = ?delay, "accept failed, backing off");
                    tokio::select! {
                        _ = self.stop.cancelled() => return Err(ServerError::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
    }

    /// Stop accepting and close every session.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.manager.dispose().await;
    }
}

fn next_backoff(delay: Duration) -> Duration {
    if delay.is_zero() {
        MIN_BACKOFF
    } else {
        (delay * 2).min(MAX_BACKOFF)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

/// Accept until the server stops, driving each session on its own task.
pub async fn serve<D: Dispatcher>(server: Arc<Server>, dispatcher: Arc<D>) -> Result<(), ServerError> {
    tracing::info!(addr = %server.local_addr(), "serving");
    loop {
        match server.accept().await {
            Ok(session) => {
                tokio::spawn(run_session(session, dispatcher.clone()));
            }
            Err(ServerError::Stopped) => {
                tracing::info!("server stopped");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_session<D: Dispatcher>(session: Arc<Session>, dispatcher: Arc<D>) {
    if session.init_codec().await.is_err() {
        return;
    }
    while !session.is_waiting() {
        let payload = match session.receive().await {
            Ok(p) => p,
            Err(_) => break,
        };
        if let Err(e) = dispatcher.dispatch(&session, payload).await {
            tracing::warn!(session_id = session.id(), error = %e, "dispatch failed");
        }
    }
    let _ = session.close().await;
}
