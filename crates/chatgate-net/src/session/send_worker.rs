//! Send worker — drains a session's outbound queue onto its socket.

use std::sync::Weak;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::OutMessage;
use crate::error::SessionError;

use super::Session;

/// Entry in a session's outbound queue.
pub(super) enum Queued {
    Message(OutMessage),
    /// Acknowledged once every entry ahead of it has been written.
    Flush(oneshot::Sender<()>),
}

pub(super) struct SendWorker {
    session: Weak<Session>,
    queue: mpsc::Receiver<Queued>,
    cancel: CancellationToken,
}

impl SendWorker {
    pub(super) fn new(
        session: Weak<Session>,
        queue: mpsc::Receiver<Queued>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            queue,
            cancel,
        }
    }

    /// Runs until the session closes or is dropped. The first write error
    /// closes the session. Entries still queued at close are dropped, which
    /// also releases any pending flush.
    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    tracing::trace!("send worker stopping");
                    return;
                }

                entry = self.queue.recv() => {
                    let msg = match entry {
                        None => return,
                        Some(Queued::Flush(ack)) => {
                            let _ = ack.send(());
                            continue;
                        }
                        Some(Queued::Message(msg)) => msg,
                    };
                    let Some(session) = self.session.upgrade() else {
                        return;
                    };
                    if let Err(e) = session.write_message(&msg).await {
                        if !matches!(e, SessionError::Closed) {
                            tracing::debug!(
                                session_id = session.id(),
                                error = %e,
                                "send failed, closing session"
                            );
                        }
                        let _ = session.close().await;
                        return;
                    }
                }
            }
        }
    }
}
