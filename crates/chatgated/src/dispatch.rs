//! Echo dispatcher — sends every payload straight back on its session.

use std::sync::Arc;

use bytes::Bytes;

use chatgate_net::{Dispatcher, Session, SessionError};

pub struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    async fn dispatch(&self, session: &Arc<Session>, payload: Bytes) -> anyhow::Result<()> {
        tracing::trace!(
            session_id = session.id(),
            conn_type = %session.conn_type(),
            len = payload.len(),
            "echo"
        );
        match session.send_payload(payload).await {
            // the peer is going away; not a dispatch failure
            Ok(()) | Err(SessionError::Waiting | SessionError::Closed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
