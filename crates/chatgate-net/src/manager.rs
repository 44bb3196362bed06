//! Manager — sharded registry of live sessions.
//!
//! Two registries, each split into independently locked shards:
//!
//!   sessions   session id → session                 (before authentication)
//!   users      user id → conn type → session        (after `bind_user`)
//!
//! A session sits in exactly one of them until it closes. Shard locks are
//! never held across an await; closing happens on snapshots taken outside
//! the lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use chatgate_core::config::GatewayConfig;

use crate::codec::CodecRegistry;
use crate::error::ManagerError;
use crate::session::{ConnType, Session, SessionSettings};

type SessionShard = Mutex<HashMap<u64, Arc<Session>>>;
type UserShard = Mutex<HashMap<u64, HashMap<ConnType, Arc<Session>>>>;

pub struct Manager {
    sessions: Vec<SessionShard>,
    users: Vec<UserShard>,
    next_id: AtomicU64,
    disposing: AtomicBool,
    /// Sessions created and not yet closed.
    live: watch::Sender<usize>,
    settings: SessionSettings,
    codecs: CodecRegistry,
}

impl Manager {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        Self::with_parts(
            config.manager.shards,
            SessionSettings::from_config(config),
            CodecRegistry::default(),
        )
    }

    /// A shard count of 0 is treated as 1.
    pub fn with_parts(shards: usize, settings: SessionSettings, codecs: CodecRegistry) -> Arc<Self> {
        let shards = shards.max(1);
        let (live, _) = watch::channel(0);
        Arc::new(Self {
            sessions: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            users: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            next_id: AtomicU64::new(1),
            disposing: AtomicBool::new(false),
            live,
            settings,
            codecs,
        })
    }

    fn session_shard(&self, id: u64) -> &SessionShard {
        &self.sessions[(id % self.sessions.len() as u64) as usize]
    }

    fn user_shard(&self, uid: u64) -> &UserShard {
        &self.users[(uid % self.users.len() as u64) as usize]
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    /// Wrap a new connection in a session and track it.
    pub fn new_session<S>(
        self: &Arc<Self>,
        stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<Arc<Session>, ManagerError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_disposing() {
            return Err(ManagerError::Disposed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::spawn(
            id,
            stream,
            peer_addr,
            self.settings.clone(),
            self.codecs.clone(),
            Arc::downgrade(self),
        );

        self.live.send_modify(|n| *n += 1);
        self.session_shard(id).lock().insert(id, session.clone());

        // dispose may have snapshotted this shard before the insert
        if self.is_disposing() {
            close_detached(session);
            return Err(ManagerError::Disposed);
        }

        tracing::trace!(session_id = id, peer = ?peer_addr, "session created");
        Ok(session)
    }

    /// Move an authenticated session into the user registry.
    ///
    /// Returns the session it displaced, if the user already had one on the
    /// same connection type. Closing it is the caller's decision; until then
    /// it stays tracked in the pre-authentication registry.
    pub fn bind_user(
        &self,
        session: &Arc<Session>,
        uid: u64,
    ) -> Result<Option<Arc<Session>>, ManagerError> {
        if uid == 0 {
            return Err(ManagerError::InvalidUser);
        }
        if session.is_closed() {
            return Err(ManagerError::SessionClosed);
        }
        match session.user_id() {
            0 => {}
            bound => return Err(ManagerError::AlreadyBound(bound)),
        }

        let id = session.id();
        self.session_shard(id).lock().remove(&id);
        session.set_user_id(uid);

        let displaced = self
            .user_shard(uid)
            .lock()
            .entry(uid)
            .or_default()
            .insert(session.conn_type(), session.clone());

        // a close racing the move may have looked in the old registry
        if session.is_closed() {
            self.remove_user_entry(session);
            return Err(ManagerError::SessionClosed);
        }
        if self.is_disposing() {
            close_detached(session.clone());
        }

        let displaced = displaced.filter(|old| !Arc::ptr_eq(old, session));
        if let Some(old) = &displaced {
            self.track_displaced(old);
        }

        tracing::debug!(session_id = id, user_id = uid, conn_type = %session.conn_type(), "session bound to user");
        Ok(displaced)
    }

    /// Keep a session pushed out of the user registry reachable by id and by
    /// `dispose` until it closes.
    fn track_displaced(&self, old: &Arc<Session>) {
        let id = old.id();
        self.session_shard(id).lock().insert(id, old.clone());

        // its release may already have run against the user registry
        if old.is_closed() {
            let mut shard = self.session_shard(id).lock();
            if shard.get(&id).is_some_and(|s| Arc::ptr_eq(s, old)) {
                shard.remove(&id);
            }
            return;
        }
        if self.is_disposing() {
            close_detached(old.clone());
        }
        tracing::debug!(session_id = id, user_id = old.user_id(), "session displaced");
    }

    /// Session by id, in either registry.
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        if let Some(s) = self.session_shard(id).lock().get(&id) {
            return Some(s.clone());
        }
        self.users.iter().find_map(|shard| {
            shard
                .lock()
                .values()
                .flat_map(|devices| devices.values())
                .find(|s| s.id() == id)
                .cloned()
        })
    }

    /// Every session bound to `uid`, one per connection type.
    pub fn user_sessions(&self, uid: u64) -> Vec<Arc<Session>> {
        self.user_shard(uid)
            .lock()
            .get(&uid)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Tracked sessions across both registries.
    pub fn len(&self) -> usize {
        let pre: usize = self.sessions.iter().map(|s| s.lock().len()).sum();
        let post: usize = self
            .users
            .iter()
            .map(|s| s.lock().values().map(HashMap::len).sum::<usize>())
            .sum();
        pre + post
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions created and not yet closed.
    pub fn live_count(&self) -> usize {
        *self.live.borrow()
    }

    /// Entries per pre-authentication shard.
    pub fn shard_lens(&self) -> Vec<usize> {
        self.sessions.iter().map(|s| s.lock().len()).collect()
    }

    /// Called by a session exactly once, from its close.
    pub(crate) fn release(&self, session: &Session) {
        let id = session.id();
        {
            let mut shard = self.session_shard(id).lock();
            if shard.get(&id).is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session)) {
                shard.remove(&id);
            }
        }
        self.remove_user_entry(session);
        self.live.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn remove_user_entry(&self, session: &Session) {
        let uid = session.user_id();
        if uid == 0 {
            return;
        }
        let mut shard = self.user_shard(uid).lock();
        if let Some(devices) = shard.get_mut(&uid) {
            let conn_type = session.conn_type();
            if devices
                .get(&conn_type)
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
            {
                devices.remove(&conn_type);
            }
            if devices.is_empty() {
                shard.remove(&uid);
            }
        }
    }

    /// Refuse new sessions, close every tracked one and wait until all have
    /// finished tearing down. Later calls only wait.
    pub async fn dispose(&self) {
        let first = !self.disposing.swap(true, Ordering::SeqCst);
        if first {
            let snapshot = self.snapshot();
            tracing::info!(sessions = snapshot.len(), "disposing session manager");
            for session in snapshot {
                let _ = session.close().await;
            }
        }
        let mut live = self.live.subscribe();
        let _ = live.wait_for(|n| *n == 0).await;
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut out: Vec<Arc<Session>> = Vec::new();
        for shard in &self.sessions {
            out.extend(shard.lock().values().cloned());
        }
        for shard in &self.users {
            out.extend(shard.lock().values().flat_map(|d| d.values().cloned()));
        }
        out
    }
}

fn close_detached(session: Arc<Session>) {
    tokio::spawn(async move {
        let _ = session.close().await;
    });
}
