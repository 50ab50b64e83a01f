use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use strand_net::NextProto;
use strand_net::address::Destination;
use strand_net::proxy::ProxyServer;

use crate::connect::MuxSession;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identity of a pooled multiplexed session: everything that makes a
/// session suitable for a request. Sessions over different transport
/// families (e.g. h2 vs h3) never share a slot.
pub struct SessionKey {
    pub destination: Destination,
    pub proxy: ProxyServer,
    pub family: NextProto,
}

type SharedSession = Arc<dyn MuxSession>;
type SessionSlot = watch::Receiver<Option<SharedSession>>;

#[derive(Default)]
struct PoolInner {
    sessions: HashMap<SessionKey, SharedSession>,
    /// IP-pooling aliases: a session established for one key may also
    /// serve these, as reported by the connector at insertion time.
    aliases: HashMap<SessionKey, SessionKey>,
    /// Keys a leader job is currently creating a session for.
    pending: HashMap<SessionKey, SessionSlot>,
}

/// Shared registry of live multiplexed sessions.
///
/// A connection job consults the pool before doing any socket or handshake
/// work: a live session is adopted outright, and a session being created by
/// another job is waited for instead of duplicated. Dead sessions are
/// dropped lazily on lookup.
pub struct SessionPool {
    inner: Mutex<PoolInner>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// A live session for `key`, when one is pooled.
    ///
    /// `allow_aliases` extends the match to IP-pooled aliases; it is turned
    /// off for the remainder of a request after a misdirected-request
    /// response.
    #[must_use]
    pub fn find(&self, key: &SessionKey, allow_aliases: bool) -> Option<SharedSession> {
        let mut inner = self.inner.lock();
        if let Some(session) = lookup_live(&mut inner.sessions, key) {
            return Some(session);
        }
        if allow_aliases
            && let Some(canonical) = inner.aliases.get(key).cloned()
        {
            return lookup_live(&mut inner.sessions, &canonical);
        }
        None
    }

    /// Adopt a live session, wait for one being created, or become the
    /// job responsible for creating it.
    #[must_use]
    pub fn claim(self: &Arc<Self>, key: SessionKey, allow_aliases: bool) -> SessionClaim {
        if let Some(session) = self.find(&key, allow_aliases) {
            trace!("session pool: adopting live session for {key:?}");
            return SessionClaim::Session(session);
        }

        let mut inner = self.inner.lock();
        if let Some(slot) = inner.pending.get(&key) {
            if slot.has_changed().is_ok() {
                trace!("session pool: session for {key:?} is being created, following");
                return SessionClaim::Pending(slot.clone());
            }
            // leader died without publishing
            inner.pending.remove(&key);
        }

        let (tx, rx) = watch::channel(None);
        inner.pending.insert(key.clone(), rx);
        trace!("session pool: no session for {key:?}, caller becomes creation leader");
        SessionClaim::Leader(CreateLease {
            pool: Arc::downgrade(self),
            key: Some(key),
            tx,
        })
    }

    fn insert(&self, key: SessionKey, session: SharedSession, aliases: Vec<SessionKey>) {
        let mut inner = self.inner.lock();
        for alias in aliases {
            inner.aliases.insert(alias, key.clone());
        }
        inner.sessions.insert(key, session);
    }

    fn clear_pending(&self, key: &SessionKey) {
        self.inner.lock().pending.remove(key);
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SessionPool")
            .field("sessions", &inner.sessions.keys())
            .field("pending", &inner.pending.keys())
            .finish()
    }
}

fn lookup_live(
    sessions: &mut HashMap<SessionKey, SharedSession>,
    key: &SessionKey,
) -> Option<SharedSession> {
    match sessions.get(key) {
        Some(session) if session.is_open() => Some(session.clone()),
        Some(_) => {
            trace!("session pool: dropping dead session for {key:?}");
            sessions.remove(key);
            None
        }
        None => None,
    }
}

/// Result of [`SessionPool::claim`].
pub enum SessionClaim {
    /// A live session was adopted.
    Session(SharedSession),
    /// The caller is responsible for creating the session; publish it (or
    /// drop the lease) so followers stop waiting.
    Leader(CreateLease),
    /// Another job is creating the session; await it via [`await_session`].
    Pending(SessionSlot),
}

/// Exclusive right to create the pooled session for one key.
pub struct CreateLease {
    pool: std::sync::Weak<SessionPool>,
    key: Option<SessionKey>,
    tx: watch::Sender<Option<SharedSession>>,
}

impl CreateLease {
    /// Publish the created session: it becomes pooled and every follower
    /// adopts it.
    pub fn publish(mut self, session: SharedSession, aliases: Vec<SessionKey>) {
        let Some(key) = self.key.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.insert(key.clone(), session.clone(), aliases);
            pool.clear_pending(&key);
        }
        let _ = self.tx.send(Some(session));
    }
}

impl Drop for CreateLease {
    fn drop(&mut self) {
        // dropped without publishing: wake followers so they retry on
        // their own rather than wait forever
        if let Some(key) = self.key.take()
            && let Some(pool) = self.pool.upgrade()
        {
            pool.clear_pending(&key);
        }
    }
}

/// Wait for a pending session to be published; `None` when its creation
/// leader failed.
pub async fn await_session(mut slot: SessionSlot) -> Option<SharedSession> {
    loop {
        if let Some(session) = slot.borrow().clone() {
            return Some(session);
        }
        if slot.changed().await.is_err() {
            return slot.borrow().clone();
        }
    }
}
