use std::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use {
    dashmap::DashMap,
    tracing::{debug, info, warn},
};

use ferry_transport::{CronAction, EventListener, SessionId, SessionInfo, TransportError};

/// An open session as seen by the server.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub peer: Option<SocketAddr>,
    pub opened_at: Instant,
}

/// Server-wide session bookkeeping: caps the number of open sessions and
/// closes sessions idle longer than `idle_timeout`. One instance is shared by
/// every listener of a server.
pub struct RpcEventListener {
    limit: usize,
    idle_timeout: Duration,
    active: AtomicUsize,
    sessions: DashMap<SessionId, SessionEntry>,
}

impl RpcEventListener {
    /// A `limit` of zero means unlimited; a zero `idle_timeout` never
    /// expires sessions.
    pub fn new(limit: usize, idle_timeout: Duration) -> Self {
        Self {
            limit,
            idle_timeout,
            active: AtomicUsize::new(0),
            sessions: DashMap::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn session(&self, id: SessionId) -> Option<SessionEntry> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }
}

impl EventListener for RpcEventListener {
    fn on_open(&self, session: &SessionInfo) -> Result<(), TransportError> {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if self.limit > 0 && previous >= self.limit {
            self.active.fetch_sub(1, Ordering::SeqCst);
            warn!(session = %session.stat(), limit = self.limit, "session limit reached, refusing");
            return Err(TransportError::SessionLimit { limit: self.limit });
        }
        self.sessions.insert(session.id(), SessionEntry {
            peer: session.peer(),
            opened_at: session.opened_at(),
        });
        debug!(session = %session.stat(), active = previous + 1, "session opened");
        Ok(())
    }

    fn on_close(&self, session: &SessionInfo) {
        if self.sessions.remove(&session.id()).is_some() {
            let previous = self.active.fetch_sub(1, Ordering::SeqCst);
            debug!(session = %session.stat(), active = previous - 1, "session closed");
        }
    }

    fn on_error(&self, session: &SessionInfo, error: &TransportError) {
        info!(session = %session.stat(), error = %error, "session error");
    }

    fn on_cron(&self, session: &SessionInfo) -> CronAction {
        if self.idle_timeout.is_zero() {
            return CronAction::Keep;
        }
        let idle = session.idle_for();
        if idle > self.idle_timeout {
            info!(session = %session.stat(), idle = ?idle, "closing idle session");
            return CronAction::Close;
        }
        CronAction::Keep
    }
}
