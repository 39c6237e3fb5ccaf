use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {async_trait::async_trait, bytes::Bytes, tokio::net::TcpStream};

use crate::error::TransportError;

pub type SessionId = u64;

/// Frame payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    #[default]
    None,
    /// Raw deflate.
    Zip,
}

/// The connection underneath a session.
#[derive(Debug)]
pub enum Conn<'a> {
    Tcp(&'a TcpStream),
    /// Any other stream kind, named for diagnostics.
    Other(&'static str),
}

// ── Settings ─────────────────────────────────────────────────────────────────

/// Values a session falls back to when its hook leaves them untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub name: String,
    pub compress: CompressType,
    pub max_msg_len: usize,
    pub rq_len: usize,
    pub wq_len: usize,
    /// Zero disables the deadline.
    pub read_timeout: Duration,
    /// Zero disables the deadline.
    pub write_timeout: Duration,
    /// Zero disables housekeeping.
    pub cron_period: Duration,
    pub wait_time: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name: "session".into(),
            compress: CompressType::None,
            max_msg_len: 4096,
            rq_len: 64,
            wq_len: 64,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            cron_period: Duration::ZERO,
            wait_time: Duration::from_secs(1),
        }
    }
}

// ── Runtime view ─────────────────────────────────────────────────────────────

/// Runtime view of an open session, shared with handlers and listeners.
#[derive(Debug)]
pub struct SessionInfo {
    id: SessionId,
    name: String,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    opened_at: Instant,
    /// Milliseconds after `opened_at` of the last inbound frame.
    last_active_ms: AtomicU64,
}

impl SessionInfo {
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer,
            local,
            opened_at: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let now = self.opened_at.elapsed().as_millis() as u64;
        self.last_active_ms.store(now, Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since open).
    pub fn idle_for(&self) -> Duration {
        let now = self.opened_at.elapsed().as_millis() as u64;
        let last = self.last_active_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn stat(&self) -> String {
        format!(
            "session{{id:{}, name:{}, peer:{}}}",
            self.id,
            self.name,
            self.peer.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        )
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// A freshly accepted connection, configurable until it starts running.
pub trait Session: Send {
    fn id(&self) -> SessionId;
    fn stat(&self) -> String;
    fn conn(&self) -> Conn<'_>;

    fn set_compress_type(&mut self, compress: CompressType);
    fn set_name(&mut self, name: &str);
    fn set_max_msg_len(&mut self, len: usize);
    fn set_pkg_handler(&mut self, handler: Arc<dyn PackageHandler>);
    fn set_event_listener(&mut self, listener: Arc<dyn EventListener>);
    fn set_rq_len(&mut self, len: usize);
    fn set_wq_len(&mut self, len: usize);
    fn set_read_timeout(&mut self, timeout: Duration);
    fn set_write_timeout(&mut self, timeout: Duration);
    fn set_cron_period(&mut self, period: Duration);
    fn set_wait_time(&mut self, wait: Duration);
}

/// Turns one inbound payload into an optional reply payload. Calls on one
/// session are sequential, in receipt order.
#[async_trait]
pub trait PackageHandler: Send + Sync {
    async fn handle(&self, session: &SessionInfo, payload: Bytes) -> Option<Bytes>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronAction {
    Keep,
    Close,
}

/// Session lifecycle callbacks.
pub trait EventListener: Send + Sync {
    /// Refusing here closes the connection before any frame is read.
    fn on_open(&self, session: &SessionInfo) -> Result<(), TransportError>;
    fn on_close(&self, session: &SessionInfo);
    fn on_error(&self, session: &SessionInfo, error: &TransportError);
    /// Called every cron period.
    fn on_cron(&self, session: &SessionInfo) -> CronAction;
}

/// Invoked once per accepted connection, before it runs.
pub trait SessionHook: Send + Sync {
    fn on_new_session(&self, session: &mut dyn Session) -> Result<(), TransportError>;
}

impl<F> SessionHook for F
where
    F: Fn(&mut dyn Session) -> Result<(), TransportError> + Send + Sync,
{
    fn on_new_session(&self, session: &mut dyn Session) -> Result<(), TransportError> {
        self(session)
    }
}

/// A bound endpoint with a running accept loop.
#[async_trait]
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting and wait for every session to finish.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn listen(
        &self,
        addr: &str,
        hook: Arc<dyn SessionHook>,
    ) -> Result<Arc<dyn Listener>, TransportError>;
}
